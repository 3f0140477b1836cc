//! FTP transport with retry and exponential backoff
//!
//! `suppaftp`'s blocking client runs on the blocking pool; every operation
//! opens its own session so a failed attempt never leaves state behind.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::time::Duration;
use suppaftp::FtpStream;
use tracing::{debug, info, warn};

use super::remote::RemoteFileClient;
use crate::config::{RemoteConfig, SecretDecryptor};
use crate::error::{ImportError, Result};
use crate::models::FileInfo;

/// Base delay before the first retry; doubled on every further attempt
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: "anonymous".to_string(),
            retries: 3,
            retry_delay: RETRY_BASE_DELAY,
        }
    }
}

impl FtpConfig {
    pub fn from_remote(remote: &RemoteConfig, decryptor: &dyn SecretDecryptor) -> Result<Self> {
        let password = match &remote.password {
            Some(secret) => decryptor.decrypt(secret)?,
            None => "anonymous".to_string(),
        };
        Ok(Self {
            host: remote.host.clone(),
            port: remote.port.unwrap_or(21),
            username: remote.username.clone(),
            password,
            retries: remote.retries.max(1),
            retry_delay: RETRY_BASE_DELAY,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Parsed line of a Unix-style `LIST` response
#[derive(Debug, Clone, PartialEq)]
pub struct FtpEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
}

impl FtpEntry {
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 file name.csv`
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return None;
        }

        let name = parts[8..].join(" ");
        if name == "." || name == ".." {
            return None;
        }

        Some(Self {
            name,
            is_directory: parts[0].starts_with('d'),
            size: parts[4].parse().ok(),
        })
    }
}

pub struct FtpClient {
    config: FtpConfig,
}

impl FtpClient {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    /// Run a blocking session closure, retrying with exponential backoff
    async fn with_retry<T, F>(&self, operation: &str, target: &str, session: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut FtpStream) -> anyhow::Result<T> + Clone + Send + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("FTP {} attempt {}/{} for: {}", operation, attempt, self.config.retries, target);

            let config = self.config.clone();
            let session = session.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut ftp = connect(&config)?;
                let result = session(&mut ftp);
                if let Err(e) = ftp.quit() {
                    warn!(error = %e, "FTP QUIT failed, dropping connection");
                }
                result
            })
            .await;

            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempt < self.config.retries => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "FTP {} attempt {}/{} failed: {:#}. Retrying in {:?}...",
                        operation, attempt, self.config.retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Ok(Err(e)) => {
                    return Err(ImportError::source(format!(
                        "FTP {} of {} failed after {} attempts: {:#}",
                        operation, target, attempt, e
                    )))
                },
                Err(e) => {
                    return Err(ImportError::source(format!("FTP {} task panicked: {}", operation, e)))
                },
            }
        }
    }
}

fn connect(config: &FtpConfig) -> anyhow::Result<FtpStream> {
    debug!(host = %config.host, port = config.port, "Opening FTP session");

    let mut ftp = FtpStream::connect(format!("{}:{}", config.host, config.port))
        .context("Failed to connect to FTP server")?;
    ftp.set_mode(suppaftp::Mode::ExtendedPassive);

    ftp.login(&config.username, &config.password)
        .context("FTP login failed")?;
    Ok(ftp)
}

fn join_path(directory: &str, name: &str) -> String {
    if directory.ends_with('/') {
        format!("{}{}", directory, name)
    } else {
        format!("{}/{}", directory, name)
    }
}

#[async_trait]
impl RemoteFileClient for FtpClient {
    async fn list(&self, directory: &str) -> Result<Vec<FileInfo>> {
        let dir = directory.to_string();
        let files = self
            .with_retry("LIST", directory, move |ftp| {
                let lines = ftp
                    .list(Some(dir.as_str()))
                    .with_context(|| format!("Failed to list directory: {}", dir))?;

                let mut files = Vec::new();
                for entry in lines.iter().filter_map(|line| FtpEntry::parse(line)) {
                    if entry.is_directory {
                        continue;
                    }
                    let identifier = join_path(&dir, &entry.name);
                    let last_modified = ftp
                        .mdtm(&identifier)
                        .ok()
                        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
                    files.push(FileInfo {
                        identifier,
                        name: entry.name,
                        size: entry.size,
                        last_modified,
                    });
                }
                Ok(files)
            })
            .await?;

        info!("Listed {} ({} files)", directory, files.len());
        Ok(files)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let remote = path.to_string();
        let data = self
            .with_retry("RETR", path, move |ftp| {
                ftp.transfer_type(suppaftp::types::FileType::Binary)
                    .context("Failed to set binary mode")?;

                let mut reader = ftp
                    .retr_as_buffer(&remote)
                    .with_context(|| format!("Failed to download file: {}", remote))?;

                let mut data = Vec::new();
                reader.read_to_end(&mut data).context("Failed to read file data")?;
                Ok(data)
            })
            .await?;

        info!(path = %path, bytes = data.len(), "Fetched remote file");
        Ok(data)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (source, destination) = (from.to_string(), to.to_string());
        self.with_retry("RNFR", from, move |ftp| {
            ftp.rename(&source, &destination)
                .with_context(|| format!("Failed to rename {} to {}", source, destination))
        })
        .await
    }

    async fn ping(&self) -> Result<String> {
        let host = self.config.host.clone();
        self.with_retry("PWD", &self.config.host, move |ftp| {
            let cwd = ftp.pwd().context("Failed to query working directory")?;
            Ok(format!("Connected to {} (cwd {})", host, cwd))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlainTextDecryptor;

    #[test]
    fn test_parse_file_entry() {
        let entry = FtpEntry::parse("-rw-r--r--   1 ftp ftp  123456 Jan 15 12:00 orders 2026.csv").unwrap();
        assert_eq!(entry.name, "orders 2026.csv");
        assert!(!entry.is_directory);
        assert_eq!(entry.size, Some(123456));
    }

    #[test]
    fn test_parse_directory_and_noise() {
        let entry = FtpEntry::parse("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 archive").unwrap();
        assert!(entry.is_directory);
        assert!(FtpEntry::parse("total 12").is_none());
        assert!(FtpEntry::parse("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 ..").is_none());
    }

    #[test]
    fn test_backoff_doubles() {
        let config = FtpConfig {
            retry_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_config_from_remote_defaults() {
        let remote = RemoteConfig {
            host: "ftp.example.com".to_string(),
            port: None,
            username: "reef".to_string(),
            password: Some("secret".to_string()),
            retries: 0,
        };
        let config = FtpConfig::from_remote(&remote, &PlainTextDecryptor).unwrap();
        assert_eq!(config.port, 21);
        assert_eq!(config.password, "secret");
        assert_eq!(config.retries, 1);
    }

    #[tokio::test]
    #[ignore] // Requires FTP server
    async fn test_list_live_server() {
        let client = FtpClient::new(FtpConfig::default());
        let files = client.list("/").await.unwrap();
        assert!(files.iter().all(|f| f.identifier.starts_with('/')));
    }
}
