//! Import sources: where raw bytes come from
//!
//! Every source resolves the profile's file selection into a list of
//! [`SourceFile`]s, lists candidates without consuming them, archives
//! consumed files when it can, and answers a reachability probe.

pub mod ftp;
pub mod http;
pub mod local;
pub mod remote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use std::sync::Arc;

use crate::config::{FileSelection, SecretDecryptor, SourceConfig, SourceKind};
use crate::error::{ImportError, Result};
use crate::models::{FileInfo, SourceFile};

pub use self::ftp::{FtpClient, FtpConfig};
pub use self::http::HttpSource;
pub use self::local::LocalSource;
pub use self::remote::{RemoteFileClient, RemoteSource};

/// Outcome of a connectivity probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub message: String,
}

impl ProbeResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ImportSource: Send + Sync {
    /// Resolve the configured selection into consumable files
    async fn fetch(&self, config: &SourceConfig) -> Result<Vec<SourceFile>>;

    /// Existing candidates, payload untouched
    async fn list_files(&self, config: &SourceConfig) -> Result<Vec<FileInfo>>;

    /// Move a consumed file out of the active set; `false` when unsupported
    async fn archive(&self, config: &SourceConfig, identifier: &str) -> Result<bool>;

    async fn test(&self, config: &SourceConfig) -> ProbeResult;
}

/// Builds the source for a profile's source type
///
/// The SFTP transport is not built in; register one with
/// [`SourceRegistry::with_sftp_client`].
#[derive(Clone)]
pub struct SourceRegistry {
    decryptor: Arc<dyn SecretDecryptor>,
    sftp: Option<Arc<dyn RemoteFileClient>>,
}

impl SourceRegistry {
    pub fn new(decryptor: Arc<dyn SecretDecryptor>) -> Self {
        Self {
            decryptor,
            sftp: None,
        }
    }

    pub fn with_sftp_client(mut self, client: Arc<dyn RemoteFileClient>) -> Self {
        self.sftp = Some(client);
        self
    }

    pub fn for_config(&self, config: &SourceConfig) -> Result<Box<dyn ImportSource>> {
        match config.kind {
            SourceKind::Local => Ok(Box::new(LocalSource::new())),
            SourceKind::Http => Ok(Box::new(HttpSource::new(
                config,
                self.decryptor.as_ref(),
            )?)),
            SourceKind::Ftp => {
                let remote = config
                    .remote
                    .as_ref()
                    .ok_or_else(|| ImportError::config("source.remote is required for FTP"))?;
                let ftp = FtpConfig::from_remote(remote, self.decryptor.as_ref())?;
                Ok(Box::new(RemoteSource::new(Arc::new(FtpClient::new(ftp)))))
            },
            SourceKind::Sftp => {
                let client = self.sftp.clone().ok_or_else(|| {
                    ImportError::config("No SFTP transport registered for this process")
                })?;
                Ok(Box::new(RemoteSource::new(client)))
            },
        }
    }
}

// ============================================================================
// Selection helpers shared by local and remote sources
// ============================================================================

/// Directory and file-name glob for a configured path
///
/// `path` may be a plain file, a directory (paired with `pattern`), or a path
/// whose final segment is itself a glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileSpec {
    pub directory: String,
    pub pattern: String,
}

pub(crate) fn split_pattern(path: &str, pattern: Option<&str>) -> FileSpec {
    if let Some(pattern) = pattern.filter(|p| !p.is_empty()) {
        return FileSpec {
            directory: path.trim_end_matches('/').to_string(),
            pattern: pattern.to_string(),
        };
    }

    match path.rfind('/') {
        Some(idx) => FileSpec {
            directory: if idx == 0 { "/".to_string() } else { path[..idx].to_string() },
            pattern: path[idx + 1..].to_string(),
        },
        None => FileSpec {
            directory: ".".to_string(),
            pattern: path.to_string(),
        },
    }
}

pub(crate) fn has_glob(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}

pub(crate) fn matcher(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ImportError::config(format!("Invalid file pattern '{}': {}", pattern, e)))
}

/// Apply the selection mode to matched files
pub(crate) fn select(mut files: Vec<FileInfo>, selection: FileSelection) -> Vec<FileInfo> {
    fn modified(info: &FileInfo) -> DateTime<Utc> {
        info.last_modified.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    files.sort_by(|a, b| modified(a).cmp(&modified(b)).then_with(|| a.name.cmp(&b.name)));

    match selection {
        FileSelection::All => files,
        FileSelection::Oldest => files.into_iter().take(1).collect(),
        FileSelection::Latest => files.pop().into_iter().collect(),
    }
}

/// `orders.csv` -> `orders_20260118093000.csv`
pub(crate) fn archived_name(name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d%H%M%S");
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}_{}{}", &name[..idx], stamp, &name[idx..]),
        _ => format!("{}_{}", name, stamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info(name: &str, minute: u32) -> FileInfo {
        FileInfo {
            identifier: format!("/in/{}", name),
            name: name.to_string(),
            size: None,
            last_modified: Some(Utc.with_ymd_and_hms(2026, 1, 18, 9, minute, 0).unwrap()),
        }
    }

    #[test]
    fn test_split_pattern() {
        assert_eq!(
            split_pattern("/in/orders_*.csv", None),
            FileSpec {
                directory: "/in".to_string(),
                pattern: "orders_*.csv".to_string()
            }
        );
        assert_eq!(split_pattern("/in/", Some("*.json")).directory, "/in");
    }

    #[test]
    fn test_selection_modes() {
        let files = vec![info("b.csv", 5), info("a.csv", 1), info("c.csv", 9)];
        assert_eq!(select(files.clone(), FileSelection::Latest)[0].name, "c.csv");
        assert_eq!(select(files.clone(), FileSelection::Oldest)[0].name, "a.csv");
        let all: Vec<_> = select(files, FileSelection::All).into_iter().map(|f| f.name).collect();
        assert_eq!(all, vec!["a.csv", "b.csv", "c.csv"]);
    }

    #[test]
    fn test_archived_name() {
        let at = Utc.with_ymd_and_hms(2026, 1, 18, 9, 30, 0).unwrap();
        assert_eq!(archived_name("orders.csv", at), "orders_20260118093000.csv");
        assert_eq!(archived_name("README", at), "README_20260118093000");
    }

    #[test]
    fn test_sftp_requires_registered_transport() {
        let registry = SourceRegistry::new(Arc::new(crate::config::PlainTextDecryptor));
        let config = SourceConfig {
            kind: SourceKind::Sftp,
            path: Some("/in/a.csv".to_string()),
            pattern: None,
            selection: FileSelection::Latest,
            archive_path: None,
            remote: None,
            http: None,
        };
        assert!(matches!(
            registry.for_config(&config),
            Err(ImportError::Configuration(_))
        ));
    }
}
