//! Remote file sources (FTP, SFTP) over a pluggable transport

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{archived_name, matcher, select, split_pattern, ImportSource, ProbeResult};
use crate::config::SourceConfig;
use crate::error::{ImportError, Result};
use crate::models::{FileInfo, SourceFile};

/// Byte transport to a remote file server
///
/// Implementations only move bytes; selection and archive policy live in
/// [`RemoteSource`].
#[async_trait]
pub trait RemoteFileClient: Send + Sync {
    /// Plain files in `directory`; `identifier` is the full remote path
    async fn list(&self, directory: &str) -> Result<Vec<FileInfo>>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Connect, authenticate and return a short description of the server
    async fn ping(&self) -> Result<String>;
}

pub struct RemoteSource {
    client: Arc<dyn RemoteFileClient>,
}

impl RemoteSource {
    pub fn new(client: Arc<dyn RemoteFileClient>) -> Self {
        Self { client }
    }

    async fn matching(&self, config: &SourceConfig) -> Result<Vec<FileInfo>> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| ImportError::config("source.path is required"))?;
        let spec = split_pattern(path, config.pattern.as_deref());
        let glob = matcher(&spec.pattern)?;

        let files = self.client.list(&spec.directory).await?;
        Ok(files.into_iter().filter(|f| glob.is_match(&f.name)).collect())
    }
}

#[async_trait]
impl ImportSource for RemoteSource {
    async fn fetch(&self, config: &SourceConfig) -> Result<Vec<SourceFile>> {
        let matched = self.matching(config).await?;
        if matched.is_empty() {
            return Err(ImportError::config(format!(
                "No remote files found for '{}'",
                config.path.as_deref().unwrap_or_default()
            )));
        }

        let mut files = Vec::new();
        for info in select(matched, config.selection) {
            let bytes = self.client.download(&info.identifier).await?;
            info!(file = %info.identifier, bytes = bytes.len(), "Downloaded remote file");
            files.push(SourceFile::from_bytes(info, bytes));
        }
        Ok(files)
    }

    async fn list_files(&self, config: &SourceConfig) -> Result<Vec<FileInfo>> {
        let mut files = self.matching(config).await?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn archive(&self, config: &SourceConfig, identifier: &str) -> Result<bool> {
        let Some(archive_dir) = config.archive_path.as_deref() else {
            return Ok(false);
        };

        let name = identifier.rsplit('/').next().unwrap_or(identifier);
        let destination = format!(
            "{}/{}",
            archive_dir.trim_end_matches('/'),
            archived_name(name, Utc::now())
        );

        self.client.rename(identifier, &destination).await?;
        info!(from = %identifier, to = %destination, "Archived remote file");
        Ok(true)
    }

    async fn test(&self, _config: &SourceConfig) -> ProbeResult {
        match self.client.ping().await {
            Ok(message) => ProbeResult::ok(message),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileSelection, SourceKind};
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeServer {
        renames: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RemoteFileClient for FakeServer {
        async fn list(&self, directory: &str) -> Result<Vec<FileInfo>> {
            Ok(["orders_1.csv", "orders_2.csv", "readme.txt"]
                .iter()
                .enumerate()
                .map(|(i, name)| FileInfo {
                    identifier: format!("{}/{}", directory, name),
                    name: name.to_string(),
                    size: Some(10),
                    last_modified: Some(Utc.with_ymd_and_hms(2026, 1, 1 + i as u32, 0, 0, 0).unwrap()),
                })
                .collect())
        }

        async fn download(&self, path: &str) -> Result<Vec<u8>> {
            Ok(format!("id\n{}\n", path).into_bytes())
        }

        async fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.renames.lock().unwrap().push((from.to_string(), to.to_string()));
            Ok(())
        }

        async fn ping(&self) -> Result<String> {
            Ok("fake server ready".to_string())
        }
    }

    fn config() -> SourceConfig {
        SourceConfig {
            kind: SourceKind::Sftp,
            path: Some("/outbound/orders_*.csv".to_string()),
            pattern: None,
            selection: FileSelection::Latest,
            archive_path: Some("/outbound/done".to_string()),
            remote: None,
            http: None,
        }
    }

    #[tokio::test]
    async fn test_latest_remote_file_selected() {
        let source = RemoteSource::new(Arc::new(FakeServer::default()));
        let files = source.fetch(&config()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].identifier(), "/outbound/orders_2.csv");
    }

    #[tokio::test]
    async fn test_archive_renames_into_archive_dir() {
        let server = Arc::new(FakeServer::default());
        let source = RemoteSource::new(server.clone());
        assert!(source.archive(&config(), "/outbound/orders_1.csv").await.unwrap());

        let renames = server.renames.lock().unwrap();
        assert_eq!(renames[0].0, "/outbound/orders_1.csv");
        assert!(renames[0].1.starts_with("/outbound/done/orders_1_"));
    }

    #[tokio::test]
    async fn test_probe_reports_server() {
        let source = RemoteSource::new(Arc::new(FakeServer::default()));
        assert!(source.test(&config()).await.ok);
    }
}
