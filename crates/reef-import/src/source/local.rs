//! Local disk source

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{archived_name, has_glob, matcher, select, split_pattern, ImportSource, ProbeResult};
use crate::config::SourceConfig;
use crate::error::{ImportError, Result};
use crate::models::{FileInfo, SourceFile};

#[derive(Debug, Clone, Default)]
pub struct LocalSource;

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

impl LocalSource {
    pub fn new() -> Self {
        Self
    }

    async fn file_info(path: &Path) -> Result<FileInfo> {
        let metadata = fs::metadata(path).await?;
        Ok(FileInfo {
            identifier: path.to_string_lossy().into_owned(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: Some(metadata.len()),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Every existing file the configuration points at
    async fn matching(config: &SourceConfig) -> Result<Vec<FileInfo>> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| ImportError::config("source.path is required"))?;

        let as_path = Path::new(path);
        if config.pattern.is_none() && is_file(as_path).await {
            return Ok(vec![Self::file_info(as_path).await?]);
        }

        let spec = if is_dir(as_path).await {
            split_pattern(path, Some(config.pattern.as_deref().unwrap_or("*")))
        } else if has_glob(path) || config.pattern.is_some() {
            split_pattern(path, config.pattern.as_deref())
        } else {
            return Ok(Vec::new());
        };

        let glob = matcher(&spec.pattern)?;
        let directory = Path::new(&spec.directory);
        if !is_dir(directory).await {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if glob.is_match(entry.file_name()) {
                files.push(Self::file_info(&entry.path()).await?);
            }
        }

        debug!(directory = %spec.directory, pattern = %spec.pattern, count = files.len(), "Matched local files");
        Ok(files)
    }
}

#[async_trait]
impl ImportSource for LocalSource {
    async fn fetch(&self, config: &SourceConfig) -> Result<Vec<SourceFile>> {
        let matched = Self::matching(config).await?;
        if matched.is_empty() {
            return Err(ImportError::config(format!(
                "No files found for source path '{}'",
                config.path.as_deref().unwrap_or_default()
            )));
        }

        let mut files = Vec::new();
        for info in select(matched, config.selection) {
            // Parsing reads synchronously on a blocking thread
            let handle = fs::File::open(&info.identifier).await?.into_std().await;
            info!(file = %info.identifier, size = ?info.size, "Fetched local file");
            files.push(SourceFile::new(info, Box::new(handle)));
        }
        Ok(files)
    }

    async fn list_files(&self, config: &SourceConfig) -> Result<Vec<FileInfo>> {
        let mut files = Self::matching(config).await?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn archive(&self, config: &SourceConfig, identifier: &str) -> Result<bool> {
        let Some(archive_dir) = config.archive_path.as_deref() else {
            return Ok(false);
        };

        let source = Path::new(identifier);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ImportError::source(format!("Cannot archive '{}'", identifier)))?;

        fs::create_dir_all(archive_dir).await?;
        let destination: PathBuf = Path::new(archive_dir).join(archived_name(&name, Utc::now()));

        if let Err(e) = fs::rename(source, &destination).await {
            // Rename fails across filesystems
            warn!(error = %e, "Rename failed, copying archive instead");
            fs::copy(source, &destination).await?;
            fs::remove_file(source).await?;
        }

        info!(from = %identifier, to = %destination.display(), "Archived source file");
        Ok(true)
    }

    async fn test(&self, config: &SourceConfig) -> ProbeResult {
        match Self::matching(config).await {
            Ok(files) if files.is_empty() => ProbeResult::failed(format!(
                "No files found for '{}'",
                config.path.as_deref().unwrap_or_default()
            )),
            Ok(files) => ProbeResult::ok(format!("Found {} file(s)", files.len())),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}
