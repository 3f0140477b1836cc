//! Local file target: CSV, JSON array or JSON-Lines

use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ImportTarget, ImportWriteContext, TargetRow};
use crate::config::{FileWriteMode, LocalFileFormat, LocalFileTargetConfig};
use crate::error::{ImportError, Result};
use crate::models::{ImportBatchResult, Row, TargetColumnInfo};
use crate::source::ProbeResult;

pub struct LocalFileTarget {
    config: LocalFileTargetConfig,
    /// Overwrite mode truncates on the first write of an execution only
    truncated: AtomicBool,
    write_lock: Mutex<()>,
}

impl LocalFileTarget {
    pub fn new(config: LocalFileTargetConfig) -> Self {
        Self {
            config,
            truncated: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn format(&self) -> LocalFileFormat {
        resolve_format(&self.config)
    }

    async fn write(&self, rows: &[TargetRow], truncate: bool) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let path = PathBuf::from(&self.config.path);
        let format = self.format();
        let delimiter = delimiter_for(&self.config)?;
        let rows: Vec<Row> = rows.iter().map(|r| r.values.clone()).collect();
        let count = rows.len() as u64;

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            match format {
                LocalFileFormat::Json => write_json(&path, &rows, truncate),
                LocalFileFormat::JsonLines => write_json_lines(&path, &rows, truncate),
                LocalFileFormat::Csv | LocalFileFormat::Auto => write_csv(&path, &rows, truncate, delimiter),
            }
        })
        .await??;

        Ok(count)
    }

    fn take_truncate(&self) -> bool {
        self.config.mode == FileWriteMode::Overwrite && !self.truncated.swap(true, Ordering::SeqCst)
    }
}

fn resolve_format(config: &LocalFileTargetConfig) -> LocalFileFormat {
    if config.format != LocalFileFormat::Auto {
        return config.format;
    }
    let extension = Path::new(&config.path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "json" => LocalFileFormat::Json,
        "jsonl" | "ndjson" => LocalFileFormat::JsonLines,
        _ => LocalFileFormat::Csv,
    }
}

fn delimiter_for(config: &LocalFileTargetConfig) -> Result<u8> {
    let delimiter = match config.delimiter {
        Some(d) => d,
        None if config.path.to_ascii_lowercase().ends_with(".tsv") => '\t',
        None => ',',
    };
    u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| ImportError::config(format!("target.file.delimiter '{}' must be ASCII", delimiter)))
}

fn existing_content(path: &Path, truncate: bool) -> bool {
    !truncate && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn write_csv(path: &Path, rows: &[Row], truncate: bool, delimiter: u8) -> Result<()> {
    let appending = existing_content(path, truncate);

    let header: Vec<String> = if appending {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_path(path)?;
        reader.headers()?.iter().map(str::to_string).collect()
    } else {
        let mut columns: Vec<String> = Vec::new();
        for row in rows {
            for column in row.columns() {
                if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                }
            }
        }
        columns
    };

    let dropped: Vec<&str> = rows
        .iter()
        .flat_map(|r| r.columns())
        .filter(|c| !header.iter().any(|h| h.eq_ignore_ascii_case(c)))
        .collect();
    if !dropped.is_empty() {
        warn!(file = %path.display(), columns = ?dropped, "Columns missing from existing header are not written");
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(appending)
        .truncate(!appending)
        .open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(BufWriter::new(file));

    if !appending {
        writer.write_record(&header)?;
    }
    for row in rows {
        writer.write_record(
            header
                .iter()
                .map(|h| row.get_ci(h).and_then(|v| v.to_text()).unwrap_or_default()),
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json(path: &Path, rows: &[Row], truncate: bool) -> Result<()> {
    let mut items: Vec<serde_json::Value> = if existing_content(path, truncate) {
        let existing: serde_json::Value = serde_json::from_reader(File::open(path)?)?;
        match existing {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        }
    } else {
        Vec::new()
    };
    items.extend(rows.iter().map(Row::to_json));

    // Rewrite through a sibling file so a failed write keeps the old content
    let staging = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&staging)?);
        serde_json::to_writer_pretty(&mut writer, &items)?;
        writer.flush()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}

fn write_json_lines(path: &Path, rows: &[Row], truncate: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!truncate)
        .truncate(truncate)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, &row.to_json())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl ImportTarget for LocalFileTarget {
    async fn write_batch(
        &self,
        _ctx: &ImportWriteContext,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<ImportBatchResult> {
        if cancel.is_cancelled() {
            return Ok(ImportBatchResult {
                cancelled: true,
                ..Default::default()
            });
        }
        if rows.is_empty() {
            return Ok(ImportBatchResult::default());
        }

        let truncate = self.take_truncate();
        let written = self.write(rows, truncate).await?;
        info!(file = %self.config.path, rows = written, "Wrote rows to file");
        Ok(ImportBatchResult {
            inserted: written,
            ..Default::default()
        })
    }

    async fn full_replace(
        &self,
        _ctx: &ImportWriteContext,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<ImportBatchResult> {
        if cancel.is_cancelled() {
            return Ok(ImportBatchResult {
                cancelled: true,
                ..Default::default()
            });
        }

        self.truncated.store(true, Ordering::SeqCst);
        let written = self.write(rows, true).await?;
        info!(file = %self.config.path, rows = written, "Replaced file content");
        Ok(ImportBatchResult {
            inserted: written,
            ..Default::default()
        })
    }

    async fn apply_deletes(&self, _ctx: &ImportWriteContext, keys: &[String], _key_column: &str) -> Result<u64> {
        if !keys.is_empty() {
            warn!(
                file = %self.config.path,
                keys = keys.len(),
                "File targets do not support deletes, ignoring"
            );
        }
        Ok(0)
    }

    async fn get_table_schema(&self, _ctx: &ImportWriteContext) -> Result<Vec<TargetColumnInfo>> {
        Ok(Vec::new())
    }

    async fn test(&self, _ctx: &ImportWriteContext) -> ProbeResult {
        let path = Path::new(&self.config.path);
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        match fs::metadata(directory) {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => {
                ProbeResult::ok(format!("{} is writable", directory.display()))
            },
            Ok(_) => ProbeResult::failed(format!("{} is not a writable directory", directory.display())),
            Err(e) => ProbeResult::failed(format!("{}: {}", directory.display(), e)),
        }
    }
}
