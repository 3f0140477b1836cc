//! Shared fixtures for reef-import integration tests
//!
//! Database tests run against SQLite files in a temporary directory through
//! the same sqlx `Any` driver the SQL dialects use, so they need no server.

#![allow(dead_code)]

use anyhow::{Context, Result};
use reef_import::config::{
    ColumnMapping, DeltaSyncConfig, FailurePolicies, FormatConfig, ImportProfile, LoadStrategy, SourceConfig,
    SourceKind, TargetConfig, TargetKind,
};
use reef_import::models::{Row, Value};
use reef_import::target::TargetRow;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::path::{Path, PathBuf};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route test logs through the libtest capture
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reef_import=debug")),
            )
            .with_test_writer()
            .try_init();
    });
    reef_import::init();
}

/// A SQLite database file inside `dir`
pub fn sqlite_url(dir: &Path, name: &str) -> String {
    format!("sqlite://{}?mode=rwc", dir.join(name).display())
}

pub async fn sqlite_pool(url: &str) -> Result<AnyPool> {
    AnyPoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await
        .with_context(|| format!("Failed to open {}", url))
}

pub async fn execute(pool: &AnyPool, sql: &str) -> Result<()> {
    sqlx::query(sql).execute(pool).await?;
    Ok(())
}

pub async fn count(pool: &AnyPool, sql: &str) -> Result<i64> {
    use sqlx::Row as _;
    let row = sqlx::query(sql).fetch_one(pool).await?;
    Ok(row.try_get::<i64, _>(0)?)
}

pub async fn text(pool: &AnyPool, sql: &str) -> Result<Option<String>> {
    use sqlx::Row as _;
    let row = sqlx::query(sql).fetch_optional(pool).await?;
    Ok(match row {
        Some(row) => row.try_get::<Option<String>, _>(0)?,
        None => None,
    })
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Numbered target rows keyed by their `id` column
pub fn target_rows(rows: Vec<Row>) -> Vec<TargetRow> {
    rows.into_iter()
        .enumerate()
        .map(|(i, values)| {
            let key = values.get_ci("id").and_then(Value::to_text);
            let row = TargetRow::new(i as u64 + 2, values);
            match key {
                Some(key) => row.with_key(key),
                None => row,
            }
        })
        .collect()
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    Ok(path)
}

pub fn key_mapping(source: &str, target: &str) -> ColumnMapping {
    let mut mapping = ColumnMapping::new(source, target);
    mapping.is_key = true;
    mapping
}

/// CSV file source into a SQLite table
pub fn csv_to_sqlite_profile(source_path: &Path, database_url: &str, table: &str) -> ImportProfile {
    ImportProfile {
        id: "customers".to_string(),
        name: Some("Customer import".to_string()),
        source: SourceConfig {
            kind: SourceKind::Local,
            path: Some(source_path.display().to_string()),
            pattern: None,
            selection: Default::default(),
            archive_path: None,
            remote: None,
            http: None,
        },
        format: FormatConfig::default(),
        mappings: Vec::new(),
        target: TargetConfig {
            kind: TargetKind::Database,
            dialect: None,
            connection_string: Some(database_url.to_string()),
            connection_name: Some("local-sqlite".to_string()),
            table: table.to_string(),
            load_strategy: LoadStrategy::Upsert,
            key_columns: vec!["id".to_string()],
            batch_size: 100,
            command_timeout_secs: 30,
            soft_delete: None,
            file: None,
        },
        delta: DeltaSyncConfig::default(),
        policies: FailurePolicies::default(),
    }
}
