//! Import targets: where mapped rows land
//!
//! A target receives already-mapped rows in batches together with an
//! immutable [`ImportWriteContext`] and reports per-row outcomes in an
//! [`ImportBatchResult`].

pub mod connection;
pub mod database;
pub mod dialect;
pub mod local_file;
pub mod mssql;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{
    ColumnMapping, ConstraintPolicy, DeleteMode, ImportProfile, LoadStrategy, RowFailurePolicy,
    SecretDecryptor, SoftDeleteConfig, TargetConfig, TargetKind,
};
use crate::error::{ImportError, Result};
use crate::models::{ImportBatchResult, Row, TargetColumnInfo};
use crate::source::ProbeResult;

pub use self::connection::{DbError, SqlxConnection, TargetConnection, TargetTransaction};
pub use self::database::DatabaseTarget;
pub use self::dialect::{dialect_for, SqlDialect};
pub use self::local_file::LocalFileTarget;
pub use self::mssql::MssqlConnection;

/// One mapped row on its way to a target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    /// Source line, for error reporting
    pub line: u64,
    /// Natural key when delta sync computed one
    pub key: Option<String>,
    pub values: Row,
}

impl TargetRow {
    pub fn new(line: u64, values: Row) -> Self {
        Self {
            line,
            key: None,
            values,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Everything a target needs for one write call
#[derive(Debug, Clone)]
pub struct ImportWriteContext {
    pub target_kind: TargetKind,
    /// Display name; never the connection secret
    pub connection_name: String,
    pub table: String,
    pub load_strategy: LoadStrategy,
    pub key_columns: Vec<String>,
    pub mappings: Vec<ColumnMapping>,
    pub batch_size: usize,
    pub command_timeout: Duration,
    pub row_policy: RowFailurePolicy,
    pub constraint_policy: Option<ConstraintPolicy>,
    /// Set when deletes are applied as a flag update
    pub soft_delete: Option<SoftDeleteConfig>,
}

impl ImportWriteContext {
    pub fn from_profile(profile: &ImportProfile) -> Self {
        let target = &profile.target;
        let soft_delete = match profile.delta.delete_mode {
            DeleteMode::Soft => target.soft_delete.clone(),
            DeleteMode::Hard => None,
        };

        Self {
            target_kind: target.kind,
            connection_name: connection_display_name(target),
            table: target.table.clone(),
            load_strategy: target.load_strategy,
            key_columns: profile.key_columns(),
            mappings: profile.mappings.clone(),
            batch_size: target.batch_size.max(1),
            command_timeout: target.command_timeout(),
            row_policy: profile.policies.row,
            constraint_policy: profile.policies.constraint,
            soft_delete,
        }
    }
}

fn connection_display_name(target: &TargetConfig) -> String {
    if let Some(name) = &target.connection_name {
        return name.clone();
    }
    match target.kind {
        TargetKind::LocalFile => target
            .file
            .as_ref()
            .map(|f| f.path.clone())
            .unwrap_or_default(),
        TargetKind::Database => target
            .dialect
            .map(|d| format!("{:?}", d).to_lowercase())
            .unwrap_or_else(|| "database".to_string()),
    }
}

#[async_trait]
pub trait ImportTarget: Send + Sync {
    /// Insert, Append or Upsert rows, one transaction per chunk
    async fn write_batch(
        &self,
        ctx: &ImportWriteContext,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<ImportBatchResult>;

    /// Replace the whole table content in one all-or-nothing unit
    async fn full_replace(
        &self,
        ctx: &ImportWriteContext,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<ImportBatchResult>;

    /// Delete (or flag) rows by natural key; returns rows affected
    async fn apply_deletes(&self, ctx: &ImportWriteContext, keys: &[String], key_column: &str) -> Result<u64>;

    async fn get_table_schema(&self, ctx: &ImportWriteContext) -> Result<Vec<TargetColumnInfo>>;

    async fn test(&self, ctx: &ImportWriteContext) -> ProbeResult;
}

/// Connect the configured target
pub async fn build_target(config: &TargetConfig, decryptor: &dyn SecretDecryptor) -> Result<Box<dyn ImportTarget>> {
    match config.kind {
        TargetKind::LocalFile => {
            let file = config
                .file
                .as_ref()
                .ok_or_else(|| ImportError::config("target.file is required for file targets"))?;
            Ok(Box::new(LocalFileTarget::new(file.clone())))
        },
        TargetKind::Database => {
            let secret = config
                .connection_string
                .as_deref()
                .ok_or_else(|| ImportError::config("target.connection_string is required"))?;
            let connection_string = decryptor.decrypt(secret)?;
            Ok(Box::new(DatabaseTarget::connect(config, &connection_string).await?))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeltaSyncConfig, FailurePolicies, FormatConfig, SourceConfig, SourceKind};

    fn profile() -> ImportProfile {
        ImportProfile {
            id: "orders".to_string(),
            name: None,
            source: SourceConfig {
                kind: SourceKind::Local,
                path: Some("/in/orders.csv".to_string()),
                pattern: None,
                selection: Default::default(),
                archive_path: None,
                remote: None,
                http: None,
            },
            format: FormatConfig::default(),
            mappings: vec![{
                let mut m = ColumnMapping::new("order_id", "Id");
                m.is_key = true;
                m
            }],
            target: TargetConfig {
                kind: TargetKind::Database,
                dialect: Some(crate::config::DialectKind::Postgres),
                connection_string: Some("postgres://secret@db/reef".to_string()),
                connection_name: None,
                table: "public.orders".to_string(),
                load_strategy: LoadStrategy::Upsert,
                key_columns: Vec::new(),
                batch_size: 0,
                command_timeout_secs: 15,
                soft_delete: Some(SoftDeleteConfig {
                    column: "is_deleted".to_string(),
                    value: "1".to_string(),
                }),
                file: None,
            },
            delta: DeltaSyncConfig::default(),
            policies: FailurePolicies::default(),
        }
    }

    #[test]
    fn test_context_from_profile() {
        let ctx = ImportWriteContext::from_profile(&profile());
        assert_eq!(ctx.key_columns, vec!["Id"]);
        assert_eq!(ctx.batch_size, 1);
        assert_eq!(ctx.command_timeout, Duration::from_secs(15));
        assert_eq!(ctx.connection_name, "postgres");
        assert!(ctx.soft_delete.is_none());
    }

    #[test]
    fn test_soft_delete_only_in_soft_mode() {
        let mut profile = profile();
        profile.delta.delete_mode = DeleteMode::Soft;
        let ctx = ImportWriteContext::from_profile(&profile);
        assert_eq!(ctx.soft_delete.map(|s| s.column), Some("is_deleted".to_string()));
    }
}
