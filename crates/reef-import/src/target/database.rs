//! Relational database target
//!
//! Rows are written in chunks of `batch_size`, one transaction per chunk.
//! When a failure policy has to keep the chunk alive past a bad row, every
//! row runs inside its own savepoint so the failure can be undone alone.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{DbError, DbResult, SqlxConnection, TargetConnection, TargetTransaction};
use super::dialect::{dialect_for, SqlDialect, UpsertOutcome};
use super::mssql::MssqlConnection;
use super::{ImportTarget, ImportWriteContext, TargetRow};
use crate::config::{ConstraintPolicy, DialectKind, LoadStrategy, RowFailurePolicy, TargetConfig};
use crate::error::{ImportError, Result};
use crate::models::{ImportBatchResult, Row, RowError, RowErrorKind, TargetColumnInfo, Value};
use crate::source::ProbeResult;

const SAVEPOINT: &str = "reef_row";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Inserted,
    Updated,
}

/// `OUTPUT $action` of a MERGE
fn merge_action_outcome(output: &[Row]) -> RowOutcome {
    let action = output
        .first()
        .and_then(|r| r.values().next())
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase);
    match action.as_deref() {
        Some("INSERT") => RowOutcome::Inserted,
        _ => RowOutcome::Updated,
    }
}

/// `RETURNING xmax`: a fresh tuple has no deleting transaction
fn xmax_outcome(output: &[Row]) -> RowOutcome {
    match output.first().and_then(|r| r.get_ci("xmax")) {
        Some(Value::Integer(0)) => RowOutcome::Inserted,
        _ => RowOutcome::Updated,
    }
}

/// `ON DUPLICATE KEY UPDATE` rows affected
///
/// sqlx connects with `CLIENT_FOUND_ROWS`, so a matched row left unchanged
/// reports 1 like an insert; the existence check decides that case.
fn rows_affected_outcome(affected: u64, existed: bool) -> RowOutcome {
    match affected {
        1 if !existed => RowOutcome::Inserted,
        _ => RowOutcome::Updated,
    }
}

/// What to do with a row that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    Fail,
    /// Count as failed and continue
    SkipRow,
    /// Constraint skip: count as skipped and continue
    SkipConstraint,
    RollbackChunk,
    Overwrite,
}

fn failure_action(kind: RowErrorKind, ctx: &ImportWriteContext) -> FailureAction {
    if kind == RowErrorKind::Constraint {
        if let Some(policy) = ctx.constraint_policy {
            return match policy {
                ConstraintPolicy::Fail => FailureAction::Fail,
                ConstraintPolicy::SkipRow => FailureAction::SkipConstraint,
                ConstraintPolicy::Overwrite => FailureAction::Overwrite,
            };
        }
    }
    match ctx.row_policy {
        RowFailurePolicy::Fail => FailureAction::Fail,
        RowFailurePolicy::SkipRow => FailureAction::SkipRow,
        RowFailurePolicy::Rollback => FailureAction::RollbackChunk,
    }
}

/// Whether any reachable action continues the transaction after a failed row
fn isolates_rows(ctx: &ImportWriteContext) -> bool {
    ctx.row_policy == RowFailurePolicy::SkipRow
        || matches!(
            ctx.constraint_policy,
            Some(ConstraintPolicy::SkipRow | ConstraintPolicy::Overwrite)
        )
}

/// How a run of rows inside one transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkEnd {
    Completed,
    Cancelled,
    /// The whole transaction must be rolled back; rows are already counted failed
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StatementKind {
    Insert,
    Upsert,
    Update,
    Probe,
}

pub struct DatabaseTarget {
    connection: Box<dyn TargetConnection>,
    dialect: Box<dyn SqlDialect>,
    statements: Mutex<HashMap<(StatementKind, String), Arc<str>>>,
}

impl DatabaseTarget {
    pub fn new(connection: Box<dyn TargetConnection>, dialect: Box<dyn SqlDialect>) -> Self {
        Self {
            connection,
            dialect,
            statements: Mutex::new(HashMap::new()),
        }
    }

    /// Open the connection for a decrypted connection string
    pub async fn connect(config: &TargetConfig, connection_string: &str) -> Result<Self> {
        let kind = config.resolved_dialect(connection_string)?;
        let name = config.connection_name.as_deref().unwrap_or(&config.table);

        let connection: Box<dyn TargetConnection> = match kind {
            DialectKind::SqlServer => Box::new(
                MssqlConnection::connect(connection_string)
                    .await
                    .map_err(|e| connect_error(name, e))?,
            ),
            _ => Box::new(
                SqlxConnection::connect(connection_string)
                    .await
                    .map_err(|e| connect_error(name, e))?,
            ),
        };

        info!(dialect = ?kind, target = %name, "Connected to database target");
        Ok(Self::new(connection, dialect_for(kind)))
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    fn write_error(&self, error: DbError) -> ImportError {
        ImportError::Write {
            kind: self.dialect.classify_error(&error),
            message: error.to_string(),
        }
    }

    /// SQL text cached per statement kind and column signature
    fn statement(&self, kind: StatementKind, table: &str, columns: &[String], keys: &[String]) -> Arc<str> {
        let signature = format!("{}|{}|{}", table, columns.join("\u{1f}"), keys.join("\u{1f}"));
        let mut cache = self.statements.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry((kind, signature))
            .or_insert_with(|| {
                let sql = match kind {
                    StatementKind::Insert => self.dialect.insert_sql(table, columns),
                    StatementKind::Upsert => self.dialect.upsert_sql(table, columns, keys),
                    StatementKind::Update => self.dialect.update_sql(table, columns, keys),
                    StatementKind::Probe => self.dialect.probe_sql(table, keys),
                };
                debug!(sql = %sql, "Prepared statement text");
                Arc::from(sql)
            })
            .clone()
    }

    async fn timed<T, F>(&self, ctx: &ImportWriteContext, operation: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>> + Send,
    {
        if ctx.command_timeout.is_zero() {
            return operation.await;
        }
        match tokio::time::timeout(ctx.command_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(DbError::abandoned(format!(
                "Command exceeded timeout of {}s",
                ctx.command_timeout.as_secs()
            ))),
        }
    }

    fn write_mode(ctx: &ImportWriteContext) -> WriteMode {
        match ctx.load_strategy {
            LoadStrategy::Upsert if !ctx.key_columns.is_empty() => WriteMode::Upsert,
            _ => WriteMode::Insert,
        }
    }

    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        self.connection.begin().await.map_err(|e| self.write_error(e))
    }

    async fn write_row(
        &self,
        tx: &mut dyn TargetTransaction,
        ctx: &ImportWriteContext,
        mode: WriteMode,
        row: &TargetRow,
    ) -> DbResult<RowOutcome> {
        let columns: Vec<String> = row.values.columns().map(str::to_string).collect();
        let params: Vec<Value> = row.values.values().cloned().collect();

        if mode == WriteMode::Insert {
            let sql = self.statement(StatementKind::Insert, &ctx.table, &columns, &ctx.key_columns);
            self.timed(ctx, tx.execute(&sql, &params)).await?;
            return Ok(RowOutcome::Inserted);
        }

        let sql = self.statement(StatementKind::Upsert, &ctx.table, &columns, &ctx.key_columns);
        match self.dialect.upsert_outcome() {
            UpsertOutcome::MergeAction => {
                let output = self.timed(ctx, tx.fetch(&sql, &params)).await?;
                Ok(merge_action_outcome(&output))
            },
            UpsertOutcome::Xmax => {
                let output = self.timed(ctx, tx.fetch(&sql, &params)).await?;
                Ok(xmax_outcome(&output))
            },
            UpsertOutcome::RowsAffected => {
                let existed = self.exists(tx, ctx, &columns, row).await?;
                let affected = self.timed(ctx, tx.execute(&sql, &params)).await?;
                Ok(rows_affected_outcome(affected, existed))
            },
            UpsertOutcome::Probe => {
                let existed = self.exists(tx, ctx, &columns, row).await?;
                self.timed(ctx, tx.execute(&sql, &params)).await?;
                Ok(if existed {
                    RowOutcome::Updated
                } else {
                    RowOutcome::Inserted
                })
            },
        }
    }

    /// Whether a row with the same key is already in the table
    async fn exists(
        &self,
        tx: &mut dyn TargetTransaction,
        ctx: &ImportWriteContext,
        columns: &[String],
        row: &TargetRow,
    ) -> DbResult<bool> {
        let lookup = self.statement(StatementKind::Probe, &ctx.table, columns, &ctx.key_columns);
        let keys = key_values(&row.values, &ctx.key_columns);
        let existing = self.timed(ctx, tx.fetch(&lookup, &keys)).await?;
        Ok(!existing.is_empty())
    }

    /// UPDATE by key columns after a constraint violation
    async fn overwrite_row(
        &self,
        tx: &mut dyn TargetTransaction,
        ctx: &ImportWriteContext,
        row: &TargetRow,
    ) -> DbResult<()> {
        if ctx.key_columns.is_empty() {
            return Err(DbError::new(None, "Overwrite needs key columns"));
        }
        let columns: Vec<String> = row.values.columns().map(str::to_string).collect();
        let mut params: Vec<Value> = row
            .values
            .iter()
            .filter(|(name, _)| !ctx.key_columns.iter().any(|k| k.eq_ignore_ascii_case(name)))
            .map(|(_, value)| value.clone())
            .collect();
        if params.is_empty() {
            // Nothing but keys: the existing row already matches
            return Ok(());
        }
        params.extend(key_values(&row.values, &ctx.key_columns));

        let sql = self.statement(StatementKind::Update, &ctx.table, &columns, &ctx.key_columns);
        self.timed(ctx, tx.execute(&sql, &params)).await?;
        Ok(())
    }

    async fn savepoint(&self, tx: &mut dyn TargetTransaction) -> Result<()> {
        tx.batch(&self.dialect.savepoint_sql(SAVEPOINT))
            .await
            .map_err(|e| self.write_error(e))
    }

    async fn rollback_to_savepoint(&self, tx: &mut dyn TargetTransaction) -> Result<()> {
        tx.batch(&self.dialect.rollback_to_savepoint_sql(SAVEPOINT))
            .await
            .map_err(|e| self.write_error(e))
    }

    async fn release_savepoint(&self, tx: &mut dyn TargetTransaction) -> Result<()> {
        match self.dialect.release_savepoint_sql(SAVEPOINT) {
            Some(sql) => tx.batch(&sql).await.map_err(|e| self.write_error(e)),
            None => Ok(()),
        }
    }

    /// Write rows inside an open transaction, applying the failure policies
    ///
    /// Returns `Err` only for a `Fail` action; the caller rolls back.
    async fn write_rows(
        &self,
        tx: &mut dyn TargetTransaction,
        ctx: &ImportWriteContext,
        mode: WriteMode,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<(ImportBatchResult, ChunkEnd)> {
        let isolate = isolates_rows(ctx);
        let mut result = ImportBatchResult::default();

        for (index, row) in rows.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                return Ok((result, ChunkEnd::Cancelled));
            }

            if isolate {
                self.savepoint(tx).await?;
            }

            let error = match self.write_row(tx, ctx, mode, row).await {
                Ok(RowOutcome::Inserted) => {
                    result.inserted += 1;
                    None
                },
                Ok(RowOutcome::Updated) => {
                    result.updated += 1;
                    None
                },
                Err(e) => Some(e),
            };

            let Some(error) = error else {
                if isolate {
                    self.release_savepoint(tx).await?;
                }
                continue;
            };

            let kind = self.dialect.classify_error(&error);
            let row_error = RowError::new(row.line, row.key.clone(), kind, error.message.clone());
            debug!(line = row.line, kind = %kind, error = %error, "Row write failed");

            let action = match failure_action(kind, ctx) {
                FailureAction::Fail => FailureAction::Fail,
                _ if error.broken => {
                    // No savepoint can run on the session any more
                    warn!(line = row.line, "Connection broken by timeout, rolling back chunk");
                    tx.mark_broken();
                    FailureAction::RollbackChunk
                },
                action => action,
            };

            match action {
                FailureAction::Fail => {
                    if error.broken {
                        tx.mark_broken();
                    }
                    return Err(ImportError::Write {
                        kind,
                        message: format!("Row {}: {}", row.line, error),
                    });
                },
                FailureAction::RollbackChunk => {
                    return Ok((rolled_back(rows, index, row_error), ChunkEnd::RolledBack));
                },
                FailureAction::SkipRow => {
                    self.rollback_to_savepoint(tx).await?;
                    result.failed += 1;
                    result.errors.push(row_error);
                },
                FailureAction::SkipConstraint => {
                    self.rollback_to_savepoint(tx).await?;
                    result.skipped += 1;
                    result.errors.push(row_error);
                },
                FailureAction::Overwrite => {
                    self.rollback_to_savepoint(tx).await?;
                    match self.overwrite_row(tx, ctx, row).await {
                        Ok(()) => result.updated += 1,
                        Err(e) => {
                            let kind = self.dialect.classify_error(&e);
                            if e.broken {
                                tx.mark_broken();
                            }
                            if ctx.row_policy == RowFailurePolicy::Fail {
                                return Err(ImportError::Write {
                                    kind,
                                    message: format!("Row {}: {}", row.line, e),
                                });
                            }
                            if e.broken {
                                let row_error = RowError::new(row.line, row.key.clone(), kind, e.message);
                                return Ok((rolled_back(rows, index, row_error), ChunkEnd::RolledBack));
                            }
                            self.rollback_to_savepoint(tx).await?;
                            result.failed += 1;
                            result.errors.push(RowError::new(row.line, row.key.clone(), kind, e.message));
                        },
                    }
                },
            }

            if isolate {
                self.release_savepoint(tx).await?;
            }
        }

        Ok((result, ChunkEnd::Completed))
    }

    async fn finish(&self, tx: Box<dyn TargetTransaction>, end: ChunkEnd) -> Result<()> {
        match end {
            ChunkEnd::Completed | ChunkEnd::Cancelled => tx.commit().await.map_err(|e| self.write_error(e)),
            ChunkEnd::RolledBack => tx.rollback().await.map_err(|e| self.write_error(e)),
        }
    }

    async fn abandon(&self, tx: Box<dyn TargetTransaction>) {
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

/// Every row of the chunk failed along with the one at `index`
fn rolled_back(rows: &[TargetRow], index: usize, cause: RowError) -> ImportBatchResult {
    let line = cause.row_number;
    let kind = cause.kind;
    let errors = rows
        .iter()
        .enumerate()
        .map(|(i, other)| {
            if i == index {
                cause.clone()
            } else {
                RowError::new(
                    other.line,
                    other.key.clone(),
                    kind,
                    format!("Rolled back with batch after row {} failed", line),
                )
            }
        })
        .collect();
    ImportBatchResult {
        failed: rows.len() as u64,
        errors,
        ..Default::default()
    }
}

fn connect_error(name: &str, error: DbError) -> ImportError {
    ImportError::Write {
        kind: error.kind_hint.unwrap_or(RowErrorKind::Unknown),
        message: format!("Cannot connect to '{}': {}", name, error),
    }
}

fn key_values(row: &Row, keys: &[String]) -> Vec<Value> {
    keys.iter()
        .map(|k| row.get_ci(k).cloned().unwrap_or_default())
        .collect()
}

/// Soft-delete flags bind as numbers or booleans when they look like one
fn flag_value(text: &str) -> Value {
    if let Ok(i) = text.trim().parse::<i64>() {
        return Value::Integer(i);
    }
    match text.trim().to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}

fn column_info(row: &Row) -> Option<TargetColumnInfo> {
    let text = |name: &str| row.get_ci(name).and_then(Value::to_text);
    let number = |name: &str| match row.get_ci(name) {
        Some(Value::Integer(i)) => Some(*i),
        Some(Value::Float(f)) => Some(*f as i64),
        Some(Value::Bool(b)) => Some(i64::from(*b)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };

    Some(TargetColumnInfo {
        name: text("column_name")?,
        data_type: text("data_type").unwrap_or_default(),
        nullable: number("nullable") == Some(1),
        is_primary_key: number("is_primary_key") == Some(1),
        max_length: number("max_length"),
        precision: number("numeric_precision"),
        scale: number("numeric_scale"),
    })
}

#[async_trait]
impl ImportTarget for DatabaseTarget {
    #[instrument(skip_all, fields(table = %ctx.table, rows = rows.len()))]
    async fn write_batch(
        &self,
        ctx: &ImportWriteContext,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<ImportBatchResult> {
        let mode = Self::write_mode(ctx);
        if ctx.load_strategy == LoadStrategy::Upsert && mode == WriteMode::Insert {
            warn!(table = %ctx.table, "Upsert without key columns, inserting");
        }

        let mut total = ImportBatchResult::default();
        for (batch, chunk) in rows.chunks(ctx.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                total.cancelled = true;
                break;
            }

            let mut tx = self.begin().await?;
            let (result, end) = match self.write_rows(tx.as_mut(), ctx, mode, chunk, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.abandon(tx).await;
                    return Err(e);
                },
            };
            self.finish(tx, end).await?;

            debug!(
                batch,
                inserted = result.inserted,
                updated = result.updated,
                skipped = result.skipped,
                failed = result.failed,
                "Chunk finished"
            );
            total.merge(result);
            if end == ChunkEnd::Cancelled {
                break;
            }
        }

        info!(
            table = %ctx.table,
            inserted = total.inserted,
            updated = total.updated,
            skipped = total.skipped,
            failed = total.failed,
            "Batch written"
        );
        Ok(total)
    }

    #[instrument(skip_all, fields(table = %ctx.table, rows = rows.len()))]
    async fn full_replace(
        &self,
        ctx: &ImportWriteContext,
        rows: &[TargetRow],
        cancel: &CancellationToken,
    ) -> Result<ImportBatchResult> {
        let mut tx = self.begin().await?;

        let clear = self.dialect.clear_sql(&ctx.table);
        if let Err(e) = self.timed(ctx, tx.batch(&clear)).await {
            if e.broken {
                tx.mark_broken();
            }
            self.abandon(tx).await;
            return Err(self.write_error(e));
        }

        let (result, end) = match self.write_rows(tx.as_mut(), ctx, WriteMode::Insert, rows, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon(tx).await;
                return Err(e);
            },
        };

        match end {
            ChunkEnd::Cancelled => {
                // All or nothing: a cancelled replace leaves the old content
                self.abandon(tx).await;
                info!(table = %ctx.table, "Full replace cancelled, rolled back");
                Ok(ImportBatchResult {
                    cancelled: true,
                    ..Default::default()
                })
            },
            ChunkEnd::RolledBack => {
                self.abandon(tx).await;
                warn!(table = %ctx.table, failed = result.failed, "Full replace rolled back");
                Ok(result)
            },
            ChunkEnd::Completed => {
                self.finish(tx, end).await?;
                info!(
                    table = %ctx.table,
                    inserted = result.inserted,
                    failed = result.failed,
                    "Table replaced"
                );
                Ok(result)
            },
        }
    }

    #[instrument(skip_all, fields(table = %ctx.table, keys = keys.len()))]
    async fn apply_deletes(&self, ctx: &ImportWriteContext, keys: &[String], key_column: &str) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let per_statement = self.dialect.max_parameters().saturating_sub(1).max(1);
        let mut tx = self.begin().await?;
        let mut affected = 0u64;

        for chunk in keys.chunks(per_statement) {
            let (sql, mut params) = match &ctx.soft_delete {
                Some(soft) => (
                    self.dialect
                        .soft_delete_sql(&ctx.table, key_column, &soft.column, chunk.len()),
                    vec![flag_value(&soft.value)],
                ),
                None => (self.dialect.delete_sql(&ctx.table, key_column, chunk.len()), Vec::new()),
            };
            params.extend(chunk.iter().map(|k| Value::String(k.clone())));

            match self.timed(ctx, tx.execute(&sql, &params)).await {
                Ok(n) => affected += n,
                Err(e) => {
                    if e.broken {
                        tx.mark_broken();
                    }
                    self.abandon(tx).await;
                    return Err(self.write_error(e));
                },
            }
        }

        tx.commit().await.map_err(|e| self.write_error(e))?;
        info!(
            table = %ctx.table,
            affected,
            soft = ctx.soft_delete.is_some(),
            "Applied deletes"
        );
        Ok(affected)
    }

    async fn get_table_schema(&self, ctx: &ImportWriteContext) -> Result<Vec<TargetColumnInfo>> {
        let params: Vec<Value> = self
            .dialect
            .schema_params(&ctx.table)
            .into_iter()
            .map(Value::String)
            .collect();
        let rows = self
            .connection
            .query(&self.dialect.schema_sql(), &params)
            .await
            .map_err(|e| self.write_error(e))?;
        Ok(rows.iter().filter_map(column_info).collect())
    }

    async fn test(&self, ctx: &ImportWriteContext) -> ProbeResult {
        match self.connection.ping().await {
            Ok(()) => ProbeResult::ok(format!("Connected to {}", ctx.connection_name)),
            Err(e) => ProbeResult::failed(format!("Cannot reach {}: {}", ctx.connection_name, e)),
        }
    }
}
