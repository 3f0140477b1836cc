//! Import pipeline orchestrator
//!
//! One execution runs sequentially: fetch → parse → map → classify → write.
//! Parsing runs on a blocking thread and feeds the async side through a
//! bounded channel, so a slow target applies backpressure to the parser.
//!
//! ```no_run
//! use reef_import::{ImportPipeline, ImportProfile, PlainTextDecryptor, SourceRegistry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> reef_import::Result<()> {
//! reef_import::init();
//! let profile = ImportProfile::load("profiles/orders.toml")?;
//! let registry = SourceRegistry::new(Arc::new(PlainTextDecryptor));
//! let pipeline = ImportPipeline::from_profile(profile, &registry, &PlainTextDecryptor).await?;
//! let summary = pipeline.run(CancellationToken::new()).await?;
//! println!("{} rows inserted", summary.result.inserted);
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

use crate::config::{ImportProfile, LoadStrategy, ParseFailurePolicy, SecretDecryptor, SourceFailurePolicy};
use crate::delta::{Classification, DeltaClassifier, DeltaStateStore, MemoryStateStore, SqlStateStore};
use crate::error::{ImportError, Result};
use crate::mapper::ColumnMapper;
use crate::models::{ExecutionSummary, ImportBatchResult, ParsedRow, Row, RowError, RowErrorKind, SourceFile};
use crate::parser::{self, FormatParser};
use crate::source::{ImportSource, SourceRegistry};
use crate::target::{build_target, ImportTarget, ImportWriteContext, TargetRow};

/// Rows buffered between the parser thread and the writer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct ImportPipeline {
    profile: ImportProfile,
    source: Box<dyn ImportSource>,
    target: Box<dyn ImportTarget>,
    parser: Arc<dyn FormatParser>,
    mapper: ColumnMapper,
    state_store: Arc<dyn DeltaStateStore>,
    dry_run: bool,
    channel_capacity: usize,
}

impl ImportPipeline {
    /// Assemble a pipeline from already-built collaborators
    pub fn new(profile: ImportProfile, source: Box<dyn ImportSource>, target: Box<dyn ImportTarget>) -> Result<Self> {
        profile.validate()?;
        let parser: Arc<dyn FormatParser> = Arc::from(parser::for_format(&profile.format)?);
        let mapper = ColumnMapper::new(&profile.mappings)?;

        Ok(Self {
            profile,
            source,
            target,
            parser,
            mapper,
            state_store: Arc::new(MemoryStateStore::new()),
            dry_run: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }

    /// Build source, target and delta state store from the profile
    pub async fn from_profile(
        profile: ImportProfile,
        registry: &SourceRegistry,
        decryptor: &dyn SecretDecryptor,
    ) -> Result<Self> {
        profile.validate()?;
        let source = registry.for_config(&profile.source)?;
        let target = build_target(&profile.target, decryptor).await?;

        let state_store: Arc<dyn DeltaStateStore> = match &profile.delta.state_connection {
            Some(url) if profile.delta.enabled => Arc::new(SqlStateStore::connect(&decryptor.decrypt(url)?).await?),
            _ => Arc::new(MemoryStateStore::new()),
        };

        Ok(Self::new(profile, source, target)?.with_state_store(state_store))
    }

    pub fn with_state_store(mut self, store: Arc<dyn DeltaStateStore>) -> Self {
        self.state_store = store;
        self
    }

    /// Parse, map and classify without writing, archiving or saving state
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn profile(&self) -> &ImportProfile {
        &self.profile
    }

    pub fn source(&self) -> &dyn ImportSource {
        self.source.as_ref()
    }

    pub fn target(&self) -> &dyn ImportTarget {
        self.target.as_ref()
    }

    pub fn write_context(&self) -> ImportWriteContext {
        ImportWriteContext::from_profile(&self.profile)
    }

    /// Execute the profile once
    ///
    /// Crossing an abort threshold returns [`ImportError::Aborted`] carrying
    /// the summary so far. Cancellation is not an error: the summary comes
    /// back with `cancelled` set after the in-flight transaction finished.
    #[instrument(skip_all, fields(profile = %self.profile.id, execution_id = tracing::field::Empty, dry_run = self.dry_run))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExecutionSummary> {
        let execution_id = Uuid::new_v4();
        Span::current().record("execution_id", tracing::field::display(execution_id));
        info!("Starting import of {}", self.profile.display_name());

        let mut run = Execution::new(self, execution_id, cancel.clone());

        let files = match self.fetch(&cancel).await {
            Ok(files) => files,
            Err(ImportError::Cancelled) => {
                run.summary.cancelled = true;
                return Ok(run.complete());
            },
            Err(e) if self.profile.policies.source == SourceFailurePolicy::Skip && e.is_retryable() => {
                warn!(error = %e, "Source unavailable, skipping execution");
                run.summary.source_skipped = true;
                return Ok(run.complete());
            },
            Err(e) => return Err(e),
        };
        info!(files = files.len(), "Fetched source files");

        if self.profile.delta.enabled {
            let snapshot = self.state_store.load(&self.profile.id).await?;
            run.classifier = Some(DeltaClassifier::new(
                self.profile.id.clone(),
                &self.profile.delta,
                execution_id,
                snapshot,
            )?);
        }

        for file in files {
            if cancel.is_cancelled() {
                run.summary.cancelled = true;
                break;
            }
            run.process_file(file).await?;
            if run.summary.cancelled {
                break;
            }
        }

        run.flush().await?;
        run.replace().await?;
        run.check_thresholds(true)?;
        run.apply_deletes().await?;
        run.save_state().await?;
        run.archive().await;

        Ok(run.complete())
    }

    /// Fetch under the source failure policy
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<SourceFile>> {
        let policies = &self.profile.policies;
        let attempts = match policies.source {
            SourceFailurePolicy::Retry => policies.source_retries + 1,
            _ => 1,
        };
        let base_delay = Duration::from_millis(policies.retry_delay_ms);

        let mut attempt = 1;
        loop {
            let err = match self.source.fetch(&self.profile.source).await {
                Ok(files) => return Ok(files),
                Err(e) => e,
            };
            if attempt >= attempts || !err.is_retryable() {
                return Err(err);
            }

            let delay = base_delay * 2u32.saturating_pow(attempt - 1);
            warn!(attempt, max_attempts = attempts, error = %err, "Source fetch failed, retrying in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ImportError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
            attempt += 1;
        }
    }
}

/// Mutable state of one execution
struct Execution<'a> {
    pipeline: &'a ImportPipeline,
    ctx: ImportWriteContext,
    cancel: CancellationToken,
    summary: ExecutionSummary,
    classifier: Option<DeltaClassifier>,
    pending: Vec<TargetRow>,
    /// FullReplace collects every row and writes once at the end
    replace_rows: Vec<TargetRow>,
    completed_files: Vec<String>,
    batch: u64,
}

enum FileEnd {
    Completed,
    Skipped,
    Cancelled,
}

impl<'a> Execution<'a> {
    fn new(pipeline: &'a ImportPipeline, execution_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            ctx: pipeline.write_context(),
            cancel,
            summary: ExecutionSummary::new(execution_id, pipeline.profile.id.clone(), pipeline.dry_run),
            classifier: None,
            pending: Vec::new(),
            replace_rows: Vec::new(),
            completed_files: Vec::new(),
            batch: 0,
        }
    }

    fn full_replace(&self) -> bool {
        self.ctx.load_strategy == LoadStrategy::FullReplace
    }

    #[instrument(skip_all, fields(file = %file.info.name))]
    async fn process_file(&mut self, file: SourceFile) -> Result<()> {
        let identifier = file.identifier().to_string();
        let policy = self.pipeline.profile.policies.parse;

        let (tx, mut rx) = mpsc::channel::<Result<ParsedRow>>(self.pipeline.channel_capacity);
        let parser = self.pipeline.parser.clone();
        let token = self.cancel.clone();
        let reader = file.into_reader();
        let producer = tokio::task::spawn_blocking(move || {
            for item in parser::with_cancellation(parser.parse(reader), token) {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
        });

        // SkipFile holds the file back until it parsed cleanly
        let mut held: Vec<(u64, Row)> = Vec::new();
        let mut end = FileEnd::Completed;

        while let Some(item) = rx.recv().await {
            let parsed = match item {
                Ok(parsed) => parsed,
                Err(ImportError::Cancelled) => {
                    end = FileEnd::Cancelled;
                    break;
                },
                Err(e) => return Err(e),
            };
            self.summary.rows_read += 1;

            if let Some(message) = parsed.error {
                match policy {
                    ParseFailurePolicy::Fail => {
                        return Err(ImportError::Parse {
                            line: parsed.line,
                            message,
                        });
                    },
                    ParseFailurePolicy::SkipRow => {
                        self.record_parse_failure(parsed.line, message);
                        self.check_thresholds(false)?;
                    },
                    ParseFailurePolicy::SkipFile => {
                        warn!(line = parsed.line, error = %message, "Parse failure, skipping file");
                        self.record_parse_failure(parsed.line, message);
                        end = FileEnd::Skipped;
                        break;
                    },
                }
                continue;
            }

            if policy == ParseFailurePolicy::SkipFile {
                held.push((parsed.line, parsed.columns));
            } else {
                self.accept(parsed.line, &parsed.columns).await?;
            }
        }
        drop(rx);
        producer.await?;

        match end {
            FileEnd::Completed => {
                for (line, columns) in held {
                    if self.cancel.is_cancelled() {
                        self.summary.cancelled = true;
                        return Ok(());
                    }
                    self.accept(line, &columns).await?;
                }
                self.summary.files_processed += 1;
                if !self.summary.cancelled {
                    self.completed_files.push(identifier);
                }
            },
            FileEnd::Skipped => {
                self.summary.files_skipped += 1;
                self.check_thresholds(false)?;
            },
            FileEnd::Cancelled => {
                info!("Cancelled while parsing");
                self.summary.cancelled = true;
            },
        }
        Ok(())
    }

    fn record_parse_failure(&mut self, line: u64, message: String) {
        debug!(line, error = %message, "Skipping unparseable row");
        self.summary.parse_failures += 1;
        self.summary
            .errors
            .push(RowError::new(line, None, RowErrorKind::Parse, message));
    }

    /// Map and classify one row, then queue it for writing
    async fn accept(&mut self, line: u64, columns: &Row) -> Result<()> {
        let mapped = self.pipeline.mapper.map(columns);
        let mut row = TargetRow::new(line, mapped);

        let replacing = self.full_replace();
        if let Some(classifier) = self.classifier.as_mut() {
            match classifier.classify(line, &row.values) {
                Classification::New(key) | Classification::Changed(key) => row = row.with_key(key),
                // The replace clears the table, so unchanged rows are rewritten too
                Classification::Unchanged(key) if replacing => row = row.with_key(key),
                Classification::Unchanged(_) | Classification::Duplicate(_) => return Ok(()),
                Classification::Rejected(error) => {
                    debug!(line, error = %error.message, "Row rejected by delta sync");
                    self.summary.delta.rejected += 1;
                    self.summary.errors.push(error);
                    return self.check_thresholds(false);
                },
            }
        }

        if replacing {
            self.replace_rows.push(row);
        } else {
            self.pending.push(row);
            if self.pending.len() >= self.ctx.batch_size {
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending);

        if self.summary.cancelled || self.cancel.is_cancelled() {
            self.summary.cancelled = true;
            self.forget(&rows);
            return Ok(());
        }
        if self.pipeline.dry_run {
            debug!(rows = rows.len(), "Dry run, batch not written");
            return Ok(());
        }

        self.batch += 1;
        let result = self
            .pipeline
            .target
            .write_batch(&self.ctx, &rows, &self.cancel)
            .await?;
        info!(
            batch = self.batch,
            rows = rows.len(),
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            failed = result.failed,
            "Batch written"
        );
        self.absorb(&rows, result);
        self.check_thresholds(true)
    }

    /// Write the buffered rows of a FullReplace execution in one unit
    async fn replace(&mut self) -> Result<()> {
        if !self.full_replace() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.replace_rows);

        if self.summary.cancelled || self.cancel.is_cancelled() {
            info!("Cancelled before replace, target left untouched");
            self.summary.cancelled = true;
            self.forget(&rows);
            return Ok(());
        }
        if self.pipeline.dry_run {
            debug!(rows = rows.len(), "Dry run, replace skipped");
            return Ok(());
        }

        let result = self
            .pipeline
            .target
            .full_replace(&self.ctx, &rows, &self.cancel)
            .await?;
        info!(
            rows = rows.len(),
            inserted = result.inserted,
            failed = result.failed,
            "Target content replaced"
        );
        self.absorb(&rows, result);
        Ok(())
    }

    /// Fold a write result into the summary and forget unwritten rows
    fn absorb(&mut self, rows: &[TargetRow], result: ImportBatchResult) {
        if result.cancelled {
            self.summary.cancelled = true;
            let reached = (result.processed() as usize).min(rows.len());
            self.forget(&rows[reached..]);
        }
        if let Some(classifier) = self.classifier.as_mut() {
            for key in result.errors.iter().filter_map(|e| e.natural_key.as_deref()) {
                classifier.forget(key);
            }
        }
        self.summary.result.merge(result);
    }

    fn forget(&mut self, rows: &[TargetRow]) {
        if let Some(classifier) = self.classifier.as_mut() {
            for key in rows.iter().filter_map(|r| r.key.as_deref()) {
                classifier.forget(key);
            }
        }
    }

    /// Enforce the configured abort thresholds
    ///
    /// The percentage only applies at batch boundaries, where enough rows
    /// have been seen for it to mean something.
    fn check_thresholds(&mut self, include_percent: bool) -> Result<()> {
        let policies = &self.pipeline.profile.policies;
        let failed = self.summary.failed_rows();

        let reason = if policies.max_failed_rows.is_some_and(|max| failed > max) {
            Some(format!(
                "{} failed rows exceed the limit of {}",
                failed,
                policies.max_failed_rows.unwrap_or_default()
            ))
        } else {
            match policies.max_failed_percent {
                Some(max) if include_percent && self.summary.rows_read > 0 => {
                    let percent = failed as f64 * 100.0 / self.summary.rows_read as f64;
                    (percent > max).then(|| format!("{:.1}% failed rows exceed the limit of {}%", percent, max))
                },
                _ => None,
            }
        };

        let Some(reason) = reason else {
            return Ok(());
        };

        warn!(failed, reason = %reason, "Aborting import");
        self.summary.aborted = Some(reason.clone());
        self.summary.compensation_required = policies.rollback_on_abort;
        self.summary.finished_at = Some(Utc::now());
        Err(ImportError::Aborted {
            reason,
            summary: Box::new(self.summary.clone()),
        })
    }

    async fn apply_deletes(&mut self) -> Result<()> {
        let Some(classifier) = self.classifier.as_ref() else {
            return Ok(());
        };
        if !self.pipeline.profile.delta.track_deletes {
            return Ok(());
        }
        // Deletions need the complete source: every file parsed and written
        if self.summary.cancelled || self.summary.files_skipped > 0 || self.summary.files_processed == 0 {
            info!("Source not read completely, delete detection skipped");
            return Ok(());
        }

        let deleted = classifier.deleted_keys();
        if deleted.is_empty() {
            return Ok(());
        }
        let values = classifier.deleted_key_values();
        info!(keys = deleted.len(), values = values.len(), "Rows no longer present in source");

        // A full replace already dropped them
        if !self.pipeline.dry_run && !self.full_replace() && !values.is_empty() {
            let key_column = self.pipeline.profile.delta.key_column.as_deref().unwrap_or_default();
            self.summary.deletes_applied = self
                .pipeline
                .target
                .apply_deletes(&self.ctx, &values, key_column)
                .await?;
        }
        self.summary.delta.deleted = deleted.len() as u64;
        Ok(())
    }

    async fn save_state(&mut self) -> Result<()> {
        let Some(classifier) = self.classifier.take() else {
            return Ok(());
        };
        let deleted = if self.summary.delta.deleted > 0 {
            classifier.deleted_keys()
        } else {
            Vec::new()
        };
        let (snapshot, counts) = classifier.finish(&deleted);
        self.summary.delta = counts;

        if self.pipeline.dry_run {
            return Ok(());
        }
        self.pipeline
            .state_store
            .save(&self.pipeline.profile.id, &snapshot)
            .await
    }

    async fn archive(&mut self) {
        let source = &self.pipeline.profile.source;
        if self.pipeline.dry_run || self.summary.cancelled || source.archive_path.is_none() {
            return;
        }
        for identifier in &self.completed_files {
            match self.pipeline.source.archive(source, identifier).await {
                Ok(true) => self.summary.files_archived += 1,
                Ok(false) => debug!(file = %identifier, "Source does not archive"),
                Err(e) => warn!(file = %identifier, error = %e, "Failed to archive source file"),
            }
        }
    }

    fn complete(mut self) -> ExecutionSummary {
        self.summary.finished_at = Some(Utc::now());
        let s = &self.summary;
        info!(
            files = s.files_processed,
            rows = s.rows_read,
            inserted = s.result.inserted,
            updated = s.result.updated,
            skipped = s.result.skipped,
            failed = s.failed_rows(),
            unchanged = s.delta.unchanged,
            deleted = s.deletes_applied,
            cancelled = s.cancelled,
            "Import finished"
        );
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DeltaSyncConfig, FailurePolicies, FileFormat, FormatConfig, LocalFileFormat, LocalFileTargetConfig,
        SourceConfig, SourceKind, TargetConfig, TargetKind,
    };
    use crate::models::FileInfo;
    use crate::source::ProbeResult;
    use crate::target::LocalFileTarget;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves fixed CSV payloads, failing the first `failures` fetches
    struct StaticSource {
        payloads: Vec<Vec<u8>>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ImportSource for StaticSource {
        async fn fetch(&self, _config: &SourceConfig) -> Result<Vec<SourceFile>> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ImportError::source("connection reset"));
            }
            Ok(self
                .payloads
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let info = FileInfo {
                        identifier: format!("file-{}", i),
                        name: format!("file-{}.csv", i),
                        size: Some(p.len() as u64),
                        last_modified: None,
                    };
                    SourceFile::from_bytes(info, p.to_vec())
                })
                .collect())
        }

        async fn list_files(&self, _config: &SourceConfig) -> Result<Vec<FileInfo>> {
            Ok(Vec::new())
        }

        async fn archive(&self, _config: &SourceConfig, _identifier: &str) -> Result<bool> {
            Ok(false)
        }

        async fn test(&self, _config: &SourceConfig) -> ProbeResult {
            ProbeResult::ok("static")
        }
    }

    fn source(payloads: &[&[u8]], failures: u32) -> Box<dyn ImportSource> {
        Box::new(StaticSource {
            payloads: payloads.iter().map(|p| p.to_vec()).collect(),
            failures: AtomicU32::new(failures),
        })
    }

    fn profile(out: &std::path::Path) -> ImportProfile {
        ImportProfile {
            id: "people".to_string(),
            name: None,
            source: SourceConfig {
                kind: SourceKind::Local,
                path: Some("/in/people.csv".to_string()),
                pattern: None,
                selection: Default::default(),
                archive_path: None,
                remote: None,
                http: None,
            },
            format: FormatConfig {
                format: FileFormat::Csv,
                ..Default::default()
            },
            mappings: Vec::new(),
            target: TargetConfig {
                kind: TargetKind::LocalFile,
                dialect: None,
                connection_string: None,
                connection_name: None,
                table: String::new(),
                load_strategy: LoadStrategy::Insert,
                key_columns: Vec::new(),
                batch_size: 2,
                command_timeout_secs: 30,
                soft_delete: None,
                file: Some(LocalFileTargetConfig {
                    path: out.display().to_string(),
                    format: LocalFileFormat::JsonLines,
                    mode: Default::default(),
                    delimiter: None,
                }),
            },
            delta: DeltaSyncConfig::default(),
            policies: FailurePolicies::default(),
        }
    }

    fn pipeline(profile: ImportProfile, source: Box<dyn ImportSource>) -> ImportPipeline {
        let file = profile.target.file.clone().unwrap();
        ImportPipeline::new(profile, source, Box::new(LocalFileTarget::new(file))).unwrap()
    }

    #[tokio::test]
    async fn test_skip_row_counts_parse_failures() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let pipeline = pipeline(profile(&out), source(&[b"id,name\n1,ada\n\xff,x\n"], 0));

        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.result.inserted, 1);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.errors[0].kind, RowErrorKind::Parse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_recovers_from_source_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let mut profile = profile(&out);
        profile.policies.source = SourceFailurePolicy::Retry;
        profile.policies.source_retries = 2;

        let pipeline = pipeline(profile, source(&[b"id\n1\n"], 2));
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.result.inserted, 1);
    }

    #[tokio::test]
    async fn test_skip_policy_skips_unavailable_source() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let mut profile = profile(&out);
        profile.policies.source = SourceFailurePolicy::Skip;

        let summary = pipeline(profile, source(&[b"id\n1\n"], 1))
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.source_skipped);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_skip_file_writes_nothing_from_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let mut profile = profile(&out);
        profile.policies.parse = ParseFailurePolicy::SkipFile;

        let summary = pipeline(profile, source(&[b"id\n1\n2\n\xff\n", b"id\n3\n"], 0))
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.result.inserted, 1);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "{\"id\":\"3\"}\n");
    }

    #[tokio::test]
    async fn test_failed_row_threshold_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let mut profile = profile(&out);
        profile.policies.max_failed_rows = Some(1);
        profile.policies.rollback_on_abort = true;

        let err = pipeline(profile, source(&[b"id,name\n1,\xff\n"], 0))
            .run(CancellationToken::new())
            .await;
        // One failure stays under the limit
        assert!(err.is_ok());

        let mut profile = self::profile(&out);
        profile.policies.max_failed_rows = Some(0);
        profile.policies.rollback_on_abort = true;
        let err = pipeline(profile, source(&[b"id,name\n1,\xff\n"], 0))
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ImportError::Aborted { summary, .. } => {
                assert!(summary.compensation_required);
                assert_eq!(summary.parse_failures, 1);
            },
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = pipeline(profile(&out), source(&[b"id\n1\n"], 0))
            .run(cancel)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.result.processed(), 0);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_dry_run_classifies_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let mut profile = profile(&out);
        profile.delta.enabled = true;
        profile.delta.key_column = Some("id".to_string());

        let store = Arc::new(MemoryStateStore::new());
        let summary = pipeline(profile, source(&[b"id,name\n1,ada\n2,grace\n"], 0))
            .with_state_store(store.clone())
            .dry_run(true)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.delta.new, 2);
        assert!(!out.exists());
        assert!(store.load("people").await.unwrap().states.is_empty());
    }
}
