//! Delta sync: content-hash change detection across executions
//!
//! Each mapped row gets a natural key and a content hash. Comparing them to
//! the previous execution's [`DeltaSnapshot`] classifies the row as new,
//! changed or unchanged; keys tracked before but not seen in this execution
//! are deletions. Each state also keeps the key column's value as written to
//! the target, since normalised and composite keys never appear there.

pub mod hash;
pub mod store;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DeltaSyncConfig, DuplicateStrategy};
use crate::error::{ImportError, Result};
use crate::models::{DeltaCounts, DeltaSyncState, Row, RowError, RowErrorKind};

pub use self::hash::{normalize_key, schema_fingerprint, RowHasher};
pub use self::store::{DeltaSnapshot, DeltaStateStore, MemoryStateStore, SqlStateStore};

/// Outcome for one row
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    New(String),
    Changed(String),
    Unchanged(String),
    /// Later occurrence of a key, dropped under [`DuplicateStrategy::Skip`]
    Duplicate(String),
    /// Row cannot take part in delta sync and is not written
    Rejected(RowError),
}

impl Classification {
    /// Key of a row that should be written
    pub fn write_key(&self) -> Option<&str> {
        match self {
            Classification::New(key) | Classification::Changed(key) => Some(key),
            _ => None,
        }
    }
}

pub struct DeltaClassifier {
    profile_id: String,
    config: DeltaSyncConfig,
    key_column: String,
    execution_id: Uuid,
    started: DateTime<Utc>,
    hasher: RowHasher,
    previous: HashMap<String, DeltaSyncState>,
    stored_fingerprint: Option<String>,
    fingerprint: Option<String>,
    schema_changed: bool,
    occurrences: HashMap<String, u32>,
    seen: HashSet<String>,
    seen_values: HashSet<String>,
    observed: HashMap<String, DeltaSyncState>,
    counts: DeltaCounts,
}

impl DeltaClassifier {
    pub fn new(
        profile_id: impl Into<String>,
        config: &DeltaSyncConfig,
        execution_id: Uuid,
        snapshot: DeltaSnapshot,
    ) -> Result<Self> {
        let key_column = config
            .key_column
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ImportError::config("delta.key_column is required when delta sync is enabled"))?;

        Ok(Self {
            profile_id: profile_id.into(),
            config: config.clone(),
            key_column,
            execution_id,
            started: Utc::now(),
            hasher: RowHasher::new(config),
            previous: snapshot.states,
            stored_fingerprint: snapshot.fingerprint,
            fingerprint: None,
            schema_changed: false,
            occurrences: HashMap::new(),
            seen: HashSet::new(),
            seen_values: HashSet::new(),
            observed: HashMap::new(),
            counts: DeltaCounts::default(),
        })
    }

    pub fn counts(&self) -> &DeltaCounts {
        &self.counts
    }

    pub fn schema_changed(&self) -> bool {
        self.schema_changed
    }

    pub fn classify(&mut self, line: u64, row: &Row) -> Classification {
        if self.config.detect_schema_changes && self.fingerprint.is_none() {
            self.check_schema(row);
        }

        let keyed = row
            .get_ci(&self.key_column)
            .and_then(|v| v.to_text())
            .map(|raw| (normalize_key(&raw, &self.config.normalization), raw))
            .filter(|(key, _)| !key.is_empty());
        let Some((base_key, key_value)) = keyed else {
            self.counts.rejected += 1;
            return Classification::Rejected(RowError::new(
                line,
                None,
                RowErrorKind::Type,
                format!("Missing natural key in column '{}'", self.key_column),
            ));
        };

        let occurrence = {
            let n = self.occurrences.entry(base_key.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let key = if occurrence == 1 {
            base_key
        } else {
            self.counts.duplicates += 1;
            match self.config.duplicate_strategy {
                DuplicateStrategy::Strict => {
                    self.counts.rejected += 1;
                    return Classification::Rejected(RowError::new(
                        line,
                        Some(base_key.clone()),
                        RowErrorKind::Constraint,
                        format!("Duplicate natural key '{}' (occurrence {})", base_key, occurrence),
                    ));
                },
                DuplicateStrategy::Skip => return Classification::Duplicate(base_key),
                DuplicateStrategy::Composite => format!("{}#{}", base_key, occurrence),
            }
        };

        let hash = self.hasher.hash(row);
        let prior = self.previous.get(&key);
        let classification = match prior {
            Some(state) if !state.soft_deleted && !self.schema_changed => {
                if state.row_hash == hash {
                    self.counts.unchanged += 1;
                    Classification::Unchanged(key.clone())
                } else {
                    self.counts.changed += 1;
                    Classification::Changed(key.clone())
                }
            },
            _ => {
                self.counts.new += 1;
                Classification::New(key.clone())
            },
        };

        let first_seen = prior.map(|s| s.first_seen).unwrap_or(self.started);
        self.seen.insert(key.clone());
        self.seen_values.insert(key_value.clone());
        self.observed.insert(
            key.clone(),
            DeltaSyncState {
                profile_id: self.profile_id.clone(),
                natural_key: key,
                key_value,
                row_hash: hash,
                last_execution_id: self.execution_id,
                first_seen,
                last_seen: self.started,
                soft_deleted: false,
            },
        );

        classification
    }

    fn check_schema(&mut self, row: &Row) {
        let fingerprint = schema_fingerprint(row);
        if let Some(stored) = &self.stored_fingerprint {
            if *stored != fingerprint {
                warn!(
                    profile = %self.profile_id,
                    "Record shape changed since the last run; every row is treated as new"
                );
                self.schema_changed = true;
            }
        }
        self.fingerprint = Some(fingerprint);
    }

    /// Drop the observed state of a row that failed to write
    ///
    /// The previous state, if any, is kept so the row is retried next run.
    pub fn forget(&mut self, key: &str) {
        if self.observed.remove(key).is_some() {
            debug!(key, "Discarding delta state of failed row");
        }
    }

    /// Tracked keys not seen in this execution, sorted
    pub fn deleted_keys(&self) -> Vec<String> {
        if !self.config.track_deletes {
            return Vec::new();
        }
        let mut keys: Vec<String> = self
            .previous
            .values()
            .filter(|s| !s.soft_deleted && !self.seen.contains(&s.natural_key))
            .map(|s| s.natural_key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Target key column values of the deleted keys, sorted
    ///
    /// A value still written this run is left out: under
    /// [`DuplicateStrategy::Composite`] `KEY#2` can vanish while `KEY` stays.
    pub fn deleted_key_values(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .deleted_keys()
            .iter()
            .filter_map(|key| self.previous.get(key))
            .map(|state| state.key_value.clone())
            .filter(|value| !self.seen_values.contains(value))
            .collect();
        values.sort();
        values.dedup();
        values
    }

    /// State to persist once the execution completed
    pub fn finish(mut self, deleted: &[String]) -> (DeltaSnapshot, DeltaCounts) {
        self.counts.deleted = deleted.len() as u64;

        let mut states = std::mem::take(&mut self.previous);
        for key in deleted {
            if let Some(state) = states.get_mut(key) {
                state.soft_deleted = true;
                state.last_execution_id = self.execution_id;
            }
        }
        states.extend(self.observed);

        let fingerprint = self.fingerprint.or(self.stored_fingerprint);
        (DeltaSnapshot { states, fingerprint }, self.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyNormalization;
    use crate::models::Value;

    fn config() -> DeltaSyncConfig {
        DeltaSyncConfig {
            enabled: true,
            key_column: Some("ReefId".to_string()),
            track_deletes: true,
            ..Default::default()
        }
    }

    fn row(id: &str, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("ReefId", id);
        row.insert("Name", name);
        row
    }

    fn run(config: &DeltaSyncConfig, snapshot: DeltaSnapshot, rows: &[Row]) -> (Vec<Classification>, DeltaSnapshot, DeltaCounts) {
        let mut classifier = DeltaClassifier::new("orders", config, Uuid::new_v4(), snapshot).unwrap();
        let classes = rows
            .iter()
            .enumerate()
            .map(|(i, r)| classifier.classify(i as u64 + 2, r))
            .collect();
        let deleted = classifier.deleted_keys();
        let (snapshot, counts) = classifier.finish(&deleted);
        (classes, snapshot, counts)
    }

    #[test]
    fn test_two_runs_classify_new_changed_deleted() {
        let config = config();
        let first = [row("1", "ada"), row("2", "grace"), row("3", "alan")];
        let (_, snapshot, counts) = run(&config, DeltaSnapshot::default(), &first);
        assert_eq!(counts.new, 3);

        let second = [row("1", "ada"), row("2", "grace hopper"), row("4", "edsger")];
        let (classes, snapshot, counts) = run(&config, snapshot, &second);
        assert_eq!(classes[0], Classification::Unchanged("1".to_string()));
        assert_eq!(classes[1], Classification::Changed("2".to_string()));
        assert_eq!(classes[2], Classification::New("4".to_string()));
        assert_eq!((counts.new, counts.changed, counts.unchanged, counts.deleted), (1, 1, 1, 1));
        assert!(snapshot.states["3"].soft_deleted);
        assert_eq!(snapshot.states.len(), 4);
    }

    #[test]
    fn test_soft_deleted_key_reappears_as_new() {
        let config = config();
        let (_, snapshot, _) = run(&config, DeltaSnapshot::default(), &[row("1", "a"), row("2", "b")]);
        let (_, snapshot, _) = run(&config, snapshot, &[row("1", "a")]);
        let (classes, snapshot, counts) = run(&config, snapshot, &[row("1", "a"), row("2", "b")]);

        assert_eq!(classes[1], Classification::New("2".to_string()));
        assert_eq!(counts.deleted, 0);
        assert!(!snapshot.states["2"].soft_deleted);
    }

    #[test]
    fn test_duplicate_strategies() {
        let rows = [row("1", "a"), row("1", "b"), row("1", "c")];

        let (classes, _, counts) = run(&config(), DeltaSnapshot::default(), &rows);
        assert!(matches!(&classes[1], Classification::Rejected(e) if e.kind == RowErrorKind::Constraint));
        assert_eq!((counts.duplicates, counts.rejected), (2, 2));

        let mut skip = config();
        skip.duplicate_strategy = DuplicateStrategy::Skip;
        let (classes, _, counts) = run(&skip, DeltaSnapshot::default(), &rows);
        assert_eq!(classes[2], Classification::Duplicate("1".to_string()));
        assert_eq!((counts.new, counts.rejected), (1, 0));

        let mut composite = config();
        composite.duplicate_strategy = DuplicateStrategy::Composite;
        let (classes, snapshot, _) = run(&composite, DeltaSnapshot::default(), &rows);
        assert_eq!(classes[1], Classification::New("1#2".to_string()));
        assert_eq!(classes[2], Classification::New("1#3".to_string()));
        assert_eq!(snapshot.states.len(), 3);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut row = row("  ", "nobody");
        let (classes, _, counts) = run(&config(), DeltaSnapshot::default(), &[row.clone()]);
        assert!(matches!(&classes[0], Classification::Rejected(e) if e.kind == RowErrorKind::Type));
        assert_eq!(counts.rejected, 1);

        row.insert("ReefId", Value::Null);
        let (classes, _, _) = run(&config(), DeltaSnapshot::default(), &[row]);
        assert!(matches!(classes[0], Classification::Rejected(_)));
    }

    #[test]
    fn test_normalized_keys_match_across_runs() {
        let mut config = config();
        config.normalization = vec![KeyNormalization::Trim, KeyNormalization::Lowercase];
        let (_, snapshot, _) = run(&config, DeltaSnapshot::default(), &[row(" AB ", "x")]);
        let (classes, _, _) = run(&config, snapshot, &[row("ab", "x")]);
        assert_eq!(classes[0], Classification::Unchanged("ab".to_string()));
    }

    #[test]
    fn test_deleted_values_keep_source_spelling() {
        let mut config = config();
        config.normalization = vec![KeyNormalization::Lowercase];
        let (_, snapshot, _) = run(&config, DeltaSnapshot::default(), &[row("A1", "x"), row("B2", "y")]);
        assert_eq!(snapshot.states["b2"].key_value, "B2");

        let mut classifier = DeltaClassifier::new("orders", &config, Uuid::new_v4(), snapshot).unwrap();
        classifier.classify(2, &row("A1", "x"));
        assert_eq!(classifier.deleted_keys(), vec!["b2".to_string()]);
        assert_eq!(classifier.deleted_key_values(), vec!["B2".to_string()]);
    }

    #[test]
    fn test_composite_delete_spares_remaining_occurrence() {
        let mut config = config();
        config.duplicate_strategy = DuplicateStrategy::Composite;
        let (_, snapshot, _) = run(
            &config,
            DeltaSnapshot::default(),
            &[row("1", "a"), row("1", "b"), row("2", "c")],
        );

        let mut classifier = DeltaClassifier::new("orders", &config, Uuid::new_v4(), snapshot).unwrap();
        classifier.classify(2, &row("1", "a"));
        assert_eq!(classifier.deleted_keys(), vec!["1#2".to_string(), "2".to_string()]);
        assert_eq!(classifier.deleted_key_values(), vec!["2".to_string()]);
    }

    #[test]
    fn test_schema_change_forces_new() {
        let mut config = config();
        config.detect_schema_changes = true;
        let (_, snapshot, _) = run(&config, DeltaSnapshot::default(), &[row("1", "a")]);

        let mut reshaped = row("1", "a");
        reshaped.insert("Email", "a@example.com");
        let mut classifier = DeltaClassifier::new("orders", &config, Uuid::new_v4(), snapshot).unwrap();
        assert_eq!(classifier.classify(2, &reshaped), Classification::New("1".to_string()));
        assert!(classifier.schema_changed());
    }

    #[test]
    fn test_forgotten_row_keeps_previous_state() {
        let config = config();
        let (_, snapshot, _) = run(&config, DeltaSnapshot::default(), &[row("1", "a")]);
        let old_hash = snapshot.states["1"].row_hash.clone();

        let mut classifier = DeltaClassifier::new("orders", &config, Uuid::new_v4(), snapshot).unwrap();
        assert_eq!(classifier.classify(2, &row("1", "b")), Classification::Changed("1".to_string()));
        classifier.forget("1");
        assert!(classifier.deleted_keys().is_empty());

        let (snapshot, _) = classifier.finish(&[]);
        assert_eq!(snapshot.states["1"].row_hash, old_hash);
    }

    #[test]
    fn test_deletes_not_tracked_when_disabled() {
        let mut config = config();
        config.track_deletes = false;
        let (_, snapshot, _) = run(&config, DeltaSnapshot::default(), &[row("1", "a")]);
        let (_, _, counts) = run(&config, snapshot, &[]);
        assert_eq!(counts.deleted, 0);
    }
}
