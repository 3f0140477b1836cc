//! Row model shared by parsers, the mapper, delta sync and targets

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::io::Read;
use uuid::Uuid;

// ============================================================================
// Values and rows
// ============================================================================

/// A single column value as emitted by a parser
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Textual form of a non-null value
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        }
    }

    /// Convert a JSON scalar; arrays and objects become compact JSON text
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            nested => Value::String(nested.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Bytes(b) => write!(f, "{}", hex::encode(b)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Ordered column map; insertion order is the source order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(IndexMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(IndexMap::with_capacity(capacity))
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(column.into(), value.into())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Lookup that prefers an exact match, then falls back to ASCII case-insensitive
    pub fn get_ci(&self, column: &str) -> Option<&Value> {
        self.0.get(column).or_else(|| {
            self.0
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(_, value)| value)
        })
    }

    pub fn contains_ci(&self, column: &str) -> bool {
        self.get_ci(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One record out of a parser
///
/// A row carrying `error` has no usable columns and never reaches a target.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub line: u64,
    pub columns: Row,
    pub error: Option<String>,
}

impl ParsedRow {
    pub fn ok(line: u64, columns: Row) -> Self {
        Self {
            line,
            columns,
            error: None,
        }
    }

    pub fn failed(line: u64, error: impl Into<String>) -> Self {
        Self {
            line,
            columns: Row::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ============================================================================
// Write outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowErrorKind {
    Constraint,
    Timeout,
    Type,
    Unknown,
    Parse,
}

impl fmt::Display for RowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RowErrorKind::Constraint => "Constraint",
            RowErrorKind::Timeout => "Timeout",
            RowErrorKind::Type => "Type",
            RowErrorKind::Unknown => "Unknown",
            RowErrorKind::Parse => "Parse",
        };
        f.write_str(name)
    }
}

/// One row-level failure, always attached to the result that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub row_number: u64,
    pub natural_key: Option<String>,
    pub message: String,
    pub kind: RowErrorKind,
}

impl RowError {
    pub fn new(
        row_number: u64,
        natural_key: Option<String>,
        kind: RowErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            row_number,
            natural_key,
            message: message.into(),
            kind,
        }
    }
}

/// Outcome of one write call
///
/// `inserted + updated + skipped + failed` equals the rows submitted, less
/// any rows never reached because the call was cancelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportBatchResult {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<RowError>,
    pub cancelled: bool,
}

impl ImportBatchResult {
    pub fn processed(&self) -> u64 {
        self.inserted + self.updated + self.skipped + self.failed
    }

    pub fn merge(&mut self, other: ImportBatchResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
        self.cancelled |= other.cancelled;
    }
}

// ============================================================================
// Delta sync and schema
// ============================================================================

/// Persisted hash for one tracked natural key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSyncState {
    pub profile_id: String,
    /// Normalised, possibly `KEY#n` for composite duplicates
    pub natural_key: String,
    /// Key column value as the target stores it
    pub key_value: String,
    pub row_hash: String,
    pub last_execution_id: Uuid,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub soft_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub max_length: Option<i64>,
    pub precision: Option<i64>,
    pub scale: Option<i64>,
}

// ============================================================================
// Source files
// ============================================================================

/// Listing entry, never carries payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub identifier: String,
    pub name: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One fetched unit of input; the byte stream is consumed exactly once
pub struct SourceFile {
    pub info: FileInfo,
    reader: Box<dyn Read + Send>,
}

impl SourceFile {
    /// Wrap a stream; names ending in `.gz` are decompressed on the fly
    pub fn new(info: FileInfo, reader: Box<dyn Read + Send>) -> Self {
        let reader: Box<dyn Read + Send> = if info.name.to_ascii_lowercase().ends_with(".gz") {
            Box::new(GzDecoder::new(reader))
        } else {
            reader
        };
        Self { info, reader }
    }

    pub fn from_bytes(info: FileInfo, bytes: Vec<u8>) -> Self {
        Self::new(info, Box::new(std::io::Cursor::new(bytes)))
    }

    pub fn identifier(&self) -> &str {
        &self.info.identifier
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.reader
    }
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile").field("info", &self.info).finish_non_exhaustive()
    }
}

// ============================================================================
// Execution summary
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaCounts {
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Everything one pipeline execution did
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub profile_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_archived: u64,
    pub rows_read: u64,
    pub parse_failures: u64,
    pub delta: DeltaCounts,
    /// Aggregate of every write call
    pub result: ImportBatchResult,
    /// Parse and delta-stage failures; write failures live in `result.errors`
    pub errors: Vec<RowError>,
    pub deletes_applied: u64,
    pub source_skipped: bool,
    pub cancelled: bool,
    pub aborted: Option<String>,
    pub compensation_required: bool,
}

impl ExecutionSummary {
    pub fn new(execution_id: Uuid, profile_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            execution_id,
            profile_id: profile_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            files_processed: 0,
            files_skipped: 0,
            files_archived: 0,
            rows_read: 0,
            parse_failures: 0,
            delta: DeltaCounts::default(),
            result: ImportBatchResult::default(),
            errors: Vec::new(),
            deletes_applied: 0,
            source_skipped: false,
            cancelled: false,
            aborted: None,
            compensation_required: false,
        }
    }

    /// Rows that failed at any stage
    pub fn failed_rows(&self) -> u64 {
        self.result.failed + self.parse_failures + self.delta.rejected
    }
}
