//! Import profile configuration
//!
//! A profile is loaded with the `config` crate from a TOML, JSON or YAML file.
//! Any field can be overridden from the environment with the `REEF__` prefix
//! and `__` as the nesting separator, e.g. `REEF__TARGET__BATCH_SIZE=500`.

use reef_common::types::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{ImportError, Result};
use crate::mapper::ColumnMapper;

// ============================================================================
// Profile
// ============================================================================

/// Everything needed to run one import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub mappings: Vec<ColumnMapping>,
    pub target: TargetConfig,
    #[serde(default)]
    pub delta: DeltaSyncConfig,
    #[serde(default)]
    pub policies: FailurePolicies,
}

impl ImportProfile {
    /// Load a profile file and apply `REEF__` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("REEF")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let profile: ImportProfile = settings.try_deserialize()?;
        profile.validate()?;
        Ok(profile)
    }

    /// Reject profiles missing required fields
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ImportError::config("profile id is required"));
        }

        self.source.validate()?;
        self.format.validate()?;
        self.target.validate()?;

        // Compiling the mapper rejects unknown transforms
        ColumnMapper::new(&self.mappings)?;

        if self.delta.enabled && self.delta.key_column.as_deref().map_or(true, str::is_empty) {
            return Err(ImportError::config(
                "delta.key_column is required when delta sync is enabled",
            ));
        }

        if self.delta.enabled
            && self.delta.track_deletes
            && self.delta.delete_mode == DeleteMode::Soft
            && self.target.kind == TargetKind::Database
            && self.target.soft_delete.is_none()
        {
            return Err(ImportError::config(
                "target.soft_delete is required when delta.delete_mode is soft",
            ));
        }

        if let Some(pct) = self.policies.max_failed_percent {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ImportError::config(format!(
                    "policies.max_failed_percent must be between 0 and 100, got {}",
                    pct
                )));
            }
        }

        if self.target.load_strategy == LoadStrategy::Upsert && self.key_columns().is_empty() {
            warn!(
                profile = %self.id,
                "Upsert requested without key columns; rows will be inserted"
            );
        }

        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Key columns from the target section, or from mappings flagged `is_key`
    pub fn key_columns(&self) -> Vec<String> {
        effective_key_columns(&self.target.key_columns, &self.mappings)
    }
}

pub(crate) fn effective_key_columns(explicit: &[String], mappings: &[ColumnMapping]) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    mappings
        .iter()
        .filter(|m| m.is_key)
        .map(|m| m.target_name().to_string())
        .collect()
}

// ============================================================================
// Source
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Ftp,
    Sftp,
    Http,
}

/// Which matching files a fetch returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileSelection {
    #[default]
    Latest,
    Oldest,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// File path, directory, or path whose file name is a glob
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub selection: FileSelection,
    #[serde(default)]
    pub archive_path: Option<String>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub http: Option<HttpSourceConfig>,
}

impl SourceConfig {
    fn validate(&self) -> Result<()> {
        match self.kind {
            SourceKind::Local => {
                if self.path.as_deref().map_or(true, str::is_empty) {
                    return Err(ImportError::config("source.path is required for local sources"));
                }
            },
            SourceKind::Ftp | SourceKind::Sftp => {
                if self.remote.is_none() {
                    return Err(ImportError::config(
                        "source.remote is required for FTP/SFTP sources",
                    ));
                }
                if self.path.as_deref().map_or(true, str::is_empty) {
                    return Err(ImportError::config("source.path is required for remote sources"));
                }
            },
            SourceKind::Http => match &self.http {
                Some(http) if !http.url.is_empty() => {},
                _ => return Err(ImportError::config("source.http.url is required for HTTP sources")),
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_remote_user")]
    pub username: String,
    /// Stored encrypted; passed through the [`SecretDecryptor`]
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_remote_user() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    #[default]
    None,
    Offset,
    Page,
    Cursor,
    Link,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default)]
    pub mode: PaginationMode,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub stop_on_empty_page: bool,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_limit_param")]
    pub limit_param: String,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_start_page")]
    pub start_page: u64,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    /// JSON path of the next cursor in the response body
    #[serde(default)]
    pub cursor_path: Option<String>,
    /// JSON path of the next link in the body when no `Link` header is sent
    #[serde(default)]
    pub next_link_path: Option<String>,
    /// JSON path of the record array, used to count records per page
    #[serde(default)]
    pub records_path: Option<String>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            mode: PaginationMode::None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            stop_on_empty_page: false,
            offset_param: default_offset_param(),
            limit_param: default_limit_param(),
            page_param: default_page_param(),
            start_page: default_start_page(),
            cursor_param: default_cursor_param(),
            cursor_path: None,
            next_link_path: None,
            records_path: None,
        }
    }
}

fn default_page_size() -> u64 {
    100
}
fn default_max_pages() -> u32 {
    1000
}
fn default_offset_param() -> String {
    "offset".to_string()
}
fn default_limit_param() -> String {
    "limit".to_string()
}
fn default_page_param() -> String {
    "page".to_string()
}
fn default_start_page() -> u64 {
    1
}
fn default_cursor_param() -> String {
    "cursor".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    pub url: String,
    /// Stored encrypted; passed through the [`SecretDecryptor`]
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub pagination: PaginationConfig,
}

fn default_http_timeout() -> u64 {
    60
}

// ============================================================================
// Format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Csv,
    Tsv,
    Json,
    JsonLines,
    Xml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default)]
    pub format: FileFormat,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default = "default_quote")]
    pub quote: char,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default)]
    pub trim: bool,
    #[serde(default)]
    pub null_value: Option<String>,
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub json_root_path: Option<String>,
    /// Treat `json` input as one document per line
    #[serde(default)]
    pub json_lines: bool,
    #[serde(default)]
    pub xml_record_xpath: Option<String>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            format: FileFormat::Csv,
            delimiter: None,
            quote: default_quote(),
            has_header: true,
            trim: false,
            null_value: None,
            skip_rows: 0,
            encoding: default_encoding(),
            json_root_path: None,
            json_lines: false,
            xml_record_xpath: None,
        }
    }
}

fn default_quote() -> char {
    '"'
}
fn default_true() -> bool {
    true
}
fn default_encoding() -> String {
    "utf-8".to_string()
}

impl FormatConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        let delimiter = self.delimiter.unwrap_or(match self.format {
            FileFormat::Tsv => '\t',
            _ => ',',
        });
        ascii_byte(delimiter, "delimiter")
    }

    pub fn quote_byte(&self) -> Result<u8> {
        ascii_byte(self.quote, "quote")
    }

    fn validate(&self) -> Result<()> {
        if matches!(self.format, FileFormat::Csv | FileFormat::Tsv) {
            self.delimiter_byte()?;
            self.quote_byte()?;
        }
        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            return Err(ImportError::config(format!(
                "Unknown encoding '{}'",
                self.encoding
            )));
        }
        Ok(())
    }
}

fn ascii_byte(c: char, what: &str) -> Result<u8> {
    if c.is_ascii() {
        Ok(c as u8)
    } else {
        Err(ImportError::config(format!(
            "{} must be a single ASCII character, got '{}'",
            what, c
        )))
    }
}

// ============================================================================
// Mappings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    Int,
    Long,
    Decimal,
    Bool,
    Datetime,
    String,
}

/// Source to target field rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    /// Defaults to the source column name
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub type_hint: Option<TypeHint>,
    #[serde(default)]
    pub default: Option<String>,
    /// `|`-separated chain, e.g. `trim|upper|left:10`
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub skip_on_null: bool,
}

impl ColumnMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: Some(target.into()),
            type_hint: None,
            default: None,
            transform: None,
            is_key: false,
            skip_on_null: false,
        }
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

// ============================================================================
// Target
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Database,
    LocalFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    SqlServer,
    MySql,
    Postgres,
    Sqlite,
}

impl DialectKind {
    /// Infer from a connection URL scheme
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(DialectKind::Postgres),
            "mysql" | "mariadb" => Some(DialectKind::MySql),
            "sqlite" => Some(DialectKind::Sqlite),
            "mssql" | "sqlserver" => Some(DialectKind::SqlServer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    #[default]
    Insert,
    Upsert,
    FullReplace,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocalFileFormat {
    #[default]
    Auto,
    Csv,
    Json,
    JsonLines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileWriteMode {
    #[default]
    Append,
    Overwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFileTargetConfig {
    pub path: String,
    #[serde(default)]
    pub format: LocalFileFormat,
    #[serde(default)]
    pub mode: FileWriteMode,
    #[serde(default)]
    pub delimiter: Option<char>,
}

/// Column and value written instead of deleting rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftDeleteConfig {
    pub column: String,
    #[serde(default = "default_soft_delete_value")]
    pub value: String,
}

fn default_soft_delete_value() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(default)]
    pub dialect: Option<DialectKind>,
    /// Stored encrypted; passed through the [`SecretDecryptor`]
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Name used in logs and results instead of the secret string
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub load_strategy: LoadStrategy,
    #[serde(default)]
    pub key_columns: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub soft_delete: Option<SoftDeleteConfig>,
    #[serde(default)]
    pub file: Option<LocalFileTargetConfig>,
}

fn default_batch_size() -> usize {
    1000
}
fn default_command_timeout() -> u64 {
    30
}

impl TargetConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Explicit dialect, else inferred from the connection string
    pub fn resolved_dialect(&self, connection_string: &str) -> Result<DialectKind> {
        self.dialect
            .or_else(|| DialectKind::from_url(connection_string))
            .ok_or_else(|| {
                ImportError::config("target.dialect is required when it cannot be inferred")
            })
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ImportError::config("target.batch_size must be greater than 0"));
        }

        match self.kind {
            TargetKind::Database => {
                if self.connection_string.as_deref().map_or(true, str::is_empty) {
                    return Err(ImportError::config(
                        "target.connection_string is required for database targets",
                    ));
                }
                if self.table.trim().is_empty() {
                    return Err(ImportError::config("target.table is required for database targets"));
                }
                if self.table.split('.').count() > 2 {
                    return Err(ImportError::config(format!(
                        "target.table '{}' must be 'table' or 'schema.table'",
                        self.table
                    )));
                }
            },
            TargetKind::LocalFile => match &self.file {
                Some(file) if !file.path.is_empty() => {},
                _ => return Err(ImportError::config("target.file.path is required for file targets")),
            },
        }
        Ok(())
    }
}

// ============================================================================
// Delta sync
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    #[default]
    Strict,
    Skip,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NullStrategy {
    #[default]
    Strict,
    Skip,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyNormalization {
    Trim,
    Lowercase,
    RemoveWhitespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    #[default]
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSyncConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Natural key column of the mapped row
    #[serde(default)]
    pub key_column: Option<String>,
    #[serde(default)]
    pub hash_algorithm: ChecksumAlgorithm,
    #[serde(default)]
    pub track_deletes: bool,
    #[serde(default)]
    pub delete_mode: DeleteMode,
    #[serde(default)]
    pub duplicate_strategy: DuplicateStrategy,
    #[serde(default)]
    pub null_strategy: NullStrategy,
    #[serde(default = "default_normalization")]
    pub normalization: Vec<KeyNormalization>,
    #[serde(default)]
    pub numeric_precision: Option<u32>,
    #[serde(default)]
    pub strip_non_printable: bool,
    #[serde(default)]
    pub detect_schema_changes: bool,
    /// sqlx URL of the state database; in-memory state when absent
    #[serde(default)]
    pub state_connection: Option<String>,
}

fn default_normalization() -> Vec<KeyNormalization> {
    vec![KeyNormalization::Trim]
}

impl Default for DeltaSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_column: None,
            hash_algorithm: ChecksumAlgorithm::Sha256,
            track_deletes: false,
            delete_mode: DeleteMode::Hard,
            duplicate_strategy: DuplicateStrategy::Strict,
            null_strategy: NullStrategy::Strict,
            normalization: default_normalization(),
            numeric_precision: None,
            strip_non_printable: false,
            detect_schema_changes: false,
            state_connection: None,
        }
    }
}

// ============================================================================
// Failure policies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceFailurePolicy {
    #[default]
    Fail,
    Skip,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    Fail,
    #[default]
    SkipRow,
    SkipFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    Fail,
    #[default]
    SkipRow,
    Rollback,
}

/// Constraint handling; when unset the row policy applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPolicy {
    Fail,
    SkipRow,
    Overwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePolicies {
    #[serde(default)]
    pub source: SourceFailurePolicy,
    #[serde(default = "default_retries")]
    pub source_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub parse: ParseFailurePolicy,
    #[serde(default)]
    pub row: RowFailurePolicy,
    #[serde(default)]
    pub constraint: Option<ConstraintPolicy>,
    #[serde(default)]
    pub max_failed_rows: Option<u64>,
    #[serde(default)]
    pub max_failed_percent: Option<f64>,
    #[serde(default)]
    pub rollback_on_abort: bool,
}

fn default_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for FailurePolicies {
    fn default() -> Self {
        Self {
            source: SourceFailurePolicy::Fail,
            source_retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            parse: ParseFailurePolicy::SkipRow,
            row: RowFailurePolicy::SkipRow,
            constraint: None,
            max_failed_rows: None,
            max_failed_percent: None,
            rollback_on_abort: false,
        }
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Decrypts credentials stored encrypted at rest
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, value: &str) -> Result<String>;
}

/// Passes values through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextDecryptor;

impl SecretDecryptor for PlainTextDecryptor {
    fn decrypt(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const PROFILE: &str = r#"
id = "orders"

[source]
type = "local"
path = "/data/in/orders.csv"

[target]
type = "database"
dialect = "postgres"
connection_string = "postgres://reef@localhost/reef"
table = "public.orders"
load_strategy = "upsert"
key_columns = ["order_id"]
"#;

    fn write_profile(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_profile_with_defaults() {
        let file = write_profile(PROFILE);
        let profile = ImportProfile::load(file.path()).unwrap();

        assert_eq!(profile.id, "orders");
        assert_eq!(profile.format.format, FileFormat::Csv);
        assert!(profile.format.has_header);
        assert_eq!(profile.target.batch_size, 1000);
        assert_eq!(profile.policies.row, RowFailurePolicy::SkipRow);
        assert_eq!(profile.key_columns(), vec!["order_id".to_string()]);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_profile() {
        let file = write_profile(PROFILE);
        std::env::set_var("REEF__TARGET__BATCH_SIZE", "250");
        let profile = ImportProfile::load(file.path());
        std::env::remove_var("REEF__TARGET__BATCH_SIZE");

        assert_eq!(profile.unwrap().target.batch_size, 250);
    }

    #[test]
    #[serial]
    fn test_missing_table_is_configuration_error() {
        let file = write_profile(&PROFILE.replace("table = \"public.orders\"", ""));
        let err = ImportProfile::load(file.path()).unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }

    #[test]
    #[serial]
    fn test_soft_deletes_need_flag_column() {
        let contents = format!(
            "{}\n[delta]\nenabled = true\nkey_column = \"order_id\"\ntrack_deletes = true\ndelete_mode = \"soft\"\n",
            PROFILE
        );
        let file = write_profile(&contents);
        let err = ImportProfile::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("soft_delete"));
    }

    #[test]
    fn test_dialect_inferred_from_url() {
        assert_eq!(DialectKind::from_url("mysql://root@db/app"), Some(DialectKind::MySql));
        assert_eq!(DialectKind::from_url("sqlite::memory:"), Some(DialectKind::Sqlite));
        assert_eq!(DialectKind::from_url("Server=db;Database=app"), None);
    }

    #[test]
    fn test_key_columns_fall_back_to_mappings() {
        let mut id = ColumnMapping::new("Id", "order_id");
        id.is_key = true;
        let keys = effective_key_columns(&[], &[id, ColumnMapping::new("Name", "name")]);
        assert_eq!(keys, vec!["order_id".to_string()]);
    }

    #[test]
    fn test_tsv_defaults_to_tab() {
        let format = FormatConfig {
            format: FileFormat::Tsv,
            ..Default::default()
        };
        assert_eq!(format.delimiter_byte().unwrap(), b'\t');
    }
}
