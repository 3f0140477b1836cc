//! SQL dialects
//!
//! Every dialect-specific string the database target emits is produced here:
//! identifier quoting, placeholders, upsert shapes, savepoints, catalog
//! queries and driver error classification.

use crate::config::DialectKind;
use crate::models::RowErrorKind;
use crate::target::connection::DbError;

/// How an upsert statement reports whether it inserted or updated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// `OUTPUT $action` row with `INSERT` or `UPDATE`
    MergeAction,
    /// Rows affected: 2 update, 1 insert or a found row left unchanged, so
    /// an existence check runs first to tell the two apart
    RowsAffected,
    /// `RETURNING xmax`; 0 means the row was inserted
    Xmax,
    /// Existence probe inside the same transaction before the upsert
    Probe,
}

pub trait SqlDialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// Quote one identifier part, doubling embedded closing delimiters
    fn quote_identifier(&self, name: &str) -> String;

    /// 1-based bind placeholder
    fn placeholder(&self, index: usize) -> String;

    /// Bind parameters allowed in one statement
    fn max_parameters(&self) -> usize;

    fn upsert_outcome(&self) -> UpsertOutcome;

    fn upsert_sql(&self, table: &str, columns: &[String], keys: &[String]) -> String;

    fn clear_sql(&self, table: &str) -> String;

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", name)
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", name)
    }

    /// `None` where the server has no release statement
    fn release_savepoint_sql(&self, name: &str) -> Option<String> {
        Some(format!("RELEASE SAVEPOINT {}", name))
    }

    /// Catalog query; binds are [`SqlDialect::schema_params`]
    fn schema_sql(&self) -> String;

    /// Bind values for [`SqlDialect::schema_sql`]
    fn schema_params(&self, table: &str) -> Vec<String>;

    /// One-row existence probe by key; binds are the key values
    fn probe_sql(&self, table: &str, keys: &[String]) -> String {
        format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            self.qualified_name(table),
            self.key_predicate(keys, 1)
        )
    }

    fn classify_error(&self, error: &DbError) -> RowErrorKind;

    /// `schema.table` with each part quoted
    fn qualified_name(&self, table: &str) -> String {
        match split_table(table) {
            (Some(schema), name) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(name)
            ),
            (None, name) => self.quote_identifier(name),
        }
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `k1 = ? AND k2 = ?` with placeholders starting at `start`
    fn key_predicate(&self, keys: &[String], start: usize) -> String {
        keys.iter()
            .enumerate()
            .map(|(i, k)| format!("{} = {}", self.quote_identifier(k), self.placeholder(start + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn insert_sql(&self, table: &str, columns: &[String]) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_name(table),
            self.column_list(columns),
            self.placeholders(1, columns.len())
        )
    }

    /// Binds the non-key columns first, then the keys
    fn update_sql(&self, table: &str, columns: &[String], keys: &[String]) -> String {
        let assignments: Vec<String> = non_key_columns(columns, keys)
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_identifier(c), self.placeholder(i + 1)))
            .collect();
        let next = assignments.len() + 1;
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.qualified_name(table),
            assignments.join(", "),
            self.key_predicate(keys, next)
        )
    }

    fn delete_sql(&self, table: &str, key_column: &str, count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.qualified_name(table),
            self.quote_identifier(key_column),
            self.placeholders(1, count)
        )
    }

    /// Binds the flag value first, then the keys
    fn soft_delete_sql(&self, table: &str, key_column: &str, flag_column: &str, count: usize) -> String {
        format!(
            "UPDATE {} SET {} = {} WHERE {} IN ({})",
            self.qualified_name(table),
            self.quote_identifier(flag_column),
            self.placeholder(1),
            self.quote_identifier(key_column),
            self.placeholders(2, count)
        )
    }
}

pub fn dialect_for(kind: DialectKind) -> Box<dyn SqlDialect> {
    match kind {
        DialectKind::SqlServer => Box::new(SqlServerDialect),
        DialectKind::MySql => Box::new(MySqlDialect),
        DialectKind::Postgres => Box::new(PostgresDialect),
        DialectKind::Sqlite => Box::new(SqliteDialect),
    }
}

/// `schema.table` or `table`; one layer of quoting is kept for the dialect to strip
pub fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema.trim()), name.trim()),
        None => (None, table.trim()),
    }
}

/// Identifier with one layer of `open`/`close` delimiters removed
fn unquote(name: &str, open: char, close: char) -> &str {
    let name = name.trim();
    name.strip_prefix(open)
        .and_then(|n| n.strip_suffix(close))
        .unwrap_or(name)
}

fn non_key_columns<'a>(columns: &'a [String], keys: &'a [String]) -> impl Iterator<Item = &'a String> {
    columns
        .iter()
        .filter(move |c| !keys.iter().any(|k| k.eq_ignore_ascii_case(c)))
}

/// Assignment list for `ON CONFLICT` and `ON DUPLICATE KEY` upserts
///
/// With no non-key columns the first key is assigned to itself so the
/// statement still reports the matched row.
fn conflict_assignments(
    dialect: &dyn SqlDialect,
    columns: &[String],
    keys: &[String],
    source: impl Fn(&str) -> String,
) -> String {
    let mut targets: Vec<&String> = non_key_columns(columns, keys).collect();
    if targets.is_empty() {
        targets.extend(keys.first());
    }
    targets
        .iter()
        .map(|c| {
            let quoted = dialect.quote_identifier(c);
            format!("{} = {}", quoted, source(&quoted))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// SQL Server
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::SqlServer
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", unquote(name, '[', ']').replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn max_parameters(&self) -> usize {
        2100
    }

    fn upsert_outcome(&self) -> UpsertOutcome {
        UpsertOutcome::MergeAction
    }

    fn upsert_sql(&self, table: &str, columns: &[String], keys: &[String]) -> String {
        let on = keys
            .iter()
            .map(|k| {
                let k = self.quote_identifier(k);
                format!("target.{} = source.{}", k, k)
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let updates: Vec<String> = non_key_columns(columns, keys)
            .map(|c| {
                let c = self.quote_identifier(c);
                format!("target.{} = source.{}", c, c)
            })
            .collect();
        let source_values = columns
            .iter()
            .map(|c| format!("source.{}", self.quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "MERGE INTO {} WITH (HOLDLOCK) AS target USING (VALUES ({})) AS source ({}) ON {}",
            self.qualified_name(table),
            self.placeholders(1, columns.len()),
            self.column_list(columns),
            on
        );
        if !updates.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", ")));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({}) OUTPUT $action;",
            self.column_list(columns),
            source_values
        ));
        sql
    }

    fn clear_sql(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {}", self.qualified_name(table))
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVE TRANSACTION {}", name)
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TRANSACTION {}", name)
    }

    fn release_savepoint_sql(&self, _name: &str) -> Option<String> {
        None
    }

    fn schema_sql(&self) -> String {
        "SELECT c.COLUMN_NAME AS column_name, c.DATA_TYPE AS data_type, \
         CAST(CASE WHEN c.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS BIGINT) AS nullable, \
         CAST(CASE WHEN pk.COLUMN_NAME IS NULL THEN 0 ELSE 1 END AS BIGINT) AS is_primary_key, \
         CAST(c.CHARACTER_MAXIMUM_LENGTH AS BIGINT) AS max_length, \
         CAST(c.NUMERIC_PRECISION AS BIGINT) AS numeric_precision, \
         CAST(c.NUMERIC_SCALE AS BIGINT) AS numeric_scale \
         FROM INFORMATION_SCHEMA.COLUMNS c \
         LEFT JOIN ( \
             SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME \
             FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
             JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku \
               ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA \
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
         ) pk ON pk.TABLE_SCHEMA = c.TABLE_SCHEMA AND pk.TABLE_NAME = c.TABLE_NAME AND pk.COLUMN_NAME = c.COLUMN_NAME \
         WHERE c.TABLE_SCHEMA = @P1 AND c.TABLE_NAME = @P2 \
         ORDER BY c.ORDINAL_POSITION"
            .to_string()
    }

    fn schema_params(&self, table: &str) -> Vec<String> {
        let (schema, name) = split_table(table);
        vec![
            unquote(schema.unwrap_or("dbo"), '[', ']').to_string(),
            unquote(name, '[', ']').to_string(),
        ]
    }

    fn probe_sql(&self, table: &str, keys: &[String]) -> String {
        format!(
            "SELECT TOP 1 1 FROM {} WHERE {}",
            self.qualified_name(table),
            self.key_predicate(keys, 1)
        )
    }

    fn classify_error(&self, error: &DbError) -> RowErrorKind {
        if let Some(kind) = error.kind_hint {
            return kind;
        }
        match error.code.as_deref() {
            Some("2627" | "2601" | "547" | "515") => RowErrorKind::Constraint,
            Some("-2" | "1222") => RowErrorKind::Timeout,
            Some("245" | "8114" | "241" | "242" | "8115" | "8152" | "2628") => RowErrorKind::Type,
            _ => RowErrorKind::Unknown,
        }
    }
}

// ============================================================================
// MySQL
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::MySql
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", unquote(name, '`', '`').replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn max_parameters(&self) -> usize {
        65535
    }

    fn upsert_outcome(&self) -> UpsertOutcome {
        UpsertOutcome::RowsAffected
    }

    fn upsert_sql(&self, table: &str, columns: &[String], keys: &[String]) -> String {
        format!(
            "{} ON DUPLICATE KEY UPDATE {}",
            self.insert_sql(table, columns),
            conflict_assignments(self, columns, keys, |c| format!("VALUES({})", c))
        )
    }

    fn clear_sql(&self, table: &str) -> String {
        // TRUNCATE commits implicitly in MySQL
        format!("DELETE FROM {}", self.qualified_name(table))
    }

    fn schema_sql(&self) -> String {
        "SELECT COLUMN_NAME AS column_name, DATA_TYPE AS data_type, \
         CAST(CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS SIGNED) AS nullable, \
         CAST(CASE WHEN COLUMN_KEY = 'PRI' THEN 1 ELSE 0 END AS SIGNED) AS is_primary_key, \
         CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS max_length, \
         CAST(NUMERIC_PRECISION AS SIGNED) AS numeric_precision, \
         CAST(NUMERIC_SCALE AS SIGNED) AS numeric_scale \
         FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE()) AND TABLE_NAME = ? \
         ORDER BY ORDINAL_POSITION"
            .to_string()
    }

    fn schema_params(&self, table: &str) -> Vec<String> {
        let (schema, name) = split_table(table);
        vec![
            schema.map(|s| unquote(s, '`', '`').to_string()).unwrap_or_default(),
            unquote(name, '`', '`').to_string(),
        ]
    }

    fn classify_error(&self, error: &DbError) -> RowErrorKind {
        if let Some(kind) = error.kind_hint {
            return kind;
        }
        match error.code.as_deref() {
            Some("1062" | "1451" | "1452" | "1048" | "1586" | "3819") => RowErrorKind::Constraint,
            Some("1205" | "3024") => RowErrorKind::Timeout,
            Some("1264" | "1265" | "1366" | "1292" | "1406") => RowErrorKind::Type,
            _ => RowErrorKind::Unknown,
        }
    }
}

// ============================================================================
// Postgres
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", unquote(name, '"', '"').replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn max_parameters(&self) -> usize {
        65535
    }

    fn upsert_outcome(&self) -> UpsertOutcome {
        UpsertOutcome::Xmax
    }

    fn upsert_sql(&self, table: &str, columns: &[String], keys: &[String]) -> String {
        // xid has no Any mapping; cast through text
        format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {} RETURNING xmax::text::bigint AS xmax",
            self.insert_sql(table, columns),
            self.column_list(keys),
            conflict_assignments(self, columns, keys, |c| format!("EXCLUDED.{}", c))
        )
    }

    fn clear_sql(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {}", self.qualified_name(table))
    }

    fn schema_sql(&self) -> String {
        "SELECT c.column_name::text AS column_name, c.data_type::text AS data_type, \
         CAST(CASE WHEN c.is_nullable = 'YES' THEN 1 ELSE 0 END AS BIGINT) AS nullable, \
         CAST(CASE WHEN pk.column_name IS NULL THEN 0 ELSE 1 END AS BIGINT) AS is_primary_key, \
         CAST(c.character_maximum_length AS BIGINT) AS max_length, \
         CAST(c.numeric_precision AS BIGINT) AS numeric_precision, \
         CAST(c.numeric_scale AS BIGINT) AS numeric_scale \
         FROM information_schema.columns c \
         LEFT JOIN ( \
             SELECT ku.table_schema, ku.table_name, ku.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage ku \
               ON tc.constraint_name = ku.constraint_name AND tc.table_schema = ku.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
         ) pk ON pk.table_schema = c.table_schema AND pk.table_name = c.table_name AND pk.column_name = c.column_name \
         WHERE c.table_schema = $1 AND c.table_name = $2 \
         ORDER BY c.ordinal_position"
            .to_string()
    }

    fn schema_params(&self, table: &str) -> Vec<String> {
        let (schema, name) = split_table(table);
        vec![
            unquote(schema.unwrap_or("public"), '"', '"').to_string(),
            unquote(name, '"', '"').to_string(),
        ]
    }

    fn classify_error(&self, error: &DbError) -> RowErrorKind {
        if let Some(kind) = error.kind_hint {
            return kind;
        }
        match error.code.as_deref() {
            Some(code) if code.starts_with("23") => RowErrorKind::Constraint,
            Some("57014" | "55P03") => RowErrorKind::Timeout,
            Some(code) if code.starts_with("22") || code == "42804" => RowErrorKind::Type,
            _ => RowErrorKind::Unknown,
        }
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Embedded databases; upsert outcome comes from an existence probe
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", unquote(name, '"', '"').replace('"', "\"\""))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn max_parameters(&self) -> usize {
        999
    }

    fn upsert_outcome(&self) -> UpsertOutcome {
        UpsertOutcome::Probe
    }

    fn upsert_sql(&self, table: &str, columns: &[String], keys: &[String]) -> String {
        format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}",
            self.insert_sql(table, columns),
            self.column_list(keys),
            conflict_assignments(self, columns, keys, |c| format!("excluded.{}", c))
        )
    }

    fn clear_sql(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.qualified_name(table))
    }

    fn schema_sql(&self) -> String {
        "SELECT name AS column_name, type AS data_type, \
         CASE WHEN \"notnull\" = 0 THEN 1 ELSE 0 END AS nullable, \
         CASE WHEN pk > 0 THEN 1 ELSE 0 END AS is_primary_key, \
         NULL AS max_length, NULL AS numeric_precision, NULL AS numeric_scale \
         FROM pragma_table_info(?) ORDER BY cid"
            .to_string()
    }

    fn schema_params(&self, table: &str) -> Vec<String> {
        let (_, name) = split_table(table);
        vec![unquote(name, '"', '"').to_string()]
    }

    fn classify_error(&self, error: &DbError) -> RowErrorKind {
        if let Some(kind) = error.kind_hint {
            return kind;
        }
        // Extended result codes carry the primary code in the low byte
        match error.code.as_deref().and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff) {
            Some(19) => RowErrorKind::Constraint,
            Some(5 | 6) => RowErrorKind::Timeout,
            Some(20) => RowErrorKind::Type,
            _ => RowErrorKind::Unknown,
        }
    }
}
