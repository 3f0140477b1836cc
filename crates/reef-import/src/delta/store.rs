//! Persistence of delta sync state between executions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DialectKind;
use crate::error::{ImportError, Result};
use crate::models::{DeltaSyncState, Row, RowErrorKind, Value};
use crate::target::connection::{DbError, SqlxConnection, TargetConnection};
use crate::target::dialect::{dialect_for, SqlDialect};

pub const STATE_TABLE: &str = "reef_delta_state";
pub const SCHEMA_TABLE: &str = "reef_delta_schema";

const STATE_COLUMNS: [&str; 8] = [
    "profile_id",
    "natural_key",
    "key_value",
    "row_hash",
    "last_execution_id",
    "first_seen",
    "last_seen",
    "soft_deleted",
];

/// Everything known about one profile after an execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaSnapshot {
    /// Keyed by normalised natural key
    pub states: HashMap<String, DeltaSyncState>,
    /// Record shape of the last run, when schema detection is on
    pub fingerprint: Option<String>,
}

#[async_trait]
pub trait DeltaStateStore: Send + Sync {
    async fn load(&self, profile_id: &str) -> Result<DeltaSnapshot>;

    /// Replace the stored state of a profile
    async fn save(&self, profile_id: &str, snapshot: &DeltaSnapshot) -> Result<()>;
}

/// Process-local store, used when no state connection is configured
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: RwLock<HashMap<String, DeltaSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeltaStateStore for MemoryStateStore {
    async fn load(&self, profile_id: &str) -> Result<DeltaSnapshot> {
        Ok(self.snapshots.read().await.get(profile_id).cloned().unwrap_or_default())
    }

    async fn save(&self, profile_id: &str, snapshot: &DeltaSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(profile_id.to_string(), snapshot.clone());
        Ok(())
    }
}

/// State kept in two tables of a sqlx-reachable database
///
/// Tables are created on connect. A save deletes the profile's rows and
/// inserts the new set inside one transaction, so each (profile, key) pair
/// exists exactly once.
pub struct SqlStateStore {
    connection: Box<dyn TargetConnection>,
    dialect: Box<dyn SqlDialect>,
}

fn state_error(error: DbError) -> ImportError {
    ImportError::Write {
        kind: RowErrorKind::Unknown,
        message: format!("delta state store: {}", error),
    }
}

impl SqlStateStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let kind = DialectKind::from_url(url)
            .ok_or_else(|| ImportError::config("delta.state_connection must be a postgres, mysql or sqlite URL"))?;
        if kind == DialectKind::SqlServer {
            return Err(ImportError::config(
                "delta.state_connection does not support SQL Server; use postgres, mysql or sqlite",
            ));
        }
        let connection = SqlxConnection::connect(url).await.map_err(state_error)?;
        Self::with_connection(Box::new(connection), dialect_for(kind)).await
    }

    pub async fn with_connection(connection: Box<dyn TargetConnection>, dialect: Box<dyn SqlDialect>) -> Result<Self> {
        let store = Self { connection, dialect };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let state = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             profile_id VARCHAR(200) NOT NULL, \
             natural_key VARCHAR(450) NOT NULL, \
             key_value VARCHAR(450) NOT NULL, \
             row_hash VARCHAR(128) NOT NULL, \
             last_execution_id VARCHAR(36) NOT NULL, \
             first_seen VARCHAR(40) NOT NULL, \
             last_seen VARCHAR(40) NOT NULL, \
             soft_deleted BIGINT NOT NULL, \
             PRIMARY KEY (profile_id, natural_key))",
            STATE_TABLE
        );
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             profile_id VARCHAR(200) NOT NULL PRIMARY KEY, \
             fingerprint VARCHAR(128) NOT NULL)",
            SCHEMA_TABLE
        );

        let mut tx = self.connection.begin().await.map_err(state_error)?;
        tx.execute(&state, &[]).await.map_err(state_error)?;
        tx.execute(&schema, &[]).await.map_err(state_error)?;
        tx.commit().await.map_err(state_error)?;
        Ok(())
    }

    fn insert_states_sql(&self, count: usize) -> String {
        let width = STATE_COLUMNS.len();
        let values = (0..count)
            .map(|i| format!("({})", self.dialect.placeholders(i * width + 1, width)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({}) VALUES {}", STATE_TABLE, STATE_COLUMNS.join(", "), values)
    }
}

fn text(row: &Row, column: &str) -> Result<String> {
    match row.get_ci(column) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(decode_error(column, "missing value")),
        Some(other) => Ok(other.to_string()),
    }
}

fn timestamp(row: &Row, column: &str) -> Result<DateTime<Utc>> {
    let raw = text(row, column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| decode_error(column, e))
}

fn decode_error(column: &str, error: impl std::fmt::Display) -> ImportError {
    ImportError::Database(sqlx::Error::Decode(
        format!("{}.{}: {}", STATE_TABLE, column, error).into(),
    ))
}

fn decode_state(row: &Row) -> Result<DeltaSyncState> {
    let soft_deleted = match row.get_ci("soft_deleted") {
        Some(Value::Integer(i)) => *i != 0,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s != "0",
        _ => false,
    };
    let execution = text(row, "last_execution_id")?;

    Ok(DeltaSyncState {
        profile_id: text(row, "profile_id")?,
        natural_key: text(row, "natural_key")?,
        key_value: text(row, "key_value")?,
        row_hash: text(row, "row_hash")?,
        last_execution_id: Uuid::parse_str(&execution).map_err(|e| decode_error("last_execution_id", e))?,
        first_seen: timestamp(row, "first_seen")?,
        last_seen: timestamp(row, "last_seen")?,
        soft_deleted,
    })
}

fn encode_state(state: &DeltaSyncState) -> [Value; 8] {
    [
        Value::from(state.profile_id.as_str()),
        Value::from(state.natural_key.as_str()),
        Value::from(state.key_value.as_str()),
        Value::from(state.row_hash.as_str()),
        Value::from(state.last_execution_id.to_string()),
        Value::from(state.first_seen.to_rfc3339()),
        Value::from(state.last_seen.to_rfc3339()),
        Value::Integer(i64::from(state.soft_deleted)),
    ]
}

#[async_trait]
impl DeltaStateStore for SqlStateStore {
    async fn load(&self, profile_id: &str) -> Result<DeltaSnapshot> {
        let states_sql = format!(
            "SELECT {} FROM {} WHERE profile_id = {}",
            STATE_COLUMNS.join(", "),
            STATE_TABLE,
            self.dialect.placeholder(1)
        );
        let rows = self
            .connection
            .query(&states_sql, &[Value::from(profile_id)])
            .await
            .map_err(state_error)?;

        let mut states = HashMap::with_capacity(rows.len());
        for row in &rows {
            let state = decode_state(row)?;
            states.insert(state.natural_key.clone(), state);
        }

        let fingerprint_sql = format!(
            "SELECT fingerprint FROM {} WHERE profile_id = {}",
            SCHEMA_TABLE,
            self.dialect.placeholder(1)
        );
        let fingerprint = self
            .connection
            .query(&fingerprint_sql, &[Value::from(profile_id)])
            .await
            .map_err(state_error)?
            .first()
            .map(|row| text(row, "fingerprint"))
            .transpose()?;

        debug!(profile = %profile_id, keys = states.len(), "Loaded delta state");
        Ok(DeltaSnapshot { states, fingerprint })
    }

    async fn save(&self, profile_id: &str, snapshot: &DeltaSnapshot) -> Result<()> {
        let by_profile = format!("WHERE profile_id = {}", self.dialect.placeholder(1));
        let mut tx = self.connection.begin().await.map_err(state_error)?;

        tx.execute(&format!("DELETE FROM {} {}", STATE_TABLE, by_profile), &[Value::from(profile_id)])
            .await
            .map_err(state_error)?;
        tx.execute(&format!("DELETE FROM {} {}", SCHEMA_TABLE, by_profile), &[Value::from(profile_id)])
            .await
            .map_err(state_error)?;

        let mut states: Vec<&DeltaSyncState> = snapshot.states.values().collect();
        states.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));

        let per_statement = (self.dialect.max_parameters() / STATE_COLUMNS.len()).clamp(1, 500);
        for chunk in states.chunks(per_statement) {
            let params: Vec<Value> = chunk.iter().flat_map(|s| encode_state(s)).collect();
            tx.execute(&self.insert_states_sql(chunk.len()), &params)
                .await
                .map_err(state_error)?;
        }

        if let Some(fingerprint) = &snapshot.fingerprint {
            let sql = format!(
                "INSERT INTO {} (profile_id, fingerprint) VALUES ({})",
                SCHEMA_TABLE,
                self.dialect.placeholders(1, 2)
            );
            tx.execute(&sql, &[Value::from(profile_id), Value::from(fingerprint.as_str())])
                .await
                .map_err(state_error)?;
        }

        tx.commit().await.map_err(state_error)?;
        info!(profile = %profile_id, keys = states.len(), "Saved delta state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(key: &str) -> DeltaSyncState {
        let now = Utc::now();
        DeltaSyncState {
            profile_id: "orders".to_string(),
            natural_key: key.to_string(),
            key_value: key.to_uppercase(),
            row_hash: format!("hash-{}", key),
            last_execution_id: Uuid::new_v4(),
            first_seen: now,
            last_seen: now,
            soft_deleted: false,
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load("orders").await.unwrap().states.is_empty());

        let mut snapshot = DeltaSnapshot::default();
        snapshot.states.insert("a".to_string(), state("a"));
        store.save("orders", &snapshot).await.unwrap();

        assert_eq!(store.load("orders").await.unwrap(), snapshot);
        assert!(store.load("customers").await.unwrap().states.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_replaces_state() {
        sqlx::any::install_default_drivers();
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("state.db").display());
        let store = SqlStateStore::connect(&url).await.unwrap();

        let mut snapshot = DeltaSnapshot {
            states: HashMap::new(),
            fingerprint: Some("shape-1".to_string()),
        };
        snapshot.states.insert("a".to_string(), state("a"));
        snapshot.states.insert("b".to_string(), state("b"));
        store.save("orders", &snapshot).await.unwrap();

        snapshot.states.get_mut("b").unwrap().soft_deleted = true;
        store.save("orders", &snapshot).await.unwrap();

        let loaded = store.load("orders").await.unwrap();
        assert_eq!(loaded.states.len(), 2);
        assert!(loaded.states["b"].soft_deleted);
        assert_eq!(loaded.states["a"].row_hash, "hash-a");
        assert_eq!(loaded.states["a"].key_value, "A");
        assert_eq!(loaded.fingerprint.as_deref(), Some("shape-1"));
    }

    #[tokio::test]
    async fn test_sql_server_state_url_rejected() {
        let err = SqlStateStore::connect("mssql://db/reef").await.err().unwrap();
        assert!(matches!(err, ImportError::Configuration(_)));
    }
}
