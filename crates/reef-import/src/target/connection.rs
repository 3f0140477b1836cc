//! Database connections behind one transaction-oriented interface
//!
//! [`SqlxConnection`] covers Postgres, MySQL and SQLite through the sqlx
//! `Any` driver; SQL Server lives in [`super::mssql`]. A transaction dropped
//! without commit is rolled back.

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _, Transaction};
use std::fmt;

use crate::models::{Row, RowErrorKind, Value};

/// Driver error reduced to what the dialects classify on
#[derive(Debug, Clone, PartialEq)]
pub struct DbError {
    /// Driver-native code: SQLSTATE, server error number or SQLite result code
    pub code: Option<String>,
    pub message: String,
    /// Set when the driver already knows the category
    pub kind_hint: Option<RowErrorKind>,
    /// The statement was abandoned mid-flight and the session cannot be reused
    pub broken: bool,
}

impl DbError {
    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            kind_hint: None,
            broken: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            kind_hint: Some(RowErrorKind::Timeout),
            broken: false,
        }
    }

    /// Client-side timeout that dropped the statement while the server was answering
    pub fn abandoned(message: impl Into<String>) -> Self {
        Self {
            broken: true,
            ..Self::timeout(message)
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DbError {}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let number = db
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number().to_string());
                let kind_hint = match db.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => Some(RowErrorKind::Constraint),
                    _ => None,
                };
                Self {
                    code: number.or_else(|| db.code().map(|c| c.into_owned())),
                    message: db.message().to_string(),
                    kind_hint,
                    broken: false,
                }
            },
            sqlx::Error::PoolTimedOut => Self::timeout(err.to_string()),
            _ => Self::new(None, err.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[async_trait]
pub trait TargetConnection: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn TargetTransaction>>;

    /// Run a read-only statement outside any transaction
    async fn query(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>>;

    async fn ping(&self) -> DbResult<()>;
}

#[async_trait]
pub trait TargetTransaction: Send {
    /// Rows affected
    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64>;

    async fn fetch(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>>;

    /// Unprepared statement without parameters (savepoints, truncation)
    async fn batch(&mut self, sql: &str) -> DbResult<()>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;

    /// Stop using the session after a statement was dropped mid-response
    ///
    /// Later calls fail or no-op; the server rolls back when the session closes.
    fn mark_broken(&mut self) {}
}

// ============================================================================
// sqlx Any
// ============================================================================

pub struct SqlxConnection {
    pool: AnyPool,
}

impl SqlxConnection {
    /// Requires [`crate::init`] to have installed the drivers
    pub async fn connect(url: &str) -> DbResult<Self> {
        let pool = AnyPoolOptions::new().max_connections(4).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

fn bind_all<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Any, AnyArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        Value::Null => query.bind(None::<String>),
        Value::String(s) => query.bind(s.clone()),
        Value::Integer(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Bool(b) => query.bind(*b),
        Value::Bytes(b) => query.bind(b.clone()),
    })
}

fn decode_column(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::Integer).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    Value::Null
}

fn decode_row(row: &AnyRow) -> Row {
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode_column(row, column.ordinal())))
        .collect()
}

#[async_trait]
impl TargetConnection for SqlxConnection {
    async fn begin(&self) -> DbResult<Box<dyn TargetTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqlxTransaction { tx }))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        let rows = bind_all(sql, params).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// sqlx rolls an uncommitted transaction back when it is dropped
pub struct SqlxTransaction {
    tx: Transaction<'static, Any>,
}

#[async_trait]
impl TargetTransaction for SqlxTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let result = bind_all(sql, params).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        let rows = bind_all(sql, params).fetch_all(&mut *self.tx).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn batch(&mut self, sql: &str) -> DbResult<()> {
        sqlx::Executor::execute(&mut *self.tx, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
