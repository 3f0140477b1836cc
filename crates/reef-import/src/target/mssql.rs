//! SQL Server connection over tiberius
//!
//! One TDS connection is shared; a transaction holds it exclusively until it
//! commits, rolls back or is dropped. A transaction that gave up on a
//! statement mid-response closes the session, and the next caller reconnects.

use async_trait::async_trait;
use std::sync::Arc;
use tiberius::{Client, ColumnData, Config, FromSql, Query};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::connection::{DbError, DbResult, TargetConnection, TargetTransaction};
use crate::models::{Row, Value};

type TdsClient = Client<Compat<TcpStream>>;

impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Server(token) => {
                DbError::new(Some(token.code().to_string()), token.message().to_string())
            },
            _ => DbError::new(None, err.to_string()),
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::new(None, err.to_string())
    }
}

/// ADO (`server=tcp:host,1433;...`) or JDBC/URL style connection strings
pub fn parse_config(connection_string: &str) -> DbResult<Config> {
    let trimmed = connection_string.trim();
    let lower = trimmed.to_ascii_lowercase();

    let config = if lower.starts_with("jdbc:") {
        Config::from_jdbc_string(trimmed)
    } else if lower.starts_with("sqlserver://") {
        Config::from_jdbc_string(&format!("jdbc:{}", trimmed))
    } else if lower.starts_with("mssql://") {
        Config::from_jdbc_string(&format!("jdbc:sqlserver://{}", &trimmed["mssql://".len()..]))
    } else {
        Config::from_ado_string(trimmed)
    };
    config.map_err(DbError::from)
}

pub struct MssqlConnection {
    config: Config,
    /// `None` after a transaction gave up on the session; the next user reconnects
    client: Arc<Mutex<Option<TdsClient>>>,
}

type Session = OwnedMutexGuard<Option<TdsClient>>;

async fn open(config: Config) -> DbResult<TdsClient> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Ok(Client::connect(config, tcp.compat_write()).await?)
}

fn live(session: &mut Session) -> DbResult<&mut TdsClient> {
    session
        .as_mut()
        .ok_or_else(|| DbError::new(None, "SQL Server session is closed"))
}

impl MssqlConnection {
    pub async fn connect(connection_string: &str) -> DbResult<Self> {
        let config = parse_config(connection_string)?;
        debug!("Connecting to SQL Server at {}", config.get_addr());
        let client = open(config.clone()).await?;

        Ok(Self {
            config,
            client: Arc::new(Mutex::new(Some(client))),
        })
    }

    /// Exclusive access to the session, reopening it if it was dropped
    async fn session(&self) -> DbResult<Session> {
        let mut session = self.client.clone().lock_owned().await;
        if session.is_none() {
            info!("Reconnecting to SQL Server at {}", self.config.get_addr());
            *session = Some(open(self.config.clone()).await?);
        }
        Ok(session)
    }
}

fn build_query<'a>(sql: &'a str, params: &[Value]) -> Query<'a> {
    let mut query = Query::new(sql);
    for value in params {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::String(s) => query.bind(s.clone()),
            Value::Integer(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Bool(b) => query.bind(*b),
            Value::Bytes(b) => query.bind(b.clone()),
        }
    }
    query
}

fn convert(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(|v| Value::Integer(i64::from(v))).unwrap_or_default(),
        ColumnData::I16(v) => v.map(|v| Value::Integer(i64::from(v))).unwrap_or_default(),
        ColumnData::I32(v) => v.map(|v| Value::Integer(i64::from(v))).unwrap_or_default(),
        ColumnData::I64(v) => v.map(Value::Integer).unwrap_or_default(),
        ColumnData::F32(v) => v.map(|v| Value::Float(f64::from(v))).unwrap_or_default(),
        ColumnData::F64(v) => v.map(Value::Float).unwrap_or_default(),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or_default(),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or_default(),
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string())).unwrap_or_default(),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::Bytes(b.to_vec())).unwrap_or_default(),
        ColumnData::Numeric(v) => v
            .map(|n| Value::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale()))))
            .unwrap_or_default(),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.clone().into_owned().into_string()))
            .unwrap_or_default(),
        other => chrono::NaiveDateTime::from_sql(other)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.format(crate::mapper::DATETIME_FORMAT).to_string()))
            .or_else(|| {
                chrono::DateTime::<chrono::Utc>::from_sql(other)
                    .ok()
                    .flatten()
                    .map(|dt| Value::String(dt.naive_utc().format(crate::mapper::DATETIME_FORMAT).to_string()))
            })
            .or_else(|| {
                chrono::NaiveDate::from_sql(other)
                    .ok()
                    .flatten()
                    .map(|d| Value::String(d.to_string()))
            })
            .unwrap_or_default(),
    }
}

fn convert_rows(rows: Vec<tiberius::Row>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
            names
                .into_iter()
                .zip(row.into_iter().map(|data| convert(&data)))
                .collect()
        })
        .collect()
}

#[async_trait]
impl TargetConnection for MssqlConnection {
    async fn begin(&self) -> DbResult<Box<dyn TargetTransaction>> {
        let mut session = self.session().await?;
        live(&mut session)?
            .simple_query("BEGIN TRAN")
            .await?
            .into_results()
            .await?;
        Ok(Box::new(MssqlTransaction {
            session: Some(session),
        }))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        let mut session = self.session().await?;
        let rows = build_query(sql, params)
            .query(live(&mut session)?)
            .await?
            .into_first_result()
            .await?;
        Ok(convert_rows(rows))
    }

    async fn ping(&self) -> DbResult<()> {
        let mut session = self.session().await?;
        live(&mut session)?
            .simple_query("SELECT 1")
            .await?
            .into_results()
            .await?;
        Ok(())
    }
}

pub struct MssqlTransaction {
    session: Option<Session>,
}

impl MssqlTransaction {
    fn client(&mut self) -> DbResult<&mut TdsClient> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DbError::new(None, "Transaction already finished"))?;
        live(session)
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> DbResult<()> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| DbError::new(None, "Transaction already finished"))?;
        live(&mut session)?
            .simple_query(statement)
            .await?
            .into_results()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TargetTransaction for MssqlTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let result = build_query(sql, params).execute(self.client()?).await?;
        Ok(result.total())
    }

    async fn fetch(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        let rows = build_query(sql, params)
            .query(self.client()?)
            .await?
            .into_first_result()
            .await?;
        Ok(convert_rows(rows))
    }

    async fn batch(&mut self, sql: &str) -> DbResult<()> {
        self.client()?.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.finish("COMMIT TRAN").await
    }

    async fn rollback(mut self: Box<Self>) -> DbResult<()> {
        // A closed session was rolled back by the server
        if self.session.as_ref().is_some_and(|s| s.is_none()) {
            self.session = None;
            return Ok(());
        }
        self.finish("IF @@TRANCOUNT > 0 ROLLBACK TRAN").await
    }

    fn mark_broken(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.take().is_some() {
                warn!("Closing SQL Server session left mid-response");
            }
        }
    }
}

impl Drop for MssqlTransaction {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let Some(client) = session.as_mut() else {
                        return;
                    };
                    let outcome = match client.simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRAN").await {
                        Ok(stream) => stream.into_results().await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        warn!("Rollback of abandoned SQL Server transaction failed: {}", e);
                    }
                });
            },
            Err(_) => warn!("SQL Server transaction dropped outside a runtime; connection left open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ado_and_url_strings() {
        assert!(parse_config("server=tcp:localhost,1433;user=sa;password=Secret1!;TrustServerCertificate=true").is_ok());
        assert!(parse_config("sqlserver://localhost:1433;user=sa;password=Secret1!").is_ok());
        assert!(parse_config("jdbc:sqlserver://localhost:1433;user=sa;password=Secret1!").is_ok());
    }

    #[test]
    fn test_numeric_conversion() {
        let numeric = tiberius::numeric::Numeric::new_with_scale(12345, 2);
        assert_eq!(convert(&ColumnData::Numeric(Some(numeric))), Value::Float(123.45));
        assert_eq!(convert(&ColumnData::I32(None)), Value::Null);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_live_ping() {
        let url = std::env::var("REEF_TEST_MSSQL_URL").unwrap();
        let conn = MssqlConnection::connect(&url).await.unwrap();
        conn.ping().await.unwrap();
    }
}
