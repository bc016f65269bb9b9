use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool, TypeInfo, ValueRef};

use super::StoreError;

/// A parameter or result cell for a prepared statement. All values cross
/// the engine boundary through this type; SQL strings never carry
/// interpolated data.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(s) => SqlValue::Text(s),
            None => SqlValue::Null,
        }
    }
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            SqlValue::Real(r) => Some(*r),
            SqlValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// Capability set every storage backend must provide. The rest of the
/// crate talks to backends only through this trait, so swapping the
/// concrete engine never touches router or writer code.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Execute one prepared statement; returns affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    /// Execute the same prepared statement for every row inside a single
    /// transaction. The whole batch commits or rolls back together.
    async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64, StoreError>;

    /// Execute an INSERT and return the id assigned to the new row.
    async fn insert_returning_id(&self, sql: &str, params: &[SqlValue]) -> Result<i64, StoreError>;

    async fn query_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, StoreError>;
}

/// Convenience accessors shared by every engine.
#[async_trait]
pub trait EngineExt: Engine {
    async fn query_strings(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<String>, StoreError> {
        let rows = self.query_rows(sql, params).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|v| match v {
                SqlValue::Text(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn query_i64(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, StoreError> {
        let rows = self.query_rows(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|v| v.as_integer()))
    }

    async fn query_string(&self, sql: &str, params: &[SqlValue]) -> Result<Option<String>, StoreError> {
        let rows = self.query_rows(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|v| match v {
                SqlValue::Text(s) => Some(s),
                _ => None,
            }))
    }
}

impl<T: Engine + ?Sized> EngineExt for T {}

/// SQLite-compatible engine backed by an sqlx pool. Connections are
/// validated before use and recycled hourly; the auth token is accepted
/// for interface parity with hosted providers and unused by the local
/// driver.
pub struct SqliteEngine {
    pool: SqlitePool,
}

impl SqliteEngine {
    pub async fn connect(url: &str, _auth_token: &str) -> Result<Self, StoreError> {
        let is_memory = url.contains(":memory:");
        let options = if is_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .unwrap_or(url);
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };
        let options = options.busy_timeout(Duration::from_secs(30));

        // A memory database exists per connection, so it must not be pooled.
        let max_connections = if is_memory { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .test_before_acquire(true)
            .max_lifetime(Some(Duration::from_secs(3600)))
            .connect_with(options)
            .await?;

        Ok(SqliteEngine { pool })
    }

    fn bind<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        params: &'q [SqlValue],
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for param in params {
            query = match param {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Integer(i) => query.bind(*i),
                SqlValue::Real(r) => query.bind(*r),
                SqlValue::Text(s) => query.bind(s.as_str()),
            };
        }
        query
    }

    fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Vec<SqlValue>, StoreError> {
        let mut values = Vec::with_capacity(row.columns().len());
        for (idx, _column) in row.columns().iter().enumerate() {
            let raw = row.try_get_raw(idx)?;
            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(idx)?),
                    "REAL" => SqlValue::Real(row.try_get::<f64, _>(idx)?),
                    _ => SqlValue::Text(row.try_get::<String, _>(idx)?),
                }
            };
            values.push(value);
        }
        Ok(values)
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let result = Self::bind(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn execute_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for row in rows {
            let result = Self::bind(sqlx::query(sql), row).execute(&mut *tx).await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn insert_returning_id(&self, sql: &str, params: &[SqlValue]) -> Result<i64, StoreError> {
        let result = Self::bind(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn query_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, StoreError> {
        let rows = Self::bind(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::decode_row).collect()
    }
}
