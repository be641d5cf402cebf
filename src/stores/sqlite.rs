//! SQLite-backed [`DataStore`], used for the embedded mirror.

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Executor, Row, Sqlite, Statement, TypeInfo, ValueRef};
use tracing::warn;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shelfwise_core::error::StoreError;
use shelfwise_core::models::{SqlValue, Table};
use shelfwise_core::schema::Dialect;
use shelfwise_core::store::{BackendKind, DataStore};

use super::{classify, rewrite_placeholders};

// SQLITE_CANTOPEN, SQLITE_NOTADB
const UNAVAILABLE_CODES: &[&str] = &["14", "26"];

/// SQLite implementation of [`DataStore`].
///
/// The file uses the rollback journal rather than WAL so a finished mirror
/// is a single file that can be renamed into place.
pub struct SqliteStore {
    pool: SqlitePool,
    kind: BackendKind,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or with `create`, create) the database at `path`.
    pub async fn open(path: &Path, kind: BackendKind, create: bool) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| classify(kind, e, UNAVAILABLE_CODES))?;

        Ok(Self {
            pool,
            kind,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for all connections to close. Required before the file is moved.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn map_error(&self, err: sqlx::Error) -> StoreError {
        classify(self.kind, err, UNAVAILABLE_CODES)
    }

    /// Run `sql` on one connection. Column names come from the first row,
    /// or from the prepared statement when there are no rows.
    async fn fetch_table(
        &self,
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Table, StoreError> {
        let sql = rewrite_placeholders(sql);
        let rows = bind_params(&sql, params)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.map_error(e))?;

        let columns = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => (&mut *conn)
                .prepare(sql.as_str())
                .await
                .map_err(|e| self.map_error(e))?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };
        let mut table = Table::new(columns);
        for row in &rows {
            table.rows.push(decode_row(row)?);
        }
        Ok(table)
    }
}

/// Build a query over `sql` with `params` bound in order.
pub(crate) fn bind_params<'q>(
    sql: &'q str,
    params: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Bool(b) => query.bind(*b),
        };
    }
    query
}

fn decode_error(column: &str, err: impl ToString) -> StoreError {
    StoreError::Decode {
        column: column.to_string(),
        message: err.to_string(),
    }
}

/// Convert a row using each value's storage class.
fn decode_row(row: &SqliteRow) -> Result<Vec<SqlValue>, StoreError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let raw = row.try_get_raw(idx).map_err(|e| decode_error(name, e))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let storage = raw.type_info().name().to_uppercase();

        let value = match storage.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "INT8" => SqlValue::Integer(
                row.try_get_unchecked::<i64, _>(idx)
                    .map_err(|e| decode_error(name, e))?,
            ),
            "BOOLEAN" => SqlValue::Bool(
                row.try_get_unchecked::<bool, _>(idx)
                    .map_err(|e| decode_error(name, e))?,
            ),
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => SqlValue::Real(
                row.try_get_unchecked::<f64, _>(idx)
                    .map_err(|e| decode_error(name, e))?,
            ),
            "BLOB" => {
                let bytes = row
                    .try_get_unchecked::<Vec<u8>, _>(idx)
                    .map_err(|e| decode_error(name, e))?;
                SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => SqlValue::Text(
                row.try_get_unchecked::<String, _>(idx)
                    .map_err(|e| decode_error(name, e))?,
            ),
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl DataStore for SqliteStore {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn probe(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(|e| self.map_error(e))?;
        self.fetch_table(&mut conn, sql, params).await
    }

    async fn query_read_only(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(|e| self.map_error(e))?;
        sqlx::query("PRAGMA query_only = 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| self.map_error(e))?;

        let result = self.fetch_table(&mut conn, sql, params).await;

        if let Err(e) = sqlx::query("PRAGMA query_only = 0")
            .execute(&mut *conn)
            .await
        {
            warn!(error = %e, "could not clear query_only; dropping connection");
            conn.close_on_drop();
        }
        result
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let sql = rewrite_placeholders(sql);
        let result = bind_params(&sql, params)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(result.rows_affected())
    }
}
