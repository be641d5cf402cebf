//! sqlx-backed [`DataStore`](shelfwise_core::store::DataStore) adapters.
//!
//! | Adapter | Backend | Role |
//! |---------|---------|------|
//! | [`PostgresStore`] | PostgreSQL pool, lazily connected | primary |
//! | [`SqliteStore`] | SQLite file | mirror |
//! | [`RetryingStore`] | any store | retries transient primary failures |

pub mod postgres;
pub mod retry;
pub mod sqlite;

pub use postgres::PostgresStore;
pub use retry::{RetryPolicy, RetryingStore};
pub use sqlite::SqliteStore;

use shelfwise_core::error::StoreError;
use shelfwise_core::store::BackendKind;

/// True for driver errors that mean the backend could not be reached.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Map a driver error onto the store taxonomy.
///
/// `unavailable_codes` lists backend-specific error codes that also count
/// as connectivity failures.
fn classify(kind: BackendKind, err: sqlx::Error, unavailable_codes: &[&str]) -> StoreError {
    if is_connection_error(&err) {
        return StoreError::unavailable(kind.to_string(), err.to_string());
    }
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if unavailable_codes.iter().any(|p| code.starts_with(p)) {
                StoreError::unavailable(kind.to_string(), err.to_string())
            } else {
                StoreError::Query(err.to_string())
            }
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::Decode {
            column: index.clone(),
            message: source.to_string(),
        },
        _ => StoreError::Query(err.to_string()),
    }
}

/// Rewrite `$n` placeholders to `?n`, leaving quoted text alone.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push(c);
                } else if c == '$' && chars.peek().map_or(false, |n| n.is_ascii_digit()) {
                    out.push('?');
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}
