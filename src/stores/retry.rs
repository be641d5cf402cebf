//! Bounded retry of transient connectivity failures.
//!
//! A dropped connection or a pool timeout on the primary is often gone a
//! moment later. [`RetryingStore`] retries calls that fail with
//! [`StoreError::BackendUnavailable`] before handing the error to the router,
//! which would otherwise switch traffic to the mirror on the first blip.
//!
//! # Retry Strategy
//!
//! - connectivity failure → retry after `interval`, doubling each time
//!   (capped at 32× the base interval)
//! - statement or decode error → returned immediately
//! - liveness checks are never retried, so a primary that is really down
//!   is noticed as fast as without retries

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use shelfwise_core::error::StoreError;
use shelfwise_core::models::{SqlValue, Table};
use shelfwise_core::schema::Dialect;
use shelfwise_core::store::{BackendKind, DataStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            interval: Duration::ZERO,
        }
    }

    fn delay(&self, retry: u32) -> Duration {
        self.interval * (1u32 << (retry - 1).min(5))
    }
}

/// [`DataStore`] decorator applying a [`RetryPolicy`] to queries and executes.
pub struct RetryingStore {
    inner: Arc<dyn DataStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn DataStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Err(e) if e.is_unavailable() && retry < self.policy.max_retries => {
                    retry += 1;
                    let delay = self.policy.delay(retry);
                    warn!(
                        backend = %self.inner.kind(),
                        op,
                        attempt = retry,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if retry > 0 {
                        debug!(backend = %self.inner.kind(), op, retries = retry, "giving up");
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl DataStore for RetryingStore {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn probe(&self) -> Result<(), StoreError> {
        self.inner.probe().await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.with_retries("query", || self.inner.query(sql, params)).await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.with_retries("execute", || self.inner.execute(sql, params)).await
    }

    async fn query_read_only(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.with_retries("query", || self.inner.query_read_only(sql, params))
            .await
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.with_retries("columns", || self.inner.columns(table)).await
    }
}
