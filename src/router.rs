//! Primary/mirror data access router.
//!
//! Every call resolves exactly one [`DataStore`]:
//!
//! 1. the primary, when configured and healthy;
//! 2. otherwise the mirror, when configured (built from the dump on demand);
//! 3. otherwise [`StoreError::NoDataStoreAvailable`].
//!
//! Primary health is `Unknown` until the first call checks it. While it is
//! `Unhealthy`, calls check it again so recovery is picked up on the next
//! request, but only one liveness check is in flight at a time: calls that
//! arrive while another is checking go straight to the mirror. The health
//! lock is never held across a liveness check. A read that fails on the primary with a
//! connectivity error flips health and is answered by the mirror. A write
//! never falls through: the primary may already have applied it.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use shelfwise_core::error::StoreError;
use shelfwise_core::models::{SqlValue, Table};
use shelfwise_core::schema::Dialect;
use shelfwise_core::store::{BackendKind, DataStore};

/// Provider of the current mirror snapshot.
#[async_trait]
pub trait MirrorSource: Send + Sync {
    /// The installed snapshot, if any.
    fn current(&self) -> Option<Arc<dyn DataStore>>;

    /// Build the mirror if it is not ready. Returns whether it is ready now.
    async fn ensure_ready(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
}

/// How a query should run on the store it lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    ReadOnly,
}

pub struct DataAccessRouter {
    primary: Option<Arc<dyn DataStore>>,
    mirror: Option<Arc<dyn MirrorSource>>,
    health: Mutex<Health>,
    probing: AtomicBool,
}

/// Clears the in-flight check flag, also when the checking call is dropped.
struct ProbeFlight<'a>(&'a AtomicBool);

impl Drop for ProbeFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DataAccessRouter {
    pub fn new(primary: Option<Arc<dyn DataStore>>, mirror: Option<Arc<dyn MirrorSource>>) -> Self {
        if primary.is_none() && mirror.is_none() {
            warn!("neither a primary nor a mirror is configured; every query will fail");
        }
        Self {
            primary,
            mirror,
            health: Mutex::new(Health::Unknown),
            probing: AtomicBool::new(false),
        }
    }

    pub async fn health(&self) -> Health {
        *self.health.lock().await
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    /// Resolve the store the next call would use.
    pub async fn active_store(&self) -> Result<Arc<dyn DataStore>, StoreError> {
        if let Some(primary) = &self.primary {
            if self.primary_usable(primary.as_ref()).await {
                return Ok(Arc::clone(primary));
            }
        }
        self.mirror_store().await
    }

    /// Run a row-returning statement on the resolved store.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.route(Mode::Normal, |_| (sql.to_string(), params.to_vec()))
            .await
            .map(|(_, table)| table)
    }

    /// Like [`query`](Self::query), but the store must refuse writes.
    pub async fn query_read_only(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.route(Mode::ReadOnly, |_| (sql.to_string(), params.to_vec()))
            .await
            .map(|(_, table)| table)
    }

    /// Run a statement built for the dialect of whichever store serves it.
    ///
    /// `build` is called once per store tried, so a failover re-renders the
    /// statement for the mirror. Returns the dialect that answered.
    pub async fn query_with<F>(&self, build: F) -> Result<(Dialect, Table), StoreError>
    where
        F: Fn(Dialect) -> (String, Vec<SqlValue>) + Send + Sync,
    {
        self.route(Mode::Normal, build).await
    }

    async fn route<F>(&self, mode: Mode, build: F) -> Result<(Dialect, Table), StoreError>
    where
        F: Fn(Dialect) -> (String, Vec<SqlValue>) + Send + Sync,
    {
        if let Some(primary) = &self.primary {
            if self.primary_usable(primary.as_ref()).await {
                let (sql, params) = build(primary.dialect());
                match run(primary.as_ref(), mode, &sql, &params).await {
                    Ok(table) => return Ok((primary.dialect(), table)),
                    Err(e) if e.is_unavailable() => {
                        self.mark_unhealthy(&e).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mirror = self.mirror_store().await?;
        debug!(backend = %mirror.kind(), "serving query from fallback");
        let (sql, params) = build(mirror.dialect());
        let table = run(mirror.as_ref(), mode, &sql, &params).await?;
        Ok((mirror.dialect(), table))
    }

    /// Run a statement for its effect on the resolved store.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        if let Some(primary) = &self.primary {
            if self.primary_usable(primary.as_ref()).await {
                return match primary.execute(sql, params).await {
                    Err(e) if e.is_unavailable() => {
                        self.mark_unhealthy(&e).await;
                        Err(e)
                    }
                    other => other,
                };
            }
        }

        let mirror = self.mirror_store().await?;
        warn!("writing to the mirror; the change is lost at the next sync");
        mirror.execute(sql, params).await
    }

    /// Probe the primary unless it is known healthy.
    ///
    /// With a mirror configured and the primary known down, a call that
    /// finds another check in flight skips checking and reports the primary
    /// unusable.
    async fn primary_usable(&self, primary: &dyn DataStore) -> bool {
        let before = *self.health.lock().await;
        if before == Health::Healthy {
            return true;
        }

        let _flight = if self.mirror.is_some() && before == Health::Unhealthy {
            if self.probing.swap(true, Ordering::AcqRel) {
                debug!("primary liveness check already in flight; using mirror");
                return false;
            }
            Some(ProbeFlight(&self.probing))
        } else {
            None
        };

        let result = primary.probe().await;

        let mut health = self.health.lock().await;
        match result {
            Ok(()) => {
                if *health == Health::Unhealthy {
                    info!("primary reachable again");
                }
                *health = Health::Healthy;
                true
            }
            Err(e) => {
                if *health != Health::Unhealthy {
                    warn!(error = %e, "primary unreachable; falling back to mirror");
                } else {
                    debug!(error = %e, "primary still unreachable");
                }
                *health = Health::Unhealthy;
                false
            }
        }
    }

    async fn mark_unhealthy(&self, err: &StoreError) {
        let mut health = self.health.lock().await;
        if *health != Health::Unhealthy {
            warn!(error = %err, "primary lost mid-call; falling back to mirror");
        }
        *health = Health::Unhealthy;
    }

    async fn mirror_store(&self) -> Result<Arc<dyn DataStore>, StoreError> {
        let mirror = self.mirror.as_ref().ok_or_else(|| {
            StoreError::NoDataStoreAvailable(if self.primary.is_some() {
                "primary unreachable and no mirror configured".to_string()
            } else {
                "no primary or mirror configured".to_string()
            })
        })?;

        if let Some(store) = mirror.current() {
            return Ok(store);
        }

        debug!("mirror not ready; building it from the dump");
        if mirror.ensure_ready().await {
            if let Some(store) = mirror.current() {
                return Ok(store);
            }
        }
        Err(StoreError::NoDataStoreAvailable(
            "primary unreachable and mirror not ready".to_string(),
        ))
    }
}

async fn run(store: &dyn DataStore, mode: Mode, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
    match mode {
        Mode::Normal => store.query(sql, params).await,
        Mode::ReadOnly => store.query_read_only(sql, params).await,
    }
}

impl std::fmt::Debug for DataAccessRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccessRouter")
            .field("primary", &self.primary.as_ref().map(|_| BackendKind::Primary))
            .field("mirror", &self.mirror.as_ref().map(|_| BackendKind::Mirror))
            .finish()
    }
}
