//! Storage abstraction for the inventory data.
//!
//! A [`DataStore`] wraps one physical backend: the networked primary or the
//! embedded mirror. Both speak the same interface so the router can swap one
//! for the other per call without callers noticing.
//!
//! SQL passed to any store uses positional `$1..$n` placeholders. Adapters
//! whose driver expects another syntax rewrite them.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::error::StoreError;
use crate::models::{SqlValue, Table};
use crate::schema::{
    inventory_view_sql, Dialect, InventorySchema, StoreSource, BRANDS_TABLE, ITEMS_TABLE,
    PRODUCTS_TABLE,
};

/// Which role a backend plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Primary,
    Mirror,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Primary => write!(f, "primary"),
            BackendKind::Mirror => write!(f, "mirror"),
        }
    }
}

/// Uniform query interface over one backend.
///
/// Connectivity failures must be reported as
/// [`StoreError::BackendUnavailable`]; the router relies on that to decide
/// whether to fail over. Statement errors are [`StoreError::Query`].
#[async_trait]
pub trait DataStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn dialect(&self) -> Dialect;

    /// Cheap liveness check (`SELECT 1`).
    async fn probe(&self) -> Result<(), StoreError>;

    /// Run a row-returning statement.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError>;

    /// Run a statement for its effect. Returns the affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    /// Run a row-returning statement that the backend must refuse to let
    /// modify anything. Backends without such a mode run it as [`query`](Self::query).
    async fn query_read_only(&self, sql: &str, params: &[SqlValue]) -> Result<Table, StoreError> {
        self.query(sql, params).await
    }

    /// Column names of `table`, empty when the table does not exist.
    async fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let result = self
            .query(self.dialect().columns_sql(), &[SqlValue::from(table)])
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }
}

/// Read the columns of the three inventory source tables.
pub async fn inventory_schema(store: &dyn DataStore) -> Result<InventorySchema, StoreError> {
    Ok(InventorySchema {
        items: store.columns(ITEMS_TABLE).await?,
        products: store.columns(PRODUCTS_TABLE).await?,
        brands: store.columns(BRANDS_TABLE).await?,
    })
}

/// Rebuild the `app_inventory` view against whatever columns `store` has.
///
/// Fails with [`StoreError::Query`] when one of the source tables is absent.
pub async fn refresh_inventory_view(store: &dyn DataStore) -> Result<StoreSource, StoreError> {
    let schema = inventory_schema(store).await?;
    let missing = schema.missing_tables();
    if !missing.is_empty() {
        return Err(StoreError::Query(format!(
            "cannot build inventory view, missing table(s): {}",
            missing.join(", ")
        )));
    }

    for statement in inventory_view_sql(store.dialect(), &schema) {
        store.execute(&statement, &[]).await?;
    }

    let source = schema.store_source();
    debug!(backend = %store.kind(), store_source = ?source, "inventory view refreshed");
    Ok(source)
}
