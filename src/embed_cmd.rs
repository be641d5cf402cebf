//! Backfill of `vip_products.embedding`.
//!
//! Each product is embedded as `"<product> by <brand>"`, the same label the
//! semantic search handler shows. `pending` only touches products without a
//! vector; `rebuild` re-embeds every product in place, so a failed batch
//! leaves the previous vectors usable.

use anyhow::{bail, Result};
use tracing::{info, warn};

use shelfwise_core::models::SqlValue;
use shelfwise_core::names::{resolve_with, PRODUCT_NAME_COLUMNS, UNKNOWN_NAME};
use shelfwise_core::schema::{Dialect, BRANDS_TABLE, PRODUCTS_TABLE};
use shelfwise_core::store::DataStore;
use shelfwise_core::vector::format_vector;

use crate::embedding::Embedder;
use crate::handlers::semantic::{brand_names, product_label};

/// Which products to embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexScope {
    /// Products whose embedding is NULL.
    Pending,
    /// Every product.
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub candidates: usize,
    pub embedded: u64,
    pub failed: u64,
    /// Products without any usable name.
    pub skipped: u64,
}

struct Candidate {
    id: SqlValue,
    text: String,
}

/// Products in `scope`, ordered by id, at most `limit`.
async fn find_candidates(
    store: &dyn DataStore,
    scope: IndexScope,
    limit: Option<usize>,
) -> Result<(Vec<Candidate>, u64)> {
    let mut sql = format!("SELECT * FROM {}", PRODUCTS_TABLE);
    if scope == IndexScope::Pending {
        sql.push_str(" WHERE embedding IS NULL");
    }
    sql.push_str(" ORDER BY vip_product_id");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    let products = store.query(&sql, &[]).await?;

    let brands = store
        .query(&format!("SELECT * FROM {}", BRANDS_TABLE), &[])
        .await?;
    let brands = brand_names(&brands);

    let mut skipped = 0u64;
    let mut candidates = Vec::with_capacity(products.len());
    for row in 0..products.len() {
        let Some(id) = products.get(row, "vip_product_id").cloned() else {
            skipped += 1;
            continue;
        };
        if resolve_with(PRODUCT_NAME_COLUMNS, |c| products.text(row, c)) == UNKNOWN_NAME {
            skipped += 1;
            continue;
        }
        let text = product_label(&products, row, &brands);
        candidates.push(Candidate { id, text });
    }
    Ok((candidates, skipped))
}

fn update_sql(dialect: Dialect) -> String {
    let cast = match dialect {
        Dialect::Postgres => "::vector",
        Dialect::Sqlite => "",
    };
    format!(
        "UPDATE {} SET embedding = $1{} WHERE vip_product_id = $2",
        PRODUCTS_TABLE, cast
    )
}

/// Number of products `pending` would embed.
pub async fn count_pending(store: &dyn DataStore, limit: Option<usize>) -> Result<usize> {
    let (candidates, _) = find_candidates(store, IndexScope::Pending, limit).await?;
    Ok(candidates.len())
}

/// Embed products in batches of `batch_size` and store the vectors.
///
/// A batch the provider rejects is counted as failed and the run moves on;
/// a failed `UPDATE` aborts the run.
pub async fn index_products(
    store: &dyn DataStore,
    embedder: &dyn Embedder,
    batch_size: usize,
    scope: IndexScope,
    limit: Option<usize>,
) -> Result<IndexReport> {
    if !embedder.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    if batch_size == 0 {
        bail!("batch size must be > 0");
    }

    let (candidates, skipped) = find_candidates(store, scope, limit).await?;
    let mut report = IndexReport {
        candidates: candidates.len(),
        skipped,
        ..IndexReport::default()
    };
    let update = update_sql(store.dialect());

    for batch in candidates.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        match embedder.embed(&texts).await {
            Ok(vectors) => {
                for (item, vector) in batch.iter().zip(vectors.iter()) {
                    store
                        .execute(&update, &[format_vector(vector).into(), item.id.clone()])
                        .await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, size = batch.len(), "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    info!(
        model = embedder.model_name(),
        embedded = report.embedded,
        failed = report.failed,
        "product embeddings updated"
    );
    Ok(report)
}

/// Render a report the way the CLI prints it.
pub fn format_report(title: &str, report: &IndexReport) -> String {
    format!(
        "{}\n  products: {}\n  embedded: {}\n  failed: {}\n  skipped: {}",
        title, report.candidates, report.embedded, report.failed, report.skipped
    )
}
