//! Semantic product search over product embeddings.
//!
//! The request is embedded and compared with `vip_products.embedding`. On
//! the primary the ranking is pgvector's `<->`; the mirror stores vectors as
//! text, so there every embedded product is read and ranked in process with
//! the same Euclidean metric.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use shelfwise_core::handler::Handler;
use shelfwise_core::models::{Request, SqlValue, Table};
use shelfwise_core::names::{resolve_with, BRAND_NAME_COLUMNS, PRODUCT_NAME_COLUMNS, UNKNOWN_NAME};
use shelfwise_core::schema::{Dialect, BRANDS_TABLE, PRODUCTS_TABLE};
use shelfwise_core::vector::{format_vector, nearest, parse_vector};

use crate::embedding::Embedder;
use crate::handlers::lookup::NO_MATCH_REPLY;
use crate::llm::TextGenerator;
use crate::router::DataAccessRouter;

/// Score while an embedding provider is configured.
pub const SEMANTIC_SCORE: f64 = 0.6;

pub struct SemanticSearchHandler {
    router: Arc<DataAccessRouter>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn TextGenerator>,
    limit: usize,
}

impl SemanticSearchHandler {
    pub fn new(
        router: Arc<DataAccessRouter>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        limit: usize,
    ) -> Self {
        Self {
            router,
            embedder,
            generator,
            limit,
        }
    }

    /// The `limit` products nearest to `query`.
    async fn nearest_products(&self, query: &[f32]) -> Result<Table> {
        let literal = format_vector(query);
        let limit = self.limit as i64;
        let (dialect, table) = self
            .router
            .query_with(|dialect| match dialect {
                Dialect::Postgres => (
                    format!(
                        "SELECT * FROM {} WHERE embedding IS NOT NULL ORDER BY embedding <-> $1::vector LIMIT $2",
                        PRODUCTS_TABLE
                    ),
                    vec![SqlValue::from(literal.as_str()), SqlValue::Integer(limit)],
                ),
                Dialect::Sqlite => (
                    format!("SELECT * FROM {} WHERE embedding IS NOT NULL", PRODUCTS_TABLE),
                    Vec::new(),
                ),
            })
            .await?;

        Ok(match dialect {
            Dialect::Postgres => table,
            Dialect::Sqlite => rank_by_embedding(table, query, self.limit),
        })
    }

    async fn brands_for(&self, products: &Table) -> Result<HashMap<String, String>> {
        let mut ids: Vec<SqlValue> = Vec::new();
        for row in 0..products.len() {
            if let Some(id) = products.get(row, "vip_brand_id").filter(|v| !v.is_null()) {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let slots: Vec<String> = (1..=ids.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "SELECT * FROM {} WHERE vip_brand_id IN ({})",
            BRANDS_TABLE,
            slots.join(", ")
        );
        let brands = self.router.query(&sql, &ids).await?;
        Ok(brand_names(&brands))
    }
}

/// Keep the `k` rows whose `embedding` text is nearest to `query`.
pub fn rank_by_embedding(table: Table, query: &[f32], k: usize) -> Table {
    let candidates: Vec<Option<Vec<f32>>> = (0..table.len())
        .map(|row| table.text(row, "embedding").and_then(|t| parse_vector(&t)))
        .collect();
    let order = nearest(query, &candidates, k);
    let rows = order.into_iter().map(|i| table.rows[i].clone()).collect();
    Table::new(table.columns).with_rows(rows)
}

/// Brand display names keyed by `vip_brand_id`.
pub fn brand_names(brands: &Table) -> HashMap<String, String> {
    (0..brands.len())
        .filter_map(|row| {
            let id = brands.text(row, "vip_brand_id")?;
            let name = resolve_with(BRAND_NAME_COLUMNS, |c| brands.text(row, c));
            Some((id, name))
        })
        .collect()
}

/// `"<product> by <brand>"` for one product row.
pub fn product_label(products: &Table, row: usize, brands: &HashMap<String, String>) -> String {
    let product = resolve_with(PRODUCT_NAME_COLUMNS, |c| products.text(row, c));
    let brand = products
        .text(row, "vip_brand_id")
        .and_then(|id| brands.get(&id).cloned())
        .unwrap_or_else(|| UNKNOWN_NAME.to_string());
    format!("{} by {}", product, brand)
}

#[async_trait]
impl Handler for SemanticSearchHandler {
    fn name(&self) -> &str {
        "semantic_search"
    }

    fn description(&self) -> &str {
        "Finds products similar in meaning to the request using embeddings"
    }

    async fn score(&self, _request: &Request) -> Result<f64> {
        Ok(if self.embedder.is_enabled() {
            SEMANTIC_SCORE
        } else {
            0.0
        })
    }

    async fn handle(&self, request: &Request) -> Result<String> {
        if !self.embedder.is_enabled() {
            bail!("semantic search needs an embedding provider");
        }
        let query = self.embedder.embed_query(&request.text).await?;
        let products = self.nearest_products(&query).await?;
        debug!(matches = products.len(), "semantic search");

        if products.is_empty() {
            if self.generator.is_enabled() {
                return self
                    .generator
                    .generate(&request.text, &request.history, None)
                    .await;
            }
            return Ok(NO_MATCH_REPLY.to_string());
        }

        let brands = self.brands_for(&products).await?;
        let lines: Vec<String> = (0..products.len())
            .map(|row| product_label(&products, row, &brands))
            .collect();

        if self.generator.is_enabled() {
            let context = format!("Products related to the request:\n{}", lines.join("\n"));
            self.generator
                .generate(&request.text, &request.history, Some(&context))
                .await
        } else {
            Ok(format!("These products look closest:\n{}", lines.join("\n")))
        }
    }
}
