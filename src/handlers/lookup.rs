//! Product and brand lookups against `app_inventory`.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use shelfwise_core::handler::Handler;
use shelfwise_core::models::{Request, SqlValue, Table};
use shelfwise_core::names::resolve_name;
use shelfwise_core::schema::{store_labels, INVENTORY_VIEW};

use crate::router::DataAccessRouter;

pub const NO_MATCH_REPLY: &str = "I'm sorry, I couldn't find any matching products.";

const INVENTORY_WORDS: &[&str] = &[
    "product", "products", "brand", "brands", "stock", "stocked", "inventory", "availability",
    "available", "price", "prices", "bottle", "bottles", "case", "cases", "sku", "carry",
];

const SPIRIT_WORDS: &[&str] = &[
    "vodka", "gin", "rum", "tequila", "mezcal", "whiskey", "whisky", "bourbon", "scotch", "rye",
    "brandy", "cognac", "liqueur", "wine", "wines", "red", "white", "rose", "champagne",
    "prosecco", "beer", "lager", "ale", "cider", "seltzer", "sake", "vermouth",
];

const LOOKUP_VERBS: &[&str] = &["show", "find", "list", "search", "lookup", "where", "have", "got"];

const QUANTITY_PHRASES: &[&str] = &["how many", "how much", "in stock", "quantity", "left"];

/// Words never used as search terms.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "any", "are", "there", "what", "which", "with", "from",
    "that", "this", "all", "some", "me", "please", "can", "could", "would", "does", "did", "store",
    "stores", "location", "many", "much", "about", "tell", "give", "need", "want", "looking",
    "something", "our", "we", "do", "is", "in", "of", "at", "a", "an", "to",
];

static STORE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:store|location|shop)\s*(?:#|no\.?|number)?\s*([a-z]*_?\d+)\b").unwrap()
});

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9']+").unwrap());

pub struct InventoryLookupHandler {
    router: Arc<DataAccessRouter>,
    limit: i64,
}

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupQuery {
    pub terms: Vec<String>,
    pub store: Option<String>,
}

impl InventoryLookupHandler {
    pub fn new(router: Arc<DataAccessRouter>, limit: i64) -> Self {
        Self { router, limit }
    }
}

fn words(text: &str) -> Vec<String> {
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().trim_matches('\'').to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Relevance of `text` to an inventory lookup.
///
/// Inventory or drink vocabulary contributes 0.4 and a store reference 0.3.
/// Lookup verbs and quantity phrases add 0.2 each, but only alongside one of
/// the first two.
pub fn lookup_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let words = words(&lower);
    let has = |list: &[&str]| words.iter().any(|w| list.contains(&w.as_str()));

    let vocabulary = has(INVENTORY_WORDS) || has(SPIRIT_WORDS);
    let store = STORE_REF.is_match(&lower);
    if !vocabulary && !store {
        return 0.0;
    }

    let mut score = 0.0;
    if vocabulary {
        score += 0.4;
    }
    if store {
        score += 0.3;
    }
    if has(LOOKUP_VERBS) {
        score += 0.2;
    }
    if QUANTITY_PHRASES.iter().any(|p| lower.contains(p)) {
        score += 0.2;
    }
    f64::min(score, 1.0)
}

/// Split a request into search terms and an optional store reference.
pub fn parse_lookup(text: &str) -> LookupQuery {
    let lower = text.to_lowercase();
    let store = STORE_REF
        .captures(&lower)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let remainder = STORE_REF.replace_all(&lower, " ");

    let mut terms: Vec<String> = Vec::new();
    for word in words(&remainder) {
        let skip = word.len() < 3
            || STOP_WORDS.contains(&word.as_str())
            || INVENTORY_WORDS.contains(&word.as_str())
            || LOOKUP_VERBS.contains(&word.as_str())
            || word.chars().all(|c| c.is_ascii_digit());
        if !skip && !terms.contains(&word) {
            terms.push(word);
        }
    }

    LookupQuery { terms, store }
}

/// Parameterised SQL for `query`, capped at `limit` rows.
pub fn lookup_sql(query: &LookupQuery, limit: i64) -> (String, Vec<SqlValue>) {
    let mut params: Vec<SqlValue> = Vec::new();
    let mut filters: Vec<String> = Vec::new();

    if !query.terms.is_empty() {
        let mut matches = Vec::new();
        for term in &query.terms {
            params.push(format!("%{}%", term).into());
            let n = params.len();
            matches.push(format!(
                "LOWER(product_name) LIKE ${n} OR LOWER(brand_name) LIKE ${n}"
            ));
        }
        filters.push(format!("({})", matches.join(" OR ")));
    }

    if let Some(store) = &query.store {
        let mut slots = Vec::new();
        for label in store_labels(store) {
            params.push(label.into());
            slots.push(format!("${}", params.len()));
        }
        filters.push(format!("store IN ({})", slots.join(", ")));
    }

    params.push(limit.into());
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" AND "))
    };
    let sql = format!(
        "SELECT store, product_name, brand_name, quantity FROM {}{} ORDER BY store, product_name LIMIT ${}",
        INVENTORY_VIEW,
        where_clause,
        params.len()
    );
    (sql, params)
}

/// Render lookup rows as a reply.
pub fn format_rows(table: &Table) -> String {
    if table.is_empty() {
        return NO_MATCH_REPLY.to_string();
    }
    let mut lines = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let store = table.text(row, "store").unwrap_or_else(|| "unknown store".to_string());
        let product = resolve_name([table.text(row, "product_name").as_deref()]);
        let brand = resolve_name([table.text(row, "brand_name").as_deref()]);
        let mut line = format!("{}: {} by {}", store, product, brand);
        if let Some(quantity) = table.get(row, "quantity").and_then(SqlValue::as_i64) {
            line.push_str(&format!(" ({} in stock)", quantity));
        }
        lines.push(line);
    }
    format!("Here are some products I found:\n{}", lines.join("\n"))
}

#[async_trait]
impl Handler for InventoryLookupHandler {
    fn name(&self) -> &str {
        "inventory_lookup"
    }

    fn description(&self) -> &str {
        "Finds products and brands, optionally within one store"
    }

    async fn score(&self, request: &Request) -> Result<f64> {
        Ok(lookup_score(&request.text))
    }

    async fn handle(&self, request: &Request) -> Result<String> {
        let query = parse_lookup(&request.text);
        let (sql, params) = lookup_sql(&query, self.limit);
        debug!(terms = ?query.terms, store = ?query.store, "inventory lookup");
        let table = self.router.query(&sql, &params).await?;
        Ok(format_rows(&table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfwise_core::store::memory::MemoryStore;
    use shelfwise_core::store::{BackendKind, DataStore};

    #[test]
    fn test_vodka_in_store_scores_high() {
        assert!(lookup_score("Show me vodka in store 2") >= 0.6);
        assert!(lookup_score("How many bottles of gin are in stock?") >= 0.6);
    }

    #[test]
    fn test_unrelated_text_scores_zero() {
        assert_eq!(lookup_score("hello there"), 0.0);
        assert_eq!(lookup_score("show me the weather"), 0.0);
    }

    #[test]
    fn test_parse_lookup() {
        let q = parse_lookup("Show me vodka in store 2");
        assert_eq!(q.terms, vec!["vodka"]);
        assert_eq!(q.store.as_deref(), Some("2"));

        let q = parse_lookup("Do you carry Acme products at store #source_5?");
        assert_eq!(q.terms, vec!["acme"]);
        assert_eq!(q.store.as_deref(), Some("source_5"));
    }

    #[test]
    fn test_lookup_sql_is_parameterised() {
        let q = LookupQuery {
            terms: vec!["vodka".into()],
            store: Some("2".into()),
        };
        let (sql, params) = lookup_sql(&q, 10);
        assert!(sql.contains("LOWER(product_name) LIKE $1 OR LOWER(brand_name) LIKE $1"));
        assert!(sql.contains("store IN ($2, $3)"));
        assert!(sql.ends_with("LIMIT $4"));
        assert_eq!(
            params,
            vec![
                SqlValue::from("%vodka%"),
                SqlValue::from("2"),
                SqlValue::from("source_2"),
                SqlValue::Integer(10)
            ]
        );
    }

    #[test]
    fn test_lookup_sql_without_filters() {
        let (sql, params) = lookup_sql(&LookupQuery::default(), 5);
        assert!(!sql.contains("WHERE"));
        assert_eq!(params, vec![SqlValue::Integer(5)]);
    }

    #[test]
    fn test_format_rows() {
        let table = Table::new(vec![
            "store".into(),
            "product_name".into(),
            "brand_name".into(),
            "quantity".into(),
        ])
        .with_rows(vec![vec![
            "2".into(),
            "Vodka Classic".into(),
            SqlValue::Text("   ".into()),
            SqlValue::Integer(12),
        ]]);
        assert_eq!(
            format_rows(&table),
            "Here are some products I found:\n2: Vodka Classic by Unknown (12 in stock)"
        );
        assert_eq!(format_rows(&Table::default()), NO_MATCH_REPLY);
    }

    #[tokio::test]
    async fn test_handle_queries_router() {
        let store = Arc::new(MemoryStore::new(BackendKind::Primary));
        store.respond(
            "app_inventory",
            Table::new(vec!["store".into(), "product_name".into(), "brand_name".into()])
                .with_rows(vec![vec!["2".into(), "Vodka Classic".into(), "Acme".into()]]),
        );
        let primary: Arc<dyn DataStore> = store.clone();
        let handler = InventoryLookupHandler::new(Arc::new(DataAccessRouter::new(Some(primary), None)), 10);

        let reply = handler.handle(&Request::new("Show me vodka in store 2")).await.unwrap();
        assert_eq!(reply, "Here are some products I found:\n2: Vodka Classic by Acme");
        assert_eq!(store.calls()[0].params.len(), 4);
    }

    #[tokio::test]
    async fn test_handle_without_store_is_error() {
        let handler = InventoryLookupHandler::new(Arc::new(DataAccessRouter::new(None, None)), 10);
        assert!(handler.handle(&Request::new("vodka")).await.is_err());
    }
}
