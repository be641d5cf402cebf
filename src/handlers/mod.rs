//! Built-in handlers.
//!
//! | Handler | Score | Answers with |
//! |---------|-------|--------------|
//! | `aggregate_query` | 0.8 on aggregate phrasing | a generated read-only `SELECT` over `app_inventory` |
//! | `inventory_lookup` | inventory vocabulary, store references | a bounded parameterised lookup |
//! | `semantic_search` | 0.6 with an embedding provider, else 0 | the nearest products by embedding |
//! | `general_chat` | always 0.1 | the text generator |
//!
//! Registration order is the tie-break order.

pub mod aggregate;
pub mod chat;
pub mod lookup;
pub mod semantic;

pub use aggregate::AggregateQueryHandler;
pub use chat::GeneralChatHandler;
pub use lookup::InventoryLookupHandler;
pub use semantic::SemanticSearchHandler;

use std::sync::Arc;

use shelfwise_core::handler::HandlerRegistry;

use crate::config::HandlersConfig;
use crate::embedding::Embedder;
use crate::llm::TextGenerator;
use crate::router::DataAccessRouter;

/// Register the built-in handlers in their fixed order.
pub fn builtin_registry(
    router: Arc<DataAccessRouter>,
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn Embedder>,
    config: &HandlersConfig,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(AggregateQueryHandler::new(
        Arc::clone(&router),
        Arc::clone(&generator),
        config.aggregate_max_rows,
    )));
    registry.register(Arc::new(InventoryLookupHandler::new(
        Arc::clone(&router),
        config.lookup_limit,
    )));
    registry.register(Arc::new(SemanticSearchHandler::new(
        router,
        embedder,
        Arc::clone(&generator),
        config.semantic_limit,
    )));
    registry.register(Arc::new(GeneralChatHandler::new(generator)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use crate::llm::DisabledGenerator;

    #[test]
    fn test_builtin_order() {
        let router = Arc::new(DataAccessRouter::new(None, None));
        let registry = builtin_registry(
            router,
            Arc::new(DisabledGenerator),
            Arc::new(DisabledEmbedder),
            &HandlersConfig::default(),
        );
        let names: Vec<&str> = registry.handlers().iter().map(|h| h.name()).collect();
        assert_eq!(
            names,
            vec!["aggregate_query", "inventory_lookup", "semantic_search", "general_chat"]
        );
    }
}
