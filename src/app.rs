//! Wiring: stores, router, mirror engine, providers and dispatcher.
//!
//! [`AppContext::build`] performs no I/O. The primary pool connects lazily
//! and the mirror is opened or built by [`AppContext::start_background`],
//! so CLI commands that never touch data start instantly.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shelfwise_core::dispatch::{DispatchController, DispatchTrace};
use shelfwise_core::error::DispatchError;
use shelfwise_core::models::{Reply, Request};
use shelfwise_core::quality::HeuristicQualityGate;
use shelfwise_core::schema::StoreSource;
use shelfwise_core::store::{refresh_inventory_view, DataStore};

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::handlers::builtin_registry;
use crate::llm::{create_generator, TextGenerator};
use crate::mirror::MirrorSyncEngine;
use crate::router::{DataAccessRouter, MirrorSource};
use crate::stores::{PostgresStore, RetryPolicy, RetryingStore};

pub struct AppContext {
    pub config: Config,
    pub primary: Option<Arc<PostgresStore>>,
    pub mirror: Option<Arc<MirrorSyncEngine>>,
    pub router: Arc<DataAccessRouter>,
    pub generator: Arc<dyn TextGenerator>,
    pub embedder: Arc<dyn Embedder>,
    pub dispatcher: DispatchController,
}

impl AppContext {
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let primary = match config.primary.resolved_url() {
            Some(url) => Some(Arc::new(
                PostgresStore::connect_lazy(
                    &url,
                    config.primary.max_connections,
                    Duration::from_secs(config.primary.connect_timeout_secs),
                )
                .context("Failed to configure primary store")?,
            )),
            None => None,
        };

        let mirror = if config.mirror.enabled {
            Some(Arc::new(MirrorSyncEngine::new(config.mirror.clone())?))
        } else {
            None
        };

        let policy = RetryPolicy {
            max_retries: config.primary.max_retries,
            interval: Duration::from_millis(config.primary.retry_interval_ms),
        };
        let routed_primary = primary.clone().map(|p| {
            Arc::new(RetryingStore::new(p as Arc<dyn DataStore>, policy)) as Arc<dyn DataStore>
        });
        let router = Arc::new(DataAccessRouter::new(
            routed_primary,
            mirror.clone().map(|m| m as Arc<dyn MirrorSource>),
        ));

        let generator = create_generator(&config.llm)?;
        let embedder = create_embedder(&config.embedding)?;
        let registry = builtin_registry(
            Arc::clone(&router),
            Arc::clone(&generator),
            Arc::clone(&embedder),
            &config.handlers,
        );
        let gate = Arc::new(HeuristicQualityGate::new(config.dispatch.failure_phrases.clone()));
        let dispatcher = DispatchController::new(registry, gate, config.dispatch.settings());

        info!(
            primary = primary.is_some(),
            mirror = mirror.is_some(),
            llm = %config.llm.provider,
            embedding = %config.embedding.provider,
            "application configured"
        );

        Ok(Self {
            config,
            primary,
            mirror,
            router,
            generator,
            embedder,
            dispatcher,
        })
    }

    /// Open or build the mirror, then start the auto-sync loop if enabled.
    pub async fn start_background(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let mirror = self.mirror.as_ref()?;
        if !mirror.startup().await {
            warn!("mirror unavailable; requests depend on the primary");
        }
        Arc::clone(mirror).spawn_auto_sync(token)
    }

    pub async fn ask(&self, request: &Request) -> Result<Reply, DispatchError> {
        self.dispatcher.resolve(request).await
    }

    pub async fn ask_with_trace(&self, request: &Request) -> (Result<Reply, DispatchError>, DispatchTrace) {
        self.dispatcher.resolve_with_trace(request).await
    }

    /// Rebuild `app_inventory` on whichever store the router resolves.
    pub async fn refresh_view(&self) -> Result<StoreSource> {
        let store = self.router.active_store().await?;
        let source = refresh_inventory_view(store.as_ref())
            .await
            .with_context(|| format!("Failed to refresh inventory view on {}", store.kind()))?;
        info!(backend = %store.kind(), store_source = ?source, "inventory view refreshed");
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn test_build_without_stores() {
        std::env::remove_var(crate::config::DATABASE_URL_ENV);
        let app = AppContext::build(parse_config("").unwrap()).unwrap();
        assert!(app.primary.is_none());
        assert!(app.mirror.is_none());
        assert_eq!(app.dispatcher.registry().len(), 4);
        assert!(!app.embedder.is_enabled());
        assert!(app.start_background(CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_ask_without_data_or_llm_is_exhausted() {
        std::env::remove_var(crate::config::DATABASE_URL_ENV);
        let app = AppContext::build(parse_config("").unwrap()).unwrap();
        let (result, trace) = app
            .ask_with_trace(&Request::new("Show me vodka in store 2"))
            .await;
        assert!(matches!(result, Err(DispatchError::AllHandlersExhausted { .. })));
        assert_eq!(trace.attempts.len(), 2);
    }
}
