//! The handler capability and its registry.
//!
//! A handler answers two questions about a [`Request`]: how relevant it is
//! ([`score`](Handler::score)) and what it would reply
//! ([`handle`](Handler::handle)). The dispatcher asks every registered
//! handler for a score and only then runs `handle` on the best candidates.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               HandlerRegistry              │
//! │  ┌───────────┐ ┌───────────┐ ┌──────────┐  │
//! │  │ aggregate │ │ inventory │ │ general  │  │
//! │  │  query    │ │  lookup   │ │  chat    │  │
//! │  └───────────┘ └───────────┘ └──────────┘  │
//! └──────────────────┬─────────────────────────┘
//!                    ▼
//!        DispatchController::resolve()
//! ```
//!
//! # Example
//!
//! ```rust
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use shelfwise_core::handler::{Handler, HandlerRegistry};
//! use shelfwise_core::models::Request;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Handler for Greeter {
//!     fn name(&self) -> &str { "greeter" }
//!
//!     async fn score(&self, request: &Request) -> Result<f64> {
//!         Ok(if request.text.to_lowercase().contains("hello") { 0.9 } else { 0.0 })
//!     }
//!
//!     async fn handle(&self, _request: &Request) -> Result<String> {
//!         Ok("Hello! Ask me about the inventory.".to_string())
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(std::sync::Arc::new(Greeter));
//! assert_eq!(registry.len(), 1);
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::models::Request;

/// A self-scoring responder.
///
/// Both methods must be free of side effects other than reads from the
/// data sources the handler privately consults. Implementations must be
/// `Send + Sync`; scoring runs concurrently across handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable identifier, used in replies, traces and logs.
    fn name(&self) -> &str;

    /// One-line description for `shelf handlers`.
    fn description(&self) -> &str {
        ""
    }

    /// Relevance of this handler for `request`, in `[0, 1]`.
    ///
    /// An error is treated as a score of zero and removes the handler from
    /// consideration for this request.
    async fn score(&self, request: &Request) -> Result<f64>;

    /// Produce a reply. Errors make the dispatcher move to the next candidate.
    async fn handle(&self, request: &Request) -> Result<String>;
}

/// Ordered set of handlers. Registration order breaks score ties.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
