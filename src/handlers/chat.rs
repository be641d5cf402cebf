//! Catch-all conversation handler.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use shelfwise_core::handler::Handler;
use shelfwise_core::models::Request;

use crate::llm::TextGenerator;

/// Constant score given to every request.
pub const CHAT_SCORE: f64 = 0.1;

/// Forwards the request and its history to the text generator.
pub struct GeneralChatHandler {
    generator: Arc<dyn TextGenerator>,
}

impl GeneralChatHandler {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Handler for GeneralChatHandler {
    fn name(&self) -> &str {
        "general_chat"
    }

    fn description(&self) -> &str {
        "Free-form conversation through the language model"
    }

    async fn score(&self, _request: &Request) -> Result<f64> {
        Ok(CHAT_SCORE)
    }

    async fn handle(&self, request: &Request) -> Result<String> {
        self.generator
            .generate(&request.text, &request.history, None)
            .await
    }
}
