pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    // Execute a structured conversation; `allow_search` additionally offers
    // the provider a web-search tool for filling in missing facts.
    async fn generate(&self, messages: &[ChatMessage], allow_search: bool) -> Result<String>;
}
