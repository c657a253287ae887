//! Adapter for the external text-completion API.
//!
//! The client is stateless and performs no retries; callers decide what to do
//! with a [`CompletionError`], typically by consulting
//! [`CompletionError::is_retryable`].

pub mod error;
pub mod token;
pub mod zhipu;

use async_trait::async_trait;
use idm_types::models::ChatMessage;

pub use error::CompletionError;
pub use zhipu::{ZhipuClient, ZhipuConfig};

/// Anything that can turn an ordered message list into a reply.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError>;
}
