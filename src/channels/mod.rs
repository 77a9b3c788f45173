//! Chat delivery abstraction.

pub mod telegram;

pub use telegram::TelegramChannel;

use std::path::Path;

use async_trait::async_trait;

use crate::error::ChannelError;

/// An inbound chat message.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: String,
    pub username: Option<String>,
    pub text: String,
}

/// Best-effort outbound delivery. Implementations own their chunking,
/// formatting fallback, and throttling; callers treat sends as
/// fire-and-forget and do not retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    async fn send_document(
        &self,
        chat_id: &str,
        path: &Path,
        caption: &str,
    ) -> Result<(), ChannelError>;
}
