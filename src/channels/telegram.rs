//! Telegram channel — long-polls the Bot API for updates and delivers
//! results back to chats.

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{IncomingMessage, Notifier};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout for getUpdates, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramChannel {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// Check if a username is in the allowed list. `*` allows everyone.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    /// Fetch the next batch of updates after `offset`, blocking server-side
    /// for up to the long-poll timeout. Returns the messages plus the offset
    /// to pass on the next call.
    pub async fn next_updates(
        &self,
        offset: i64,
    ) -> Result<(Vec<IncomingMessage>, i64), ChannelError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });

        let resp = self
            .client
            .post(self.api_url("getUpdates"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::PollFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let value: serde_json::Value =
            resp.json().await.map_err(|e| ChannelError::PollFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let mut next_offset = offset;
        let mut messages = Vec::new();

        for update in value["result"].as_array().into_iter().flatten() {
            if let Some(update_id) = update["update_id"].as_i64() {
                next_offset = next_offset.max(update_id + 1);
            }
            let message = &update["message"];
            let Some(text) = message["text"].as_str() else {
                continue;
            };
            let Some(chat_id) = message["chat"]["id"].as_i64() else {
                continue;
            };
            let username = message["from"]["username"].as_str().map(str::to_string);

            // A restrictive allow-list also excludes senders with no username.
            let allowed = match username {
                Some(ref name) => self.is_user_allowed(name),
                None => self.allowed_users.iter().any(|u| u == "*"),
            };
            if !allowed {
                tracing::warn!(username = ?username, "Ignoring message from disallowed sender");
                continue;
            }

            messages.push(IncomingMessage {
                chat_id: chat_id.to_string(),
                username,
                text: text.to_string(),
            });
        }

        Ok((messages, next_offset))
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with plain
    /// text fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    /// Send a text message, splitting at the API length limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Upload a file to a chat.
    async fn send_document(
        &self,
        chat_id: &str,
        path: &Path,
        caption: &str,
    ) -> Result<(), ChannelError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let file_bytes =
            tokio::fs::read(path)
                .await
                .map_err(|e| ChannelError::DocumentFailed {
                    name: "telegram".into(),
                    reason: format!("read {}: {e}", path.display()),
                })?;

        let part = Part::bytes(file_bytes).file_name(file_name.clone());
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let resp = self
            .client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::DocumentFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::DocumentFailed {
                name: "telegram".into(),
                reason: err,
            });
        }

        tracing::info!(chat_id = %chat_id, file = %file_name, "Telegram document sent");
        Ok(())
    }
}

/// Split text into chunks of at most `limit` characters, preferring newline
/// boundaries so code blocks and lists stay readable.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            // A single oversized line is split by character count.
            let mut rest: Vec<char> = line.chars().collect();
            while rest.len() > limit {
                let head: String = rest.drain(..limit).collect();
                chunks.push(head);
            }
            current = rest.into_iter().collect();
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_one_chunk() {
        let chunks = split_message("hello", 4096);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_on_lines() {
        let text = format!("{}\n{}\n{}", "a".repeat(60), "b".repeat(60), "c".repeat(60));
        let chunks = split_message(&text, 100);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn oversized_single_line_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn allow_list_wildcard() {
        let ch = TelegramChannel::new(SecretString::from("t"), vec!["*".to_string()]);
        assert!(ch.is_user_allowed("anyone"));

        let ch = TelegramChannel::new(SecretString::from("t"), vec!["alice".to_string()]);
        assert!(ch.is_user_allowed("alice"));
        assert!(!ch.is_user_allowed("bob"));
    }
}
