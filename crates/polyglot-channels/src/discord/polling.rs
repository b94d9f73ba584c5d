//! Polling loop and Channel trait implementation.

use super::types::{CreateMessage, DiscordMessage};
use super::DiscordChannel;
use async_trait::async_trait;
use polyglot_core::{
    config::WatchedChannel,
    error::PolyglotError,
    message::{IncomingMessage, OutgoingMessage},
    traits::Channel,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self) -> Result<mpsc::Receiver<IncomingMessage>, PolyglotError> {
        if self.config.channels.is_empty() {
            return Err(PolyglotError::Channel(
                "no discord channels configured to watch".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let bot_token = self.config.bot_token.clone();
        let watched = self.config.channels.clone();
        let last_seen = self.last_seen.clone();
        let poll_interval = std::time::Duration::from_secs(self.config.poll_interval_secs.max(1));

        info!(
            "Discord channel polling {} channel(s) every {:?}",
            watched.len(),
            poll_interval
        );

        tokio::spawn(async move {
            let mut backoff_secs: u64 = 1;

            loop {
                let mut poll_failed = false;

                for channel in &watched {
                    match poll_channel(&client, &base_url, &bot_token, channel, &last_seen).await {
                        Ok(messages) => {
                            for incoming in messages {
                                if tx.send(incoming).await.is_err() {
                                    info!("discord channel receiver dropped, stopping poll");
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            error!(
                                "discord poll error on channel {} (retry in {backoff_secs}s): {e}",
                                channel.channel_id
                            );
                            poll_failed = true;
                        }
                    }
                }

                if poll_failed {
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(60);
                } else {
                    backoff_secs = 1;
                    tokio::time::sleep(poll_interval).await;
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), PolyglotError> {
        let channel_id = message
            .reply_target
            .as_deref()
            .ok_or_else(|| PolyglotError::Channel("no reply_target on outgoing message".into()))?;

        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let body = CreateMessage {
            content: &message.text,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| PolyglotError::Channel(format!("discord send failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PolyglotError::Channel(format!(
                "discord send returned {status}: {text}"
            )));
        }

        Ok(())
    }

    async fn stop(&self) -> Result<(), PolyglotError> {
        info!("Discord channel stopped");
        Ok(())
    }
}

/// Fetch new messages from one watched channel.
///
/// The first poll only records the newest message id so old history is not
/// replayed on startup.
async fn poll_channel(
    client: &reqwest::Client,
    base_url: &str,
    bot_token: &str,
    channel: &WatchedChannel,
    last_seen: &Arc<Mutex<HashMap<String, String>>>,
) -> Result<Vec<IncomingMessage>, PolyglotError> {
    let after = last_seen.lock().await.get(&channel.channel_id).cloned();

    let url = match &after {
        Some(id) => format!(
            "{base_url}/channels/{}/messages?after={id}&limit=50",
            channel.channel_id
        ),
        None => format!("{base_url}/channels/{}/messages?limit=1", channel.channel_id),
    };

    let resp = client
        .get(&url)
        .header("Authorization", format!("Bot {bot_token}"))
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| PolyglotError::Channel(format!("fetch failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        return Err(PolyglotError::Channel(format!("API returned {status}")));
    }

    // Discord returns messages newest first.
    let mut messages: Vec<DiscordMessage> = resp
        .json()
        .await
        .map_err(|e| PolyglotError::Channel(format!("parse failed: {e}")))?;

    if let Some(newest) = messages.first() {
        last_seen
            .lock()
            .await
            .insert(channel.channel_id.clone(), newest.id.clone());
    }

    // First poll establishes the cursor without emitting anything.
    if after.is_none() {
        return Ok(Vec::new());
    }

    messages.reverse();

    let incoming = messages
        .into_iter()
        .filter(|m| {
            if m.author.bot {
                debug!("discord: skipping bot message {}", m.id);
                return false;
            }
            !m.content.trim().is_empty()
        })
        .map(|m| IncomingMessage {
            id: Uuid::new_v4(),
            channel: "discord".to_string(),
            guild_id: Some(channel.guild_id.clone()),
            channel_id: channel.channel_id.clone(),
            sender_id: m.author.id,
            sender_name: Some(m.author.username),
            text: m.content,
            timestamp: m
                .timestamp
                .as_deref()
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|| {
                    warn!("discord: message without parseable timestamp");
                    chrono::Utc::now()
                }),
        })
        .collect();

    Ok(incoming)
}
