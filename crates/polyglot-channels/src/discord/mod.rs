//! Discord REST channel.
//!
//! Polls `GET /channels/{id}/messages` for each watched channel and posts
//! replies via `POST /channels/{id}/messages`. The gateway websocket and its
//! event stream are deliberately not used; polling is the minimal surface
//! needed to feed messages into the translation pipeline.
//! Docs: <https://discord.com/developers/docs/resources/message>

mod polling;
pub(crate) mod types;

use polyglot_core::config::DiscordConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const DISCORD_API_URL: &str = "https://discord.com/api/v10";

/// Discord channel using the REST API with periodic polling.
pub struct DiscordChannel {
    config: DiscordConfig,
    client: reqwest::Client,
    base_url: String,
    /// Last seen message id per channel, to avoid reprocessing.
    last_seen: Arc<Mutex<HashMap<String, String>>>,
}

impl DiscordChannel {
    /// Create a new Discord channel from config.
    pub fn new(config: DiscordConfig) -> Self {
        Self::with_base_url(config, DISCORD_API_URL.to_string())
    }

    /// Create with a custom API base URL (used by tests).
    pub fn with_base_url(config: DiscordConfig, base_url: String) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            base_url,
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
