//! Discord REST API payloads (the subset the bot touches).

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub author: DiscordUser,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    /// Set for messages authored by bots (including ourselves).
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateMessage<'a> {
    pub content: &'a str,
}
