use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PolyglotError;

/// Top-level Polyglot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub translator: TranslatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// General bot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Discord REST channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Channels the bot watches for messages to translate.
    #[serde(default)]
    pub channels: Vec<WatchedChannel>,
    /// Seconds between message polls per channel.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// A single watched guild channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedChannel {
    pub guild_id: String,
    pub channel_id: String,
}

/// Translation API configuration: endpoints, the shared credential policy,
/// and the per-request retry bounds.
///
/// The defaults follow the Azure Cognitive Services translator: tokens are
/// issued by a separate STS endpoint and are valid for ten minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Subscription key sent to the token issuance endpoint.
    #[serde(default)]
    pub subscription_key: String,
    /// Optional region header for regional STS endpoints.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_issue_url")]
    pub issue_url: String,
    #[serde(default = "default_translate_url")]
    pub translate_url: String,
    /// Declared lifetime of an issued token. The issuer does not report one,
    /// so it is configured here.
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
    /// Subtracted from the token lifetime so no consumer ever holds a token
    /// this close to its true expiry.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    /// How long before local expiry the proactive renewal fires.
    #[serde(default = "default_refresh_lead")]
    pub refresh_lead_secs: u64,
    #[serde(default = "default_issue_timeout")]
    pub issue_timeout_secs: u64,
    #[serde(default = "default_translate_timeout")]
    pub translate_timeout_secs: u64,
    /// Initial issuance retry delay; doubles up to the cap.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// How long a request waits for the first credential at startup.
    #[serde(default = "default_startup_wait")]
    pub startup_wait_secs: u64,
    /// How long a request waits for a forced refresh to complete.
    #[serde(default = "default_refresh_wait")]
    pub refresh_wait_secs: u64,
    /// Single backoff applied before the one rate-limit retry.
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            subscription_key: String::new(),
            region: None,
            issue_url: default_issue_url(),
            translate_url: default_translate_url(),
            token_lifetime_secs: default_token_lifetime(),
            safety_margin_secs: default_safety_margin(),
            refresh_lead_secs: default_refresh_lead(),
            issue_timeout_secs: default_issue_timeout(),
            translate_timeout_secs: default_translate_timeout(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            startup_wait_secs: default_startup_wait(),
            refresh_wait_secs: default_refresh_wait(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
        }
    }
}

/// Preference store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// --- Default value functions ---

fn default_name() -> String {
    "Polyglot".to_string()
}
fn default_data_dir() -> String {
    "~/.polyglot".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval() -> u64 {
    2
}
fn default_issue_url() -> String {
    "https://api.cognitive.microsoft.com/sts/v1.0/issueToken".to_string()
}
fn default_translate_url() -> String {
    "https://api.cognitive.microsofttranslator.com".to_string()
}
fn default_token_lifetime() -> u64 {
    600
}
fn default_safety_margin() -> u64 {
    60
}
fn default_refresh_lead() -> u64 {
    60
}
fn default_issue_timeout() -> u64 {
    10
}
fn default_translate_timeout() -> u64 {
    15
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_startup_wait() -> u64 {
    10
}
fn default_refresh_wait() -> u64 {
    10
}
fn default_rate_limit_backoff_ms() -> u64 {
    1_500
}
fn default_db_path() -> String {
    "~/.polyglot/prefs.db".to_string()
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, PolyglotError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(Config {
            bot: BotConfig::default(),
            discord: None,
            translator: TranslatorConfig::default(),
            storage: StorageConfig::default(),
        });
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| PolyglotError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| PolyglotError::Config(format!("failed to parse config: {}", e)))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translator_defaults() {
        let tc = TranslatorConfig::default();
        assert_eq!(tc.token_lifetime_secs, 600);
        assert_eq!(tc.safety_margin_secs, 60);
        assert_eq!(tc.refresh_lead_secs, 60);
        assert!(tc.issue_url.contains("issueToken"));
    }

    #[test]
    fn test_translator_from_toml() {
        let toml_str = r#"
            subscription_key = "secret"
            region = "westeurope"
            token_lifetime_secs = 300
        "#;
        let tc: TranslatorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(tc.subscription_key, "secret");
        assert_eq!(tc.region.as_deref(), Some("westeurope"));
        assert_eq!(tc.token_lifetime_secs, 300);
        // Unset fields keep their defaults.
        assert_eq!(tc.safety_margin_secs, 60);
        assert_eq!(tc.backoff_cap_ms, 30_000);
    }

    #[test]
    fn test_full_config_from_toml() {
        let toml_str = r#"
            [bot]
            name = "Polyglot"

            [discord]
            enabled = true
            bot_token = "t0ken"
            poll_interval_secs = 5

            [[discord.channels]]
            guild_id = "1"
            channel_id = "2"

            [translator]
            subscription_key = "k"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        let discord = cfg.discord.expect("discord section present");
        assert!(discord.enabled);
        assert_eq!(discord.channels.len(), 1);
        assert_eq!(discord.channels[0].channel_id, "2");
        assert_eq!(discord.poll_interval_secs, 5);
        assert_eq!(cfg.translator.subscription_key, "k");
        assert_eq!(cfg.bot.log_level, "info");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.discord.is_none());
        assert_eq!(cfg.storage.db_path, "~/.polyglot/prefs.db");
        assert_eq!(cfg.bot.name, "Polyglot");
    }
}
