//! Bot event loop: channel messages in, translated replies out.
//!
//! Each inbound message is handled in its own task, so slow translation
//! calls never block the poll loop or one another.

use polyglot_core::{
    message::{IncomingMessage, OutgoingMessage},
    traits::Channel,
};
use polyglot_memory::PrefStore;
use polyglot_translate::{TranslateError, TranslationRequest, TranslationService};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Wires the channel, the preference store, and the translation service
/// together.
pub struct Bot {
    service: Arc<TranslationService>,
    channel: Arc<dyn Channel>,
    prefs: PrefStore,
}

impl Bot {
    pub fn new(
        service: Arc<TranslationService>,
        channel: Arc<dyn Channel>,
        prefs: PrefStore,
    ) -> Self {
        Self {
            service,
            channel,
            prefs,
        }
    }

    /// Run until the channel closes.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut rx = self.channel.start().await?;
        info!("bot: listening on {}", self.channel.name());

        while let Some(msg) = rx.recv().await {
            let service = Arc::clone(&self.service);
            let channel = Arc::clone(&self.channel);
            let prefs = self.prefs.clone();
            tokio::spawn(async move {
                handle_message(service, channel, prefs, msg).await;
            });
        }

        info!("bot: channel closed, shutting down");
        Ok(())
    }
}

/// A parsed bot command.
#[derive(Debug, PartialEq, Eq)]
enum BotCommand {
    /// `!translate <lang> <text>` — one-shot translation.
    Translate { language: String, text: String },
    /// `!lang set <code>` — translate everything in this channel to `code`.
    SetLanguage(String),
    /// `!lang show`
    ShowLanguage,
    /// `!lang clear`
    ClearLanguage,
}

fn parse_command(text: &str) -> Option<BotCommand> {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix("!translate ") {
        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let language = parts.next()?.to_string();
        let text = parts.next()?.trim().to_string();
        if !is_language_code(&language) || text.is_empty() {
            return None;
        }
        return Some(BotCommand::Translate { language, text });
    }

    if let Some(rest) = text.strip_prefix("!lang") {
        let mut parts = rest.split_whitespace();
        return match parts.next() {
            Some("set") => {
                let code = parts.next()?;
                is_language_code(code).then(|| BotCommand::SetLanguage(code.to_string()))
            }
            Some("show") => Some(BotCommand::ShowLanguage),
            Some("clear") => Some(BotCommand::ClearLanguage),
            _ => None,
        };
    }

    None
}

/// Loose shape check for language codes like `de`, `pt-br`, `zh-Hans`.
/// The translation API is the real authority on supported codes.
fn is_language_code(code: &str) -> bool {
    let (primary, region) = match code.split_once('-') {
        Some((p, r)) => (p, Some(r)),
        None => (code, None),
    };
    let primary_ok =
        (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_lowercase());
    let region_ok = region.map_or(true, |r| {
        (2..=4).contains(&r.len()) && r.chars().all(|c| c.is_ascii_alphanumeric())
    });
    primary_ok && region_ok
}

async fn handle_message(
    service: Arc<TranslationService>,
    channel: Arc<dyn Channel>,
    prefs: PrefStore,
    msg: IncomingMessage,
) {
    let guild = msg.guild_id.clone().unwrap_or_default();

    let response = match parse_command(&msg.text) {
        Some(BotCommand::Translate { language, text }) => {
            translate_text(&service, &text, &language).await
        }
        Some(BotCommand::SetLanguage(code)) => {
            match prefs.set_language(&guild, &msg.channel_id, &code).await {
                Ok(()) => format!("Messages in this channel will be translated to `{code}`."),
                Err(e) => {
                    error!("failed to store language preference: {e}");
                    "Could not save the language preference.".to_string()
                }
            }
        }
        Some(BotCommand::ShowLanguage) => {
            match prefs.language_for(&guild, &msg.channel_id).await {
                Ok(Some(code)) => format!("This channel translates to `{code}`."),
                Ok(None) => "No target language configured for this channel.".to_string(),
                Err(e) => {
                    error!("failed to read language preference: {e}");
                    "Could not read the language preference.".to_string()
                }
            }
        }
        Some(BotCommand::ClearLanguage) => {
            match prefs.clear_language(&guild, &msg.channel_id).await {
                Ok(true) => "Cleared the target language for this channel.".to_string(),
                Ok(false) => "No target language was configured for this channel.".to_string(),
                Err(e) => {
                    error!("failed to clear language preference: {e}");
                    "Could not clear the language preference.".to_string()
                }
            }
        }
        None => {
            // Plain message: translate only if the channel has a target.
            match prefs.language_for(&guild, &msg.channel_id).await {
                Ok(Some(code)) => translate_text(&service, &msg.text, &code).await,
                Ok(None) => return,
                Err(e) => {
                    error!("failed to read language preference: {e}");
                    return;
                }
            }
        }
    };

    let reply = OutgoingMessage {
        text: response,
        reply_target: Some(msg.channel_id.clone()),
    };
    if let Err(e) = channel.send(reply).await {
        error!("failed to send reply to {}: {e}", msg.channel_id);
    }
}

/// Run one request through the dispatch pipeline, rendering terminal
/// failures as user-facing text.
async fn translate_text(service: &TranslationService, text: &str, language: &str) -> String {
    let request = TranslationRequest::new(text, language);
    let correlation_id = request.correlation_id;
    match service.translate(request).await {
        Ok(translated) => translated.text,
        Err(e) => {
            warn!(%correlation_id, "translation failed: {e}");
            render_failure(&e)
        }
    }
}

/// User-facing rendering of the terminal failure taxonomy.
fn render_failure(error: &TranslateError) -> String {
    match error {
        TranslateError::ServiceUnavailable(_) => {
            "Translation is temporarily unavailable. Please try again in a moment.".to_string()
        }
        TranslateError::AuthRejected => {
            "The translation service refused our credentials. Please try again shortly.".to_string()
        }
        TranslateError::RateLimited => {
            "The translation service is throttling us. Please try again in a minute.".to_string()
        }
        TranslateError::Other(detail) => format!("Translation failed: {detail}"),
    }
}
