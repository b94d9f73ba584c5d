mod bot;

use clap::{Parser, Subcommand};
use polyglot_channels::discord::DiscordChannel;
use polyglot_core::{config, traits::Channel};
use polyglot_memory::PrefStore;
use polyglot_translate::{
    CredentialStore, DispatchConfig, HttpTokenIssuer, HttpTranslator, RefreshConfig, Refresher,
    TranslationService,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "polyglot",
    version,
    about = "Polyglot — group-chat translation bot"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot.
    Start,
    /// Check configuration health.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Start => {
            let cfg = config::load(&cli.config)?;

            let discord = match cfg.discord.clone() {
                Some(d) if d.enabled => d,
                _ => anyhow::bail!("Discord is not enabled. Enable it in config.toml."),
            };
            if discord.bot_token.is_empty() {
                anyhow::bail!("Discord is enabled but bot_token is empty.");
            }
            if cfg.translator.subscription_key.is_empty() {
                anyhow::bail!(
                    "translator.subscription_key is empty. \
                     Set it in config.toml to authenticate with the translation API."
                );
            }

            // Credential lifecycle: one store, one background refresher.
            let store = Arc::new(CredentialStore::new());
            let issuer = Arc::new(HttpTokenIssuer::from_config(&cfg.translator));
            let refresher = Refresher::spawn(store, issuer, RefreshConfig::from(&cfg.translator));

            // Dispatch pipeline shared by all in-flight requests.
            let translator = Arc::new(HttpTranslator::from_config(&cfg.translator));
            let service = Arc::new(TranslationService::new(
                translator,
                refresher,
                DispatchConfig::from(&cfg.translator),
            ));

            let channel: Arc<dyn Channel> = Arc::new(DiscordChannel::new(discord));
            let prefs = PrefStore::new(&cfg.storage).await?;

            println!("Polyglot — starting bot...");
            bot::Bot::new(service, channel, prefs).run().await?;
        }
        Commands::Status => {
            let cfg = config::load(&cli.config)?;
            println!("Polyglot — Status Check\n");
            println!("Config: {}", cli.config);

            match cfg.discord {
                Some(ref d) if d.enabled && !d.bot_token.is_empty() => {
                    println!("  discord: configured ({} channel(s))", d.channels.len());
                }
                Some(ref d) if d.enabled => println!("  discord: enabled but missing bot_token"),
                Some(_) => println!("  discord: disabled"),
                None => println!("  discord: not configured"),
            }

            println!(
                "  translator: {}",
                if cfg.translator.subscription_key.is_empty() {
                    "missing subscription_key"
                } else {
                    "configured"
                }
            );
            println!("  token issuer: {}", cfg.translator.issue_url);
            println!("  prefs db: {}", cfg.storage.db_path);
        }
    }

    Ok(())
}
