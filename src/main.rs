//! Repertory - Main Entry Point
//!
//! Bridges one MQTT topic and one Telegram chat: inbound broker messages are
//! logged, and bot commands can publish to the broker and report the outcome.

use clap::{Parser, Subcommand};
use repertory::config::{RepertoryConfig, TelegramSection};
use repertory::observability::init_default_logging;
use repertory::telegram::{
    BotChannel, BotHandle, BotOptions, BotStatus, CommandRegistry, HttpsSession,
};
use repertory::transport::mqtt::{BrokerConnection, ConnectionState};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Resilient MQTT and Telegram adapters
#[derive(Parser)]
#[command(name = "repertory")]
#[command(about = "Resilient MQTT broker connection and Telegram bot channel")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "REPERTORY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured adapters until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    info!("Starting repertory v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> AppResult<RepertoryConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(RepertoryConfig::load_from_file(path)?);
    }

    for candidate in ["repertory.toml", "config/repertory.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(RepertoryConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create repertory.toml".into())
}

async fn run(config: RepertoryConfig) -> AppResult<()> {
    let broker = match &config.mqtt {
        Some(mqtt) => {
            let connection = Arc::new(BrokerConnection::connect(mqtt).await?);
            subscribe_when_connected(Arc::clone(&connection), mqtt.topic.clone());
            Some((connection, mqtt.topic.clone()))
        }
        None => None,
    };

    let bot = match &config.telegram {
        Some(telegram) => Some(start_bot(telegram, broker.clone())?),
        None => None,
    };

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    info!("Adapters running");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    if let Some(bot) = &bot {
        bot.shutdown().await;
    }
    if let Some((connection, _)) = &broker {
        connection.shutdown().await;
    }
    Ok(())
}

/// Subscribe once the first session is up; the manager re-issues it after reconnects
fn subscribe_when_connected(connection: Arc<BrokerConnection>, topic: String) {
    let mut state = connection.watch_state();
    tokio::spawn(async move {
        let settled = state
            .wait_for(|s| *s == ConnectionState::Connected || s.is_shutting_down())
            .await
            .map(|s| *s == ConnectionState::Connected);
        if !matches!(settled, Ok(true)) {
            return;
        }
        let subscribed = connection.subscribe(&topic, |topic, payload| {
            info!(topic, payload = %String::from_utf8_lossy(payload), "Broker message");
        });
        if let Err(e) = subscribed {
            warn!(topic = %topic, error = %e, "Subscription failed");
        }
    });
}

fn start_bot(
    config: &TelegramSection,
    broker: Option<(Arc<BrokerConnection>, String)>,
) -> AppResult<BotChannel> {
    let session = HttpsSession::new(config, config.token()?)?;
    let registry = CommandRegistry::new().with_command("start", "Say hello", |call| {
        info!(chat_id = call.chat_id, "Conversation started");
    })?;
    let bot = BotChannel::start(session, BotOptions::from(config), registry);
    let handle = bot.handle();

    let reply = handle.clone();
    handle.set_handler("start", move |_| reply.send("Hello. Try /status or /publish."))?;

    let reply = handle.clone();
    let status_broker = broker.clone();
    handle.set_command("status", "Show broker connection state", false, move |_| {
        let text = match &status_broker {
            Some((connection, _)) => format!("Broker: {:?}", connection.state()),
            None => "No broker configured".to_string(),
        };
        reply.send(text);
    })?;

    let reply = handle.clone();
    handle.set_command("publish", "Publish text to the broker topic", true, move |call| {
        publish_from_chat(&reply, broker.as_ref(), &call.args);
    })?;

    let mut status = bot.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            if let BotStatus::Halted(reason) = &*status.borrow() {
                error!(reason = %reason, "Bot channel halted; check the access token");
            }
        }
    });

    Ok(bot)
}

fn publish_from_chat(
    reply: &BotHandle,
    broker: Option<&(Arc<BrokerConnection>, String)>,
    text: &str,
) {
    let Some((connection, topic)) = broker else {
        reply.send("No broker configured");
        return;
    };
    if text.is_empty() {
        reply.send("Usage: /publish &lt;text&gt;");
        return;
    }

    let outcome = reply.clone();
    let submitted = connection.publish(topic, text, move |result| match result {
        Ok(()) => outcome.send("Delivered"),
        Err(e) => outcome.send(format!("Not delivered: {e}")),
    });
    if let Err(e) = submitted {
        reply.send(format!("Not sent: {e}"));
    }
}

fn handle_config_command(config: &RepertoryConfig, show: bool) -> AppResult<()> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
