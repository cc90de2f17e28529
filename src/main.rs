//! VibeBridge - MQTT pub/sub bridge
//!
//! Usage:
//!   vibebridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -H, --host <HOST>          Broker host
//!   -p, --port <PORT>          Broker port
//!   -t, --topic <FILTER>       Subscription filter (repeatable, default: #)
//!   --publish-topic <TOPIC>    Publish once after connecting
//!   -m, --message <TEXT>       Payload for --publish-topic (default: hey)
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!                              (RUST_LOG directives replace it when set)
//!   -h, --help                 Print help

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vibebridge::config::Config;
use vibebridge::message::{Message, PublishOptions};
use vibebridge::state::ConnectionEvent;
use vibebridge::transport::MqttTransport;
use vibebridge::{waiter, Connection, ConnectionOptions};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// VibeBridge - print every message from an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "vibebridge")]
#[command(author = "VibeBridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Pub/sub bridge over MQTT v3.1.1")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// Username for the broker
    #[arg(short, long)]
    username: Option<String>,

    /// Password for the broker
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Client identifier
    #[arg(long)]
    client_id: Option<String>,

    /// Subscription filters (replaces the configured list)
    #[arg(short, long = "topic", value_name = "FILTER")]
    topics: Vec<String>,

    /// Publish a single message to this topic once connected
    #[arg(long)]
    publish_topic: Option<String>,

    /// Payload for --publish-topic
    #[arg(short, long, default_value = "hey")]
    message: String,

    /// How long to wait for the session before publishing (e.g. "3s")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    wait_timeout: Option<Duration>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // File (if any) plus VIBEBRIDGE__ environment overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(log_level.to_tracing_level(), rust_log.as_deref()))
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file and environment
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if args.username.is_some() {
        config.broker.username = args.username;
    }
    if args.password.is_some() {
        config.broker.password = args.password;
    }
    if let Some(client_id) = args.client_id {
        config.broker.client_id = client_id;
    }
    if !args.topics.is_empty() {
        config.bridge.subscriptions = args.topics;
    }
    if let Some(wait_timeout) = args.wait_timeout {
        config.bridge.wait_timeout = wait_timeout;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let address = config.broker.address();
    info!("Starting VibeBridge");
    info!("  Broker: {}", address);
    info!("  Client id: {}", config.broker.client_id);
    info!("  Subscriptions: {}", config.bridge.subscriptions.join(", "));

    let options =
        ConnectionOptions::default().with_handshake_timeout(config.broker.connect_timeout);
    let connection = Connection::new(MqttTransport::new(config.broker.clone()), options);

    let events = connection.events();
    events.on(ConnectionEvent::Disconnect, |_| warn!("Broker session lost"));
    events.on(ConnectionEvent::Reconnect, |_| info!("Reconnecting to broker"));

    // Printing happens off the event pump so a slow stdout never stalls dispatch
    let qos = config.bridge.qos();
    for filter in &config.bridge.subscriptions {
        let (_, mut rx) = connection
            .subscribe_channel_with_qos(filter, qos, config.bridge.channel_capacity)
            .await?;
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                print_message(&message);
            }
        });
    }

    // Armed before connecting so the connect event cannot be missed
    let ready = waiter::arm(events, &[ConnectionEvent::Connect]);
    if let Err(e) = connection.connect(&address).await {
        error!("Failed to connect to {}: {}", address, e);
        std::process::exit(1);
    }

    if let Some(topic) = &args.publish_topic {
        match ready.wait(config.bridge.wait_timeout).await {
            Ok(_) => {
                if let Err(e) = connection
                    .publish(topic, args.message.clone(), PublishOptions::default())
                    .await
                {
                    error!("Publish to '{}' failed: {}", topic, e);
                }
            }
            Err(e) => error!("Not publishing to '{}': {}", topic, e),
        }
    } else {
        drop(ready);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    connection.shutdown().await?;

    Ok(())
}

/// `RUST_LOG` style directives, e.g. "vibebridge::transport=trace", replace
/// the plain level when present
fn log_filter(level: Level, directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives.unwrap_or_default())
}

fn print_message(message: &Message) {
    println!(
        "topic: {} message: {}",
        message.topic,
        message.payload_str()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_defaults_to_level() {
        assert_eq!(log_filter(Level::WARN, None).to_string(), "warn");
        assert_eq!(log_filter(Level::DEBUG, Some("")).to_string(), "debug");
    }

    #[test]
    fn test_log_filter_honours_directives() {
        let filter = log_filter(Level::INFO, Some("vibebridge::transport=trace"));
        assert!(filter.to_string().contains("vibebridge::transport=trace"));
    }
}
