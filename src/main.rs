//! mqtt-pubsub - Mutual-TLS MQTT publish/subscribe sample client
//!
//! Connects to a managed broker with a client certificate, optionally
//! subscribes to a topic filter, and publishes a numbered message on a
//! timer until interrupted.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mqttcore::client::MqttClient;
use mqttcore::codec::QoS;
use mqttcore::config::Config;
use mqttcore::logging::init_default_logging;
use mqttcore::transport::connect_tls;
use tokio::signal;
use tracing::{error, info};

/// Mutual-TLS MQTT publish/subscribe sample client
#[derive(Parser)]
#[command(name = "mqtt-pubsub")]
#[command(about = "Mutual-TLS MQTT publish/subscribe sample client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run the publish/subscribe loop
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-pubsub v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<Config, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(Config::load_from_file(path)?)
        }
        None => {
            let default_paths = vec!["mqtt-pubsub.toml", "config/mqtt-pubsub.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(Config::load_from_file(&path)?);
                }
            }

            error!(
                "No configuration file found. Please provide one with -c/--config or create mqtt-pubsub.toml"
            );
            process::exit(1);
        }
    }
}

async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let options = config.mqtt_options()?;
    info!(client_id = %options.client_id, host = %config.broker.host, "opening connection");

    let transport = connect_tls(
        &config.tls_settings(),
        &config.broker.host,
        config.broker.port,
    )
    .await?;
    let client = MqttClient::connect(transport, options).await?;

    if config.subscribe.enabled {
        let filter = config.subscribe.topic.clone().unwrap_or_default();
        let granted = client
            .subscribe(
                &filter,
                QoS::AtLeastOnce,
                Arc::new(|message| {
                    info!(
                        topic = %message.topic,
                        payload = %String::from_utf8_lossy(&message.payload),
                        "received message"
                    );
                }),
            )
            .await?;
        info!(filter = %filter, granted = ?granted, "subscribed");
    }

    let mut disconnects = client.disconnect_events();
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let mut ticker = tokio::time::interval(Duration::from_secs(config.publish.interval_secs));
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = disconnects.changed() => {
                let reason = disconnects.borrow().clone();
                if let Some(reason) = reason {
                    error!(%reason, "connection lost, exiting");
                    return Err(reason.as_error().into());
                }
            }
            _ = ticker.tick(), if config.publish.enabled => {
                counter += 1;
                let topic = config.publish.topic.as_deref().unwrap_or_default();
                let message = config.publish.message.as_deref().unwrap_or_default();
                let payload = format!("{message} #{counter}!");
                match client.publish(topic, payload, QoS::AtLeastOnce).await {
                    Ok(receipt) => {
                        info!(topic, counter, "published message");
                        tokio::spawn(async move {
                            if let Err(e) = receipt.wait().await {
                                error!("Publish was not acknowledged: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Publish failed: {}", e),
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

fn handle_config_command(config: Config, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
