//! Binary entrypoint for the meshbridge CLI.
//!
//! Commands:
//! - `start` - run the bridge until Ctrl-C; flags override the config file
//! - `init` - write a starter `config.toml`
//! - `probe [--host <h>] [--port <p>]` - open a device session and print what it reports
//! - `send (--to <id> | --channel <name>) <text>` - one-shot send through the device
//!
//! See the library crate docs for module-level details: `meshbridge::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshbridge::bridge::message::{NodeRegistry, SelfIdentity};
use meshbridge::bridge::outbound::{OutboundLink, OutboundTuning};
use meshbridge::bridge::Bridge;
use meshbridge::config::Config;
use meshbridge::meshtastic::tcp::TcpDeviceConnector;
use meshbridge::meshtastic::DeviceConnector;
use meshbridge::{metrics, responder};

#[derive(Parser)]
#[command(name = "meshbridge")]
#[command(about = "Hybrid MQTT/TCP messaging bridge for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(clap::Args, Debug, Default)]
struct StartOverrides {
    #[arg(long)]
    broker_host: Option<String>,
    #[arg(long)]
    broker_port: Option<u16>,
    #[arg(long)]
    broker_username: Option<String>,
    #[arg(long)]
    broker_password: Option<String>,
    /// Meshtastic device host (defaults to the broker host)
    #[arg(long)]
    device_host: Option<String>,
    #[arg(long)]
    device_port: Option<u16>,
    /// Only answer senders directly
    #[arg(long, conflicts_with = "broadcast")]
    private: bool,
    /// Answer broadcasts with broadcasts
    #[arg(long)]
    broadcast: bool,
    #[arg(long, conflicts_with = "no_banner")]
    banner: bool,
    #[arg(long)]
    no_banner: bool,
    /// Enable the dedicated bot channel
    #[arg(long, conflicts_with = "no_channel")]
    channel: bool,
    #[arg(long)]
    no_channel: bool,
    #[arg(long)]
    channel_topic: Option<String>,
    #[arg(long)]
    response_topic: Option<String>,
}

impl StartOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.broker_host {
            config.broker.host = host;
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }
        if let Some(user) = self.broker_username {
            config.broker.username = user;
        }
        if let Some(pass) = self.broker_password {
            config.broker.password = pass;
        }
        if let Some(host) = self.device_host {
            config.device.host = host;
        }
        if let Some(port) = self.device_port {
            config.device.port = port;
        }
        if self.private {
            config.bridge.private_mode = true;
        } else if self.broadcast {
            config.bridge.private_mode = false;
        }
        if self.banner {
            config.bridge.startup_banner = true;
        } else if self.no_banner {
            config.bridge.startup_banner = false;
        }
        if self.channel {
            config.channel.enabled = true;
        } else if self.no_channel {
            config.channel.enabled = false;
        }
        if let Some(topic) = self.channel_topic {
            config.channel.topic = topic;
        }
        if let Some(topic) = self.response_topic {
            config.channel.response_topic = topic;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge
    Start {
        #[command(flatten)]
        overrides: StartOverrides,
    },
    /// Write a default configuration file
    Init,
    /// Connect to the device and print its identity, channels and node count as JSON
    Probe {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send one message through the device
    Send {
        /// Destination node id (!hex or decimal); omit to broadcast
        #[arg(long, conflicts_with = "channel")]
        to: Option<String>,
        /// Device channel name to broadcast on
        #[arg(long)]
        channel: Option<String>,
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { overrides } => {
            let mut config = load_or_default(&cli.config).await?;
            overrides.apply(&mut config);
            config.validate()?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshbridge v{}", env!("CARGO_PKG_VERSION"));

            let bridge = Bridge::from_config(&config);
            bridge.set_responder(responder::from_config(&config.responder)?);
            let mode = bridge
                .connect()
                .await
                .map_err(|e| anyhow!("Failed to connect to MQTT broker: {}", e))?;
            info!("Bridge running in {} mode; press Ctrl-C to stop", mode);

            let mut status_tick = tokio::time::interval(Duration::from_secs(600));
            status_tick.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                        break;
                    }
                    _ = status_tick.tick() => {
                        let snap = metrics::snapshot();
                        info!(
                            "status: inbound={} outbound={} regular={} dedicated={} replies={} fallbacks={} dropped={}",
                            bridge.inbound().state(),
                            bridge.outbound().state(),
                            snap.inbound_regular,
                            snap.inbound_dedicated,
                            snap.replies_sent,
                            snap.fallback_published,
                            snap.dropped_total()
                        );
                    }
                }
            }
            bridge.shutdown().await;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Probe { host, port } => {
            let mut config = load_or_default(&cli.config).await?;
            if let Some(host) = host {
                config.device.host = host;
            }
            if let Some(port) = port {
                config.device.port = port;
            }
            init_logging(&Some(config.clone()), cli.verbose);
            let connector = TcpDeviceConnector::from_config(&config);
            info!("Probing {}", connector.describe());
            let session = connector.open().await?;
            let outcome = async {
                let me = session.my_info().await?;
                let channels = session.channels().await?;
                Ok::<_, meshbridge::error::LinkError>((me, channels))
            }
            .await;
            let node_count = session.node_count();
            session.close().await;
            let (me, channels) = outcome?;
            let payload = serde_json::json!({
                "status": "ok",
                "node_num": me.node_num,
                "node_id": me.node_id,
                "long_name": me.long_name,
                "channels": channels
                    .iter()
                    .map(|c| serde_json::json!({"index": c.index, "name": c.name}))
                    .collect::<Vec<_>>(),
                "node_count": node_count,
            });
            println!("{}", payload);
        }
        Commands::Send { to, channel, text } => {
            let config = load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let tuning = OutboundTuning::from_config(&config.device);
            let link = OutboundLink::new(
                Arc::new(TcpDeviceConnector::from_config(&config)),
                tuning.clone(),
                Arc::new(SelfIdentity::new(config.bridge.identity_label.clone())),
                Arc::new(NodeRegistry::new()),
            );
            link.connect(tuning.connect_retries, tuning.backoff_base).await?;
            let sent = match channel {
                Some(name) => link.send_to_channel(&text, &name).await,
                None => link.send(&text, to.as_deref()).await,
            };
            link.disconnect().await;
            sent?;
            info!("Message sent");
        }
    }

    Ok(())
}

/// Config file when present; defaults otherwise so `start --broker-host ..`
/// works without one.
async fn load_or_default(path: &str) -> Result<Config> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Config::load(path).await
    } else {
        // Logging is not initialised yet
        eprintln!("Config file {} not found; using defaults", path);
        Ok(Config::default())
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok());
    let base_level = match verbosity {
        0 => configured.unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // rumqttc is chatty at debug
    if verbosity < 2 {
        builder.filter_module("rumqttc", log::LevelFilter::Warn);
    }
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .map_err(|e| eprintln!("Cannot open log file {}: {}", file, e))
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs also echo to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    if builder.try_init().is_err() {
        warn!("Logger already initialised");
    }
}
