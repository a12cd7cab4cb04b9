//! Sensor Hub
//!
//! Sensor registry with a REST API and a WebSocket channel that pushes status
//! changes to every connected client.

mod api;
mod client;
mod config;
mod error;
mod events;
mod gateway;
mod models;
mod service;
mod storage;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::client::{SensorApiClient, SensorRow, StatusConnection};
use crate::config::Config;
use crate::models::{CreateSensor, SensorStatus, StatusChangeEvent};

const GREEN: &str = "\x1b[38;5;114m";
const RED: &str = "\x1b[38;5;203m";
const CYAN: &str = "\x1b[38;5;51m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "sensor-hub")]
#[command(about = "Sensor registry with real-time status updates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and push channel
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List sensors
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show a single sensor
    Get {
        id: i64,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Register a new sensor
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        serial: String,

        #[arg(long)]
        firmware: String,

        /// ONLINE or OFFLINE
        #[arg(long, default_value = "OFFLINE")]
        status: SensorStatus,
    },

    /// Change a sensor's status
    SetStatus {
        id: i64,

        /// ONLINE or OFFLINE
        status: SensorStatus,
    },

    /// Delete a sensor
    Delete { id: i64 },

    /// Create a batch of random sensors
    Seed {
        #[arg(default_value = "10")]
        count: usize,
    },

    /// Live sensor table that follows pushed status changes
    Watch,

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = log_directive(cli.debug, cli.verbose, &config.log_level);
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"))
    });
    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::List { json } => {
            list_sensors(&config, json).await?;
        }
        Commands::Get { id, json } => {
            let api = SensorApiClient::new(&config.api_url);
            let sensor = api.get_sensor(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sensor)?);
            } else {
                print_table(&client::ClientState::new(vec![sensor]).rows());
            }
        }
        Commands::Create {
            name,
            serial,
            firmware,
            status,
        } => {
            let api = SensorApiClient::new(&config.api_url);
            let sensor = api
                .create_sensor(&CreateSensor {
                    name,
                    serial_number: serial,
                    firmware_version: firmware,
                    current_status: status,
                })
                .await?;
            println!("{}✓{} Created sensor {} ({})", GREEN, RESET, sensor.id, sensor.name);
        }
        Commands::SetStatus { id, status } => {
            let api = SensorApiClient::new(&config.api_url);
            let sensor = api.set_status(id, status).await?;
            println!(
                "{}✓{} Sensor {} is now {}",
                GREEN,
                RESET,
                sensor.id,
                colored_status(sensor.current_status)
            );
        }
        Commands::Delete { id } => {
            let api = SensorApiClient::new(&config.api_url);
            let sensor = api.delete_sensor(id).await?;
            println!("{}✓{} Deleted sensor {} ({})", GREEN, RESET, sensor.id, sensor.name);
        }
        Commands::Seed { count } => {
            seed_sensors(&config, count).await?;
        }
        Commands::Watch => {
            run_watch(&config).await?;
        }
        Commands::Config { show, init } => {
            let path = cli
                .config
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_path);
            manage_config(&config, &path, show, init)?;
        }
    }

    Ok(())
}

async fn run_server(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.http_port = port;
    }

    config.ensure_dirs()?;

    println!("{}{}✦ Sensor Hub{}", BOLD, CYAN, RESET);
    println!("  {}API:{}      http://{}:{}/sensors", DIM, RESET, config.host, config.http_port);
    println!("  {}Push:{}     ws://{}:{}/ws", DIM, RESET, config.host, config.http_port);
    println!("  {}Origin:{}   {}", DIM, RESET, config.allowed_origin);
    println!("  {}Database:{} {:?}", DIM, RESET, config.db_path);
    println!();

    api::run_web_server(&config).await
}

async fn list_sensors(config: &Config, json_output: bool) -> Result<()> {
    let api = SensorApiClient::new(&config.api_url);
    let sensors = api.list_sensors().await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&sensors)?);
        return Ok(());
    }

    if sensors.is_empty() {
        println!("{}No sensors registered{}", DIM, RESET);
        return Ok(());
    }
    print_table(&client::ClientState::new(sensors).rows());
    Ok(())
}

async fn seed_sensors(config: &Config, count: usize) -> Result<()> {
    const ADJECTIVES: &[&str] = &[
        "Ergonomic", "Rustic", "Sleek", "Compact", "Rugged", "Smart", "Thermal", "Acoustic",
    ];
    const NOUNS: &[&str] = &[
        "Probe", "Gauge", "Monitor", "Beacon", "Detector", "Meter", "Tracker", "Node",
    ];

    let api = SensorApiClient::new(&config.api_url);
    let mut created = 0;

    for _ in 0..count {
        let new = {
            let mut rng = rand::thread_rng();
            let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Generic");
            let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Sensor");
            let status = if rng.gen_bool(0.5) {
                SensorStatus::Online
            } else {
                SensorStatus::Offline
            };
            CreateSensor {
                name: format!("{} {}", adjective, noun),
                serial_number: uuid::Uuid::new_v4().to_string(),
                firmware_version: format!(
                    "v{}.{}.{}",
                    rng.gen_range(0..5),
                    rng.gen_range(0..20),
                    rng.gen_range(0..50)
                ),
                current_status: status,
            }
        };

        match api.create_sensor(&new).await {
            Ok(sensor) => {
                created += 1;
                println!(
                    "{}✓{} {} {}{}{} {}",
                    GREEN,
                    RESET,
                    sensor.id,
                    BOLD,
                    sensor.name,
                    RESET,
                    colored_status(sensor.current_status)
                );
            }
            Err(e) => {
                println!("{}✗{} {}: {}", RED, RESET, new.name, e);
            }
        }
    }

    println!();
    println!("{}Seeded {}/{} sensors{}", DIM, created, count, RESET);
    Ok(())
}

/// Fetch, mount a push connection and keep the table current until ctrl-c.
///
/// On transport loss the connection is torn down, the list refetched and a new
/// connection mounted.
async fn run_watch(config: &Config) -> Result<()> {
    let api = SensorApiClient::new(&config.api_url);
    let store = client::ClientStore::new();

    loop {
        match api.list_sensors().await {
            Ok(sensors) => store.replace_sensors(sensors),
            Err(e) => warn!("Refetch failed, showing cached list: {}", e),
        }
        print_table(&store.rows());

        let handler_store = store.clone();
        let mounted = StatusConnection::mount(&config.ws_url, move |event| {
            handler_store.apply(&event);
            print_update(&event, &handler_store.rows());
        })
        .await;

        match mounted {
            Ok(mut conn) => {
                let interrupted = tokio::select! {
                    _ = conn.closed() => false,
                    _ = tokio::signal::ctrl_c() => true,
                };
                conn.teardown();
                if interrupted {
                    conn.closed().await;
                    return Ok(());
                }
                warn!("Push channel lost, reconnecting in {:?}", RECONNECT_DELAY);
            }
            Err(e) => warn!("{:#}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
        info!("Remounting push connection");
    }
}

/// Flags win over the configured level.
fn log_directive(debug: bool, verbose: bool, configured: &str) -> String {
    if debug {
        Level::DEBUG.to_string().to_lowercase()
    } else if verbose {
        Level::INFO.to_string().to_lowercase()
    } else {
        configured.to_string()
    }
}

fn manage_config(config: &Config, path: &Path, show: bool, init: bool) -> Result<()> {
    if init {
        let defaults = Config::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        defaults.save(path)?;
        println!("{}✦ Configuration created at {}{}", CYAN, path.display(), RESET);
        return Ok(());
    }

    if show || !init {
        if !path.exists() {
            println!("{}✦ No config file found, showing defaults{}", DIM, RESET);
        }
        println!("{}", serde_json::to_string_pretty(config)?);
    }

    Ok(())
}

fn colored_status(status: SensorStatus) -> String {
    match status {
        SensorStatus::Online => format!("{}● {}{}", GREEN, status, RESET),
        SensorStatus::Offline => format!("{}○ {}{}", RED, status, RESET),
    }
}

fn print_table(rows: &[SensorRow]) {
    println!(
        "{}{:<6} {:<24} {:<38} {:<12} {}{}",
        BOLD, "ID", "NAME", "SERIAL NUMBER", "FIRMWARE", "STATUS", RESET
    );
    for row in rows {
        println!(
            "{:<6} {:<24} {:<38} {:<12} {}",
            row.id,
            truncate(&row.name, 24),
            truncate(&row.serial_number, 38),
            truncate(&row.firmware_version, 12),
            colored_status(row.status)
        );
    }
    println!();
}

fn print_update(event: &StatusChangeEvent, rows: &[SensorRow]) {
    let name = rows
        .iter()
        .find(|r| r.id == event.id)
        .map(|r| r.name.as_str())
        .unwrap_or("(not in list)");
    println!(
        "{}{}{} sensor {} {} -> {}",
        DIM,
        chrono::Local::now().format("%H:%M:%S"),
        RESET,
        event.id,
        name,
        colored_status(event.current_status)
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
