mod coap;
mod commands;
mod config;

use crate::coap::CoapTransport;
use crate::commands::{parse_command, Command, HELP};
use crate::config::ClientConfig;
use klimat_proto::{Device, DeviceOptions, ReportedStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let (config, source) = load_config(CONFIG_PATHS);

    // Initialize logging
    init_logging(&config);

    match source {
        Some(path) => info!("Loaded config from {}", path),
        None => warn!("No config file found, using default configuration"),
    }

    info!("Klimat client v{}", env!("CARGO_PKG_VERSION"));

    let device_addr = config.device_addr();
    info!("Connecting to device at {}...", device_addr);

    let keepalive = Duration::from_secs(config.timeouts.keepalive_secs);
    let transport = match CoapTransport::dial(
        &device_addr,
        Duration::from_secs(config.timeouts.dial_timeout_secs),
        Some(keepalive),
    )
    .await
    {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to connect: {}", e);
            return Err(e.into());
        }
    };

    let options = DeviceOptions {
        request_timeout: Duration::from_secs(config.timeouts.request_timeout_secs),
    };

    let device = match Device::connect(transport, options).await {
        Ok(device) => device,
        Err(e) => {
            error!("Sync handshake failed: {}", e);
            return Err(e.into());
        }
    };

    let device_info = device.info().await?;
    info!(
        "Connected to {} ({}, firmware {})",
        device_info.name, device_info.model_id, device_info.sw_version
    );

    let mut subscription = device.observe_status().await?;
    let status_task = tokio::spawn(async move {
        while let Some(update) = subscription.next().await {
            match update {
                Ok(status) => log_status(&status),
                Err(e) => warn!("Dropped status update: {}", e),
            }
        }
        info!("Status observation ended");
    });

    println!("\nKlimat client connected to {}.", device_info.name);
    println!("{}", HELP);
    println!("Type a command and press Enter:\n");

    // Interactive command loop
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        print!("> ");
        // Manually flush stdout since print! doesn't auto-flush
        use std::io::Write;
        std::io::stdout().flush()?;

        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("[ERROR] {}", e);
                continue;
            }
        };

        match command {
            Command::Quit => {
                info!("Exiting...");
                break;
            }
            Command::Info => match device.info().await {
                Ok(info) => println!("[OK] {}", serde_json::to_string_pretty(&info)?),
                Err(e) => println!("[ERROR] {}", e),
            },
            Command::Set(desired) => match device.set(desired).await {
                Ok(()) => println!("[OK] Command accepted"),
                Err(e) => {
                    warn!("Command failed: {}", e);
                    println!("[ERROR] {}", e);
                }
            },
        }
    }

    status_task.abort();
    Ok(())
}

fn log_status(status: &ReportedStatus) {
    info!(
        power = %status.power,
        mode = ?status.mode.as_ref().map(|m| m.code()),
        fan = ?status.fan_speed.as_ref().map(|f| f.code()),
        humidity = status.humidity,
        temperature = status.temperature,
        pm25 = status.pm25,
        air_quality = %status.air_quality.normalized(),
        water_level = status.water_level,
        "Status update"
    );

    if status.err.is_error() {
        warn!("{}", status.err);
    }
    if status.needs_filter_attention() {
        warn!("A filter or the wick needs cleaning or replacement");
    }
}

/// Config files tried in order: development layout, then the current directory
const CONFIG_PATHS: &[&str] = &["configs/client.toml", "client.toml"];

/// First config that loads, and where it came from. Runs before logging is
/// set up, so the caller reports the source.
fn load_config(paths: &[&'static str]) -> (ClientConfig, Option<&'static str>) {
    for path in paths {
        if let Ok(config) = ClientConfig::from_file(path) {
            return (config, Some(*path));
        }
    }

    // Use default config as last resort
    (ClientConfig::default_config(), None)
}

fn init_logging(config: &ClientConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    if config.logging.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}
