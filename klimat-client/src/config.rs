use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub device: DeviceSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSettings {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Interval between CoAP pings, 0 disables them
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

fn default_port() -> u16 {
    5683
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    5
}

fn default_keepalive() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            request_timeout_secs: default_request_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            device: DeviceSettings {
                address: "127.0.0.1".to_string(),
                port: default_port(),
            },
            timeouts: TimeoutSettings::default(),
            logging: LoggingSettings::default(),
        }
    }

    pub fn device_addr(&self) -> String {
        format!("{}:{}", self.device.address, self.device.port)
    }
}
