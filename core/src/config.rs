use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{Device, Endpoint, ProtocolKind};
use crate::store::{DeviceRegistry, StoreFuture};
use crate::{targets, Error, StorageAction};

pub const DEFAULT_POLL_CONCURRENCY: usize = 5;
pub const DEFAULT_WRITE_CONCURRENCY: usize = 3;
pub const DEFAULT_BACKOFF_WINDOW_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub poll_concurrency: usize,
    pub write_concurrency: usize,
    pub backoff_window_secs: u64,
    pub interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_concurrency: DEFAULT_POLL_CONCURRENCY,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            backoff_window_secs: DEFAULT_BACKOFF_WINDOW_SECS,
            interval_secs: 10,
        }
    }
}

impl PollingConfig {
    pub fn backoff_window(&self) -> Duration {
        Duration::from_secs(self.backoff_window_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterTimeouts {
    pub status_secs: u64,
    pub upload_secs: u64,
    pub command_secs: u64,
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            status_secs: 5,
            upload_secs: 120,
            command_secs: 10,
        }
    }
}

impl AdapterTimeouts {
    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub program: String,
    pub sweep_interval_secs: u64,
    pub status_timeout_secs: u64,
    pub status_lifetime_secs: u64,
    pub transfer_timeout_secs: u64,
    pub transfer_lifetime_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            sweep_interval_secs: 10,
            status_timeout_secs: 15,
            status_lifetime_secs: 30,
            transfer_timeout_secs: 240,
            transfer_lifetime_secs: 300,
        }
    }
}

impl BridgeConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn status_lifetime(&self) -> Duration {
        Duration::from_secs(self.status_lifetime_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn transfer_lifetime(&self) -> Duration {
        Duration::from_secs(self.transfer_lifetime_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("printfleet-state.ron"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == value)
            .ok_or_else(|| format!("unknown log level: {value}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub timeouts: AdapterTimeouts,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let label = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| Error::StorageIo {
            action: StorageAction::Load,
            path: Some(label.clone()),
            source,
        })?;
        let config = Self::parse(&text).map_err(|error| match error {
            Error::Config { details, .. } => Error::Config {
                path: Some(label.clone()),
                details,
            },
            other => other,
        })?;

        info!(
            target: targets::CLI,
            path = %label,
            devices = config.devices.len(),
            "Fleet configuration loaded"
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let config: FleetConfig = ron::from_str(text).map_err(|error| Error::Config {
            path: None,
            details: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.polling.poll_concurrency == 0 || self.polling.write_concurrency == 0 {
            return Err(config_error("concurrency limits must be at least 1"));
        }
        let timeouts = [
            ("timeouts.status_secs", self.timeouts.status_secs),
            ("timeouts.upload_secs", self.timeouts.upload_secs),
            ("timeouts.command_secs", self.timeouts.command_secs),
            ("bridge.status_timeout_secs", self.bridge.status_timeout_secs),
            ("bridge.status_lifetime_secs", self.bridge.status_lifetime_secs),
            ("bridge.transfer_timeout_secs", self.bridge.transfer_timeout_secs),
            ("bridge.transfer_lifetime_secs", self.bridge.transfer_lifetime_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(config_error(format!("{name} must be at least 1 second")));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.clone()) {
                return Err(config_error(format!("duplicate device id {}", device.id)));
            }

            match (&device.protocol, &device.endpoint) {
                (ProtocolKind::PrusaLink | ProtocolKind::Moonraker, Endpoint::Http { base_url }) => {
                    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                        return Err(config_error(format!(
                            "device {} needs an http(s) base URL, got {base_url}",
                            device.id
                        )));
                    }
                }
                (ProtocolKind::BambuLab, Endpoint::Lan { host, serial }) => {
                    if host.trim().is_empty() || serial.trim().is_empty() {
                        return Err(config_error(format!(
                            "device {} needs a LAN host and serial",
                            device.id
                        )));
                    }
                }
                (protocol, endpoint) => {
                    return Err(config_error(format!(
                        "device {} uses {protocol} with an incompatible endpoint {endpoint}",
                        device.id
                    )));
                }
            }

            debug!(
                target: targets::CLI,
                device = %device.id,
                protocol = %device.protocol,
                "Device configuration ok"
            );
        }

        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.id.as_str() == id)
    }
}

impl DeviceRegistry for FleetConfig {
    fn list_devices(&self) -> StoreFuture<'_, Vec<Device>> {
        let devices = self.devices.clone();
        Box::pin(async move { Ok(devices) })
    }
}

fn config_error(details: impl Into<String>) -> Error {
    Error::Config {
        path: None,
        details: details.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"(
        log_level: Some(debug),
        polling: (poll_concurrency: 8),
        devices: [
            (
                id: "mk4",
                protocol: PrusaLink,
                endpoint: Http(base_url: "http://10.0.0.5"),
                credential: Some("secret"),
            ),
            (
                id: "voron",
                protocol: Moonraker,
                endpoint: Http(base_url: "http://10.0.0.6:7125"),
                management: Maintenance,
            ),
            (
                id: "x1c",
                protocol: BambuLab,
                endpoint: Lan(host: "10.0.0.7", serial: "01S00A000000000"),
                credential: Some("12345678"),
            ),
        ],
    )"#;

    #[test]
    fn parses_fleet_with_defaults() {
        let config = FleetConfig::parse(FLEET).expect("parse fleet");
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.polling.poll_concurrency, 8);
        assert_eq!(config.polling.write_concurrency, DEFAULT_WRITE_CONCURRENCY);
        assert_eq!(config.polling.backoff_window(), Duration::from_secs(30));
        assert_eq!(config.timeouts.status(), Duration::from_secs(5));
        assert_eq!(config.bridge.program, "python3");
        assert_eq!(config.devices.len(), 3);
        assert!(!config.device("voron").expect("voron").is_pollable());
    }

    #[test]
    fn example_fleet_file_is_valid() {
        let config = FleetConfig::parse(include_str!("../../fleet.example.ron"))
            .expect("example fleet");
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.storage.state_path, PathBuf::from("printfleet-state.ron"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let text = r#"(devices: [
            (id: "a", protocol: Moonraker, endpoint: Http(base_url: "http://h")),
            (id: "a", protocol: Moonraker, endpoint: Http(base_url: "http://h")),
        ])"#;
        let error = FleetConfig::parse(text).expect_err("duplicate ids");
        assert!(error.technical_detail().contains("duplicate device id a"));
    }

    #[test]
    fn rejects_endpoint_protocol_mismatch() {
        let text = r#"(devices: [
            (id: "a", protocol: BambuLab, endpoint: Http(base_url: "http://h")),
        ])"#;
        assert!(FleetConfig::parse(text).is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let text = "(polling: (poll_concurrency: 0))";
        assert!(FleetConfig::parse(text).is_err());
    }

    #[test]
    fn rejects_zero_timeouts() {
        for text in [
            "(timeouts: (status_secs: 0))",
            "(timeouts: (upload_secs: 0))",
            "(bridge: (status_timeout_secs: 0))",
            "(bridge: (transfer_lifetime_secs: 0))",
        ] {
            let error = FleetConfig::parse(text).expect_err(text);
            assert!(
                error.technical_detail().contains("must be at least 1 second"),
                "{text}"
            );
        }
        assert!(FleetConfig::parse("(timeouts: (status_secs: 1))").is_ok());
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
