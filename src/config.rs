//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! mode = "usb"            # usb | serial | network
//!
//! [network]
//! bind_address = "0.0.0.0:14238"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! initial_baud = 9600
//!
//! [storage]
//! root = "/var/lib/palmsync"
//!
//! [sync]
//! capture_dir = "/var/lib/palmsync/captures"   # optional; omit to disable
//! ```
//!
//! See `palmsync.toml` for a complete example.

use crate::error::{Error, Result};
use crate::transport::HOTSYNC_TCP_PORT;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Which transport the server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Usb,
    Serial,
    Network,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Transport to listen on
    ///
    /// **Valid values**: "usb", "serial", "network"
    /// **Required**: Yes
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// TCP bind address for NetSync clients
    ///
    /// **Default**: "0.0.0.0:14238" (the HotSync network port)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    format!("0.0.0.0:{}", HOTSYNC_TCP_PORT)
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Serial port the cradle is attached to
    ///
    /// **Format**: Device path (e.g., "/dev/ttyUSB0", "COM3")
    /// **Required**: For serial mode
    pub port: String,

    /// Baud rate used while waiting for the CMP wakeup
    ///
    /// The session is reopened at whatever rate the device proposes.
    /// **Default**: 9600 (a cold cradle always starts there)
    #[serde(default = "default_initial_baud")]
    pub initial_baud: u32,
}

fn default_initial_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for user areas, backups, and the install queue
    pub root: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncOptions {
    /// Directory for raw session captures; omit to disable recording
    #[serde(default)]
    pub capture_dir: Option<String>,
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub serial: Option<SerialConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncOptions,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = basic_toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        match config.server.mode.as_str() {
            "usb" | "network" => {}
            "serial" => {
                let serial = config.serial.as_ref().ok_or_else(|| {
                    Error::Config("serial mode requires a [serial] section".to_string())
                })?;
                if serial.port.is_empty() {
                    return Err(Error::Config("serial port must not be empty".to_string()));
                }
                if serial.initial_baud == 0 {
                    return Err(Error::Config("initial_baud must be non-zero".to_string()));
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown server mode \"{}\" (expected usb, serial, or network)",
                    other
                )));
            }
        }

        if config.storage.root.is_empty() {
            return Err(Error::Config("storage root must not be empty".to_string()));
        }

        Ok(config)
    }

    /// The validated transport mode
    pub fn mode(&self) -> Mode {
        match self.server.mode.as_str() {
            "usb" => Mode::Usb,
            "serial" => Mode::Serial,
            _ => Mode::Network,
        }
    }

    pub fn bind_address(&self) -> String {
        self.network
            .clone()
            .unwrap_or_default()
            .bind_address
    }

    pub fn serial_settings(&self) -> Result<&SerialConfig> {
        self.serial
            .as_ref()
            .ok_or_else(|| Error::Config("serial mode requires a [serial] section".to_string()))
    }

    pub fn capture_dir(&self) -> Option<String> {
        self.sync.capture_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_usb_config() {
        let config = Config::parse(
            r#"
            [server]
            mode = "usb"

            [storage]
            root = "/var/lib/palmsync"
            "#,
        )
        .unwrap();
        assert_eq!(config.mode(), Mode::Usb);
        assert_eq!(config.bind_address(), "0.0.0.0:14238");
        assert!(config.capture_dir().is_none());
    }

    #[test]
    fn test_serial_mode_requires_section() {
        let err = Config::parse(
            r#"
            [server]
            mode = "serial"

            [storage]
            root = "/var/lib/palmsync"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_serial_defaults() {
        let config = Config::parse(
            r#"
            [server]
            mode = "serial"

            [serial]
            port = "/dev/ttyUSB0"

            [storage]
            root = "/var/lib/palmsync"
            "#,
        )
        .unwrap();
        assert_eq!(config.serial_settings().unwrap().initial_baud, 9600);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = Config::parse(
            r#"
            [server]
            mode = "bluetooth"

            [storage]
            root = "/var/lib/palmsync"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
