//! Application configuration.
//!
//! Everything has a sensible default, so a configuration file is only
//! needed to deviate from one. The file is plain TOML:
//!
//! ```toml
//! [transport]
//! mtu = 1200
//! ack_delay_ms = 40
//!
//! [console]
//! created_by = "torrkit 0.1.0"
//! ```
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a configuration file cannot be loaded.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("could not read configuration file {path}: {source}")]
    UnreadableFile { path: String, source: std::io::Error },

    #[error("invalid configuration: {source}")]
    Invalid { source: toml::de::Error },
}

/// Root configuration for the whole application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub transport: UtpConfig,
    pub console: ConsoleConfig,
}

impl Configuration {
    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Will return an error if the file cannot be read or does not parse
    /// as a `Configuration`.
    pub fn load_from_file(path: &Path) -> Result<Configuration, ConfigurationError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::UnreadableFile {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| ConfigurationError::Invalid { source })
    }
}

/// Tunables for the uTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtpConfig {
    /// Largest packet (header plus payload) handed to the UDP socket.
    pub mtu: usize,
    /// Receive window advertised to peers, in bytes (before scaling).
    pub recv_window: u32,
    /// Ceiling for the congestion window, in bytes (before scaling).
    pub max_window: u32,
    /// Unacknowledged-packet bound before `send` applies backpressure.
    pub max_unacked_packets: usize,
    /// Delayed-acknowledgment flush interval, in milliseconds.
    pub ack_delay_ms: u64,
    /// Retransmission budget per packet before the connection fails.
    pub max_retransmits: u32,
    /// Handshake deadline, in seconds.
    pub connect_timeout_secs: u64,
    /// Ceiling for the AIMD rate estimator, bytes per second.
    pub max_rate: u32,
    /// Floor for the AIMD rate estimator, bytes per second.
    pub min_rate: u32,
}

impl Default for UtpConfig {
    fn default() -> UtpConfig {
        UtpConfig {
            mtu: 1200,
            recv_window: 65_535,
            max_window: 65_535,
            max_unacked_packets: 100,
            ack_delay_ms: 40,
            max_retransmits: 5,
            connect_timeout_secs: 30,
            max_rate: 1_000_000,
            min_rate: 512,
        }
    }
}

impl UtpConfig {
    #[must_use]
    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The window-scale shift to advertise: the smallest shift that
    /// brings the configured maximum window under the unscaled 16-bit
    /// field, capped at the protocol maximum of 14.
    #[must_use]
    pub fn window_scale_shift(&self) -> u8 {
        let mut shift = 0u8;
        let mut scaled = self.max_window;
        while scaled > u32::from(u16::MAX) && shift < 14 {
            shift += 1;
            scaled >>= 1;
        }
        shift
    }
}

/// Defaults for the console commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Value written to the `created by` field of generated torrents.
    pub created_by: String,
}

impl Default for ConsoleConfig {
    fn default() -> ConsoleConfig {
        ConsoleConfig {
            created_by: format!("torrkit {}", env!("CARGO_PKG_VERSION")),
        }
    }
}
