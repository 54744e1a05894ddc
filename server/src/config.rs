//! Server configuration.
//!
//! Everything the core consumes arrives through [`ServerConfig`]. The binary
//! builds one from an optional TOML file plus command-line overrides and
//! calls [`ServerConfig::validate`] before handing it over; the library never
//! reads files or the environment on its own.

use netplay_shared::{ConnectionType, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Static address lists consumed by the default access policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub admins: Vec<IpAddr>,
    pub denied: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Inclusive range session ports are drawn from; any free port when unset.
    pub session_port_range: Option<(u16, u16)>,

    pub max_users: usize,
    /// 0 disables the limit.
    pub max_games: usize,
    pub max_ping: u32,
    pub max_user_name_length: usize,
    pub max_chat_length: usize,
    pub max_game_name_length: usize,
    pub allowed_connection_types: Vec<ConnectionType>,

    pub chat_flood_time_secs: u64,
    pub create_game_flood_time_secs: u64,
    pub idle_timeout_secs: u64,
    pub keep_alive_timeout_secs: u64,

    pub game_timeout_ms: u64,
    pub start_timeout_secs: u64,
    pub desync_timeouts: usize,
    pub max_stall_timeouts: u32,
    pub game_buffer_size: usize,
    pub game_max_users: u8,
    pub allow_single_player: bool,
    pub same_delay: bool,
    pub small_lag_threshold_ms: u64,
    pub large_lag_threshold_ms: u64,

    pub session_buffer_size: usize,
    pub resend_interval_ms: u64,
    pub ping_rounds: usize,

    pub access: AccessConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            session_port_range: None,
            max_users: 100,
            max_games: 50,
            max_ping: 1000,
            max_user_name_length: 31,
            max_chat_length: 150,
            max_game_name_length: 127,
            allowed_connection_types: ConnectionType::ALL
                .into_iter()
                .filter(|t| *t != ConnectionType::Disabled)
                .collect(),
            chat_flood_time_secs: 2,
            create_game_flood_time_secs: 2,
            idle_timeout_secs: 1200,
            keep_alive_timeout_secs: 190,
            game_timeout_ms: 5000,
            start_timeout_secs: 10,
            desync_timeouts: 120,
            max_stall_timeouts: 3,
            game_buffer_size: 4096,
            game_max_users: 8,
            allow_single_player: true,
            same_delay: false,
            small_lag_threshold_ms: 50,
            large_lag_threshold_ms: 250,
            session_buffer_size: 64,
            resend_interval_ms: 100,
            ping_rounds: 4,
            access: AccessConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn chat_flood_time(&self) -> Duration {
        Duration::from_secs(self.chat_flood_time_secs)
    }

    pub fn create_game_flood_time(&self) -> Duration {
        Duration::from_secs(self.create_game_flood_time_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn game_timeout(&self) -> Duration {
        Duration::from_millis(self.game_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn small_lag_threshold(&self) -> Duration {
        Duration::from_millis(self.small_lag_threshold_ms)
    }

    pub fn large_lag_threshold(&self) -> Duration {
        Duration::from_millis(self.large_lag_threshold_ms)
    }

    pub fn is_connection_type_allowed(&self, connection_type: ConnectionType) -> bool {
        self.allowed_connection_types.contains(&connection_type)
    }

    /// Rejects configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.max_users == 0 {
            return Err(ConfigError::invalid("max_users", "must be at least 1"));
        }
        if self.max_users > usize::from(u16::MAX) {
            return Err(ConfigError::invalid(
                "max_users",
                format!("must not exceed {}", u16::MAX),
            ));
        }
        if let Some((start, end)) = self.session_port_range {
            if start == 0 || start > end {
                return Err(ConfigError::invalid(
                    "session_port_range",
                    format!("[{start}, {end}] is not a valid port range"),
                ));
            }
        }
        if self.max_user_name_length == 0 {
            return Err(ConfigError::invalid(
                "max_user_name_length",
                "must be at least 1",
            ));
        }
        if self.max_chat_length == 0 || self.max_game_name_length == 0 {
            return Err(ConfigError::invalid(
                "max_chat_length/max_game_name_length",
                "must be at least 1",
            ));
        }
        if self.allowed_connection_types.is_empty() {
            return Err(ConfigError::invalid(
                "allowed_connection_types",
                "at least one connection type must be allowed",
            ));
        }
        if self.game_buffer_size == 0 {
            return Err(ConfigError::invalid("game_buffer_size", "must be non-zero"));
        }
        if self.game_max_users == 0 {
            return Err(ConfigError::invalid("game_max_users", "must be at least 1"));
        }
        if self.desync_timeouts == 0 {
            return Err(ConfigError::invalid("desync_timeouts", "must be non-zero"));
        }
        if self.session_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "session_buffer_size",
                "must be non-zero",
            ));
        }
        if self.ping_rounds == 0 {
            return Err(ConfigError::invalid("ping_rounds", "must be at least 1"));
        }
        if self.resend_interval_ms == 0 || self.game_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "resend_interval_ms/game_timeout_ms",
                "must be non-zero",
            ));
        }
        if self.large_lag_threshold_ms < self.small_lag_threshold_ms {
            return Err(ConfigError::invalid(
                "large_lag_threshold_ms",
                "must not be below small_lag_threshold_ms",
            ));
        }
        Ok(())
    }
}
