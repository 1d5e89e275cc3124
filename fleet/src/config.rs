//! Fleet configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    codec::DEFAULT_MAX_FRAME_BYTES,
    error::{ConfigError, FleetResult},
    transport::ReconnectPolicy,
    tree::DEFAULT_FAN_OUT,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub looper: LooperConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl FleetConfig {
    /// Parse and validate.
    pub fn from_json(json: &str) -> FleetResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tree.validate()?;
        self.looper.validate()?;
        self.transport.validate()?;
        self.log.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeConfig {
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

fn default_fan_out() -> usize {
    DEFAULT_FAN_OUT
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fan_out == 0 {
            return Err(ConfigError::Invalid {
                field: "tree.fan_out",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LooperConfig {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_mailbox_capacity() -> usize {
    256
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl LooperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "looper.mailbox_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Byte prefix subscribers accept; empty accepts everything.
    #[serde(default)]
    pub subscribe_filter: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            subscribe_filter: String::new(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Smallest possible encoded message: header plus frame count.
        if self.max_frame_bytes < 14 {
            return Err(ConfigError::Invalid {
                field: "transport.max_frame_bytes",
                reason: format!("{} cannot hold a message header", self.max_frame_bytes),
            });
        }
        self.reconnect.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "transport.reconnect.max_delay_ms",
                reason: format!(
                    "{} is below base_delay_ms {}",
                    self.max_delay_ms, self.base_delay_ms
                ),
            });
        }
        Ok(())
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Default directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(()),
            other => Err(ConfigError::Invalid {
                field: "log.level",
                reason: format!("unknown level '{}'", other),
            }),
        }
    }
}
