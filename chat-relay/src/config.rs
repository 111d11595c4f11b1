use std::time::Duration;

use thiserror::Error;

use crate::relay::{HEADER_SIZE, MAX_PAYLOAD};

pub const DEFAULT_MAX_CLIENTS: usize = 64;
pub const DEFAULT_RELAY_CAPACITY: usize = 8 * 1024;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS);

/// Runtime settings for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Hard limit on concurrent connections; extra connections are refused.
    pub max_clients: usize,
    /// Unread bytes a worker may queue on its relay pipe before it blocks.
    pub relay_capacity: usize,
    /// Lines queued per client before further lines to it are dropped.
    pub outbound_capacity: usize,
    /// How long a closing or refused connection may take to receive its
    /// final lines.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max clients must be at least 1")]
    NoCapacity,
    #[error("relay capacity {capacity} is smaller than one full frame ({required} bytes)")]
    RelayTooSmall { capacity: usize, required: usize },
    #[error("outbound queue must hold at least one line")]
    ZeroOutboundCapacity,
    #[error("write timeout must be greater than zero")]
    ZeroWriteTimeout,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::NoCapacity);
        }
        let required = HEADER_SIZE + MAX_PAYLOAD;
        if self.relay_capacity < required {
            return Err(ConfigError::RelayTooSmall {
                capacity: self.relay_capacity,
                required,
            });
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::ZeroOutboundCapacity);
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ServerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_unusable_values() {
        let config = ServerConfig {
            max_clients: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoCapacity));

        let config = ServerConfig {
            relay_capacity: 100,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelayTooSmall {
                capacity: 100,
                required: 1031
            })
        );

        let config = ServerConfig {
            outbound_capacity: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroOutboundCapacity));

        let config = ServerConfig {
            write_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroWriteTimeout));
    }
}
