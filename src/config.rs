//! Application configuration loaded from a TOML file.
//!
//! ```toml
//! [service]
//! reconnect_delay_secs = 5
//! keepalive_secs = 60
//!
//! [broker]
//! host = "192.168.1.10"
//! port = 1883
//! client_id = "iot_server"
//!
//! [[devices]]
//! name = "Sala"
//! mac_address = "AA:BB:CC:DD:EE:01"
//! bus_id = "tasmota_sala_luz"
//! ```

use crate::credentials::EncryptionKey;
use crate::mqtt::config::MIN_KEEP_ALIVE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Level};

const CONFIG_DIR: &str = "relaywatch";
const CONFIG_FILE: &str = "relaywatch.toml";
pub const DEFAULT_CLIENT_ID: &str = "iot_server";
pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable {0} holding the encryption key is not set")]
    MissingKey(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Timing and runtime settings of the service
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Fixed pause between reconnect attempts
    pub reconnect_delay_secs: u64,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub log_level: String,
    /// Name of the environment variable carrying the key material
    pub encryption_key_env: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            keepalive_secs: 60,
            connect_timeout_secs: 10,
            publish_timeout_secs: 5,
            log_level: "info".to_string(),
            encryption_key_env: "ENCRYPTION_KEY".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|e| ConfigError::Invalid {
                field: "service.log_level",
                reason: e.to_string(),
            })
    }
}

/// Initial broker connection record
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BrokerSeed {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    /// Output of `relaywatch encrypt-password`
    #[serde(default)]
    pub encrypted_password: Option<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

/// Initial device row
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceSeed {
    pub name: String,
    pub mac_address: String,
    pub bus_id: String,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub broker: Option<BrokerSeed>,
    pub devices: Vec<DeviceSeed>,
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

impl AppConfig {
    /// `<config dir>/relaywatch/relaywatch.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push(CONFIG_DIR);
            path.push(CONFIG_FILE);
            path
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file at `path`, or the default location when `None`.
    ///
    /// A missing file yields the default configuration.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            warn!("No config directory available, using defaults");
            return Ok(Self::default());
        };

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
        if !exists {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;

        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        debug!(
            "Service settings: {:?}, {} seeded devices",
            config.service,
            config.devices.len()
        );
        Ok(config)
    }

    /// Reads the key material from the configured environment variable
    pub fn encryption_key(&self) -> Result<EncryptionKey, ConfigError> {
        let var = &self.service.encryption_key_env;
        match std::env::var(var) {
            Ok(secret) if !secret.is_empty() => Ok(EncryptionKey::derive(&secret)),
            _ => Err(ConfigError::MissingKey(var.clone())),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service.keepalive_secs < MIN_KEEP_ALIVE.as_secs() {
            return Err(ConfigError::Invalid {
                field: "service.keepalive_secs",
                reason: format!("must be at least {}", MIN_KEEP_ALIVE.as_secs()),
            });
        }
        if self.service.reconnect_delay_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "service.reconnect_delay_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(broker) = &self.broker {
            if broker.host.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "broker.host",
                    reason: "must not be empty".to_string(),
                });
            }
            if broker.port == 0 {
                return Err(ConfigError::Invalid {
                    field: "broker.port",
                    reason: "must be in 1..=65535".to_string(),
                });
            }
        }
        let _ = self.service.log_level()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.service.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.service.keepalive(), Duration::from_secs(60));
        assert!(config.service.publish_timeout() <= Duration::from_secs(5));
    }

    #[test]
    fn test_full_file() {
        let config = AppConfig::from_toml_str(
            r#"
            [service]
            reconnect_delay_secs = 2
            log_level = "debug"

            [broker]
            host = "broker.lan"
            tls_enabled = true

            [[devices]]
            name = "Sala"
            mac_address = "aa:bb:cc:dd:ee:01"
            bus_id = "tasmota_sala_luz"
            ip = "192.168.1.40"
            "#,
        )
        .unwrap();

        assert_eq!(config.service.reconnect_delay_secs, 2);
        assert_eq!(config.service.keepalive_secs, 60);
        assert_eq!(config.service.log_level().unwrap(), Level::DEBUG);

        let broker = config.broker.unwrap();
        assert_eq!(broker.port, DEFAULT_BROKER_PORT);
        assert_eq!(broker.client_id, DEFAULT_CLIENT_ID);
        assert!(broker.tls_enabled);

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].bus_id, "tasmota_sala_luz");
    }

    #[test]
    fn test_rejects_empty_host_and_zero_keepalive() {
        assert!(AppConfig::from_toml_str("[broker]\nhost = \"  \"").is_err());
        assert!(AppConfig::from_toml_str("[service]\nkeepalive_secs = 0").is_err());
        assert!(AppConfig::from_toml_str("[service]\nlog_level = \"loud\"").is_err());
    }

    #[test]
    fn test_keepalive_below_client_minimum_is_rejected() {
        for secs in [1, 2, 4] {
            let err = AppConfig::from_toml_str(&format!("[service]\nkeepalive_secs = {}", secs))
                .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid { field: "service.keepalive_secs", .. }
            ));
        }
        let config = AppConfig::from_toml_str("[service]\nkeepalive_secs = 5").unwrap();
        assert_eq!(config.service.keepalive(), MIN_KEEP_ALIVE);
    }

    #[test]
    fn test_zero_reconnect_delay_is_rejected() {
        let err = AppConfig::from_toml_str("[service]\nreconnect_delay_secs = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "service.reconnect_delay_secs", .. }
        ));
        assert!(AppConfig::from_toml_str("[service]\nreconnect_delay_secs = 1").is_ok());
    }

    #[test]
    fn test_missing_key_variable() {
        let mut config = AppConfig::default();
        config.service.encryption_key_env = "RELAYWATCH_TEST_UNSET_KEY_VAR".to_string();
        let err = config.encryption_key().unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("relaywatch-missing-config.toml");
        let config = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
