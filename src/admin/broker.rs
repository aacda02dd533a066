use crate::config::{DEFAULT_BROKER_PORT, DEFAULT_CLIENT_ID};
use crate::credentials::{CredentialCodec, CredentialError};
use crate::mqtt::config::ConnectParams;
use crate::mqtt::session::{Connector, SessionError};
use crate::persistence::{BrokerConfigRepository, BrokerConnection, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Error)]
pub enum BrokerAdminError {
    #[error("Host is required")]
    MissingHost,

    #[error("Invalid port {0}, expected 1..=65535")]
    InvalidPort(u32),

    #[error("MQTT configuration not found")]
    NotConfigured,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Broker configuration as shown to operators; never carries the password
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfigView {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub has_password: bool,
    pub tls_enabled: bool,
    pub client_id: String,
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl From<&BrokerConnection> for BrokerConfigView {
    fn from(config: &BrokerConnection) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            has_password: config.encrypted_password.is_some(),
            tls_enabled: config.tls_enabled,
            client_id: config.client_id.clone(),
            connected: config.connected,
            last_connected_at: config.last_connected_at,
        }
    }
}

impl Default for BrokerConfigView {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            username: None,
            has_password: false,
            tls_enabled: false,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            connected: false,
            last_connected_at: None,
        }
    }
}

/// Operator input for replacing the broker configuration.
///
/// `port` is wide so out-of-range input is reported instead of truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfigUpdate {
    pub host: String,
    pub port: u32,
    #[serde(default)]
    pub username: Option<String>,
    /// Plaintext; empty or absent keeps the stored password
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Result of a one-shot connection probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub connected: bool,
    pub message: String,
}

/// Reads, replaces and probes the broker connection singleton
pub struct BrokerAdmin {
    brokers: Arc<dyn BrokerConfigRepository>,
    codec: Arc<CredentialCodec>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    keepalive: Duration,
}

impl BrokerAdmin {
    pub fn new(
        brokers: Arc<dyn BrokerConfigRepository>,
        codec: Arc<CredentialCodec>,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        keepalive: Duration,
    ) -> Self {
        Self {
            brokers,
            codec,
            connector,
            connect_timeout,
            keepalive,
        }
    }

    /// Stored configuration, or the defaults when none has been saved yet
    pub async fn get_config(&self) -> Result<BrokerConfigView, BrokerAdminError> {
        Ok(self
            .brokers
            .load()
            .await?
            .as_ref()
            .map(BrokerConfigView::from)
            .unwrap_or_default())
    }

    pub async fn update_config(
        &self,
        update: BrokerConfigUpdate,
    ) -> Result<BrokerConfigView, BrokerAdminError> {
        let host = update.host.trim();
        if host.is_empty() {
            return Err(BrokerAdminError::MissingHost);
        }
        let port = u16::try_from(update.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(BrokerAdminError::InvalidPort(update.port))?;

        let previous = self.brokers.load().await?;

        let encrypted_password = match update.password.as_deref().filter(|p| !p.is_empty()) {
            Some(plaintext) => Some(self.codec.encrypt(plaintext)),
            None => previous.as_ref().and_then(|p| p.encrypted_password.clone()),
        };
        let client_id = update
            .client_id
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let config = BrokerConnection {
            host: host.to_string(),
            port,
            username: update.username.filter(|u| !u.is_empty()),
            encrypted_password,
            tls_enabled: update.tls_enabled,
            client_id,
            connected: previous.as_ref().is_some_and(|p| p.connected),
            last_connected_at: previous.as_ref().and_then(|p| p.last_connected_at),
        };

        let view = BrokerConfigView::from(&config);
        self.brokers.save(config).await?;
        info!("Broker configuration updated: {}:{}", view.host, view.port);
        Ok(view)
    }

    /// Opens and closes one session against the stored configuration.
    ///
    /// Persists the connected flag; `last_connected_at` only moves on success.
    pub async fn test_connection(&self) -> Result<ProbeOutcome, BrokerAdminError> {
        let config = self
            .brokers
            .load()
            .await?
            .ok_or(BrokerAdminError::NotConfigured)?;
        let endpoint = config.endpoint();

        let outcome = match self.probe(config).await {
            Ok(()) => {
                info!("Connection test to {} succeeded", endpoint);
                ProbeOutcome {
                    connected: true,
                    message: format!("Connected to {}", endpoint),
                }
            }
            Err(reason) => {
                warn!("Connection test to {} failed: {}", endpoint, reason);
                ProbeOutcome {
                    connected: false,
                    message: format!("Connection to {} failed: {}", endpoint, reason),
                }
            }
        };

        self.brokers
            .record_connection(outcome.connected, outcome.connected.then(Utc::now))
            .await?;
        Ok(outcome)
    }

    async fn probe(&self, config: BrokerConnection) -> Result<(), ProbeFailure> {
        let password = match config.encrypted_password.as_deref().filter(|p| !p.is_empty()) {
            Some(encrypted) => Some(self.codec.decrypt(encrypted)?),
            None => None,
        };
        let params = ConnectParams::from_stored(config, password, self.keepalive);

        let link = tokio::time::timeout(self.connect_timeout, self.connector.connect(&params))
            .await
            .map_err(|_| ProbeFailure::Timeout(self.connect_timeout))??;
        link.close().await;
        Ok(())
    }
}

#[derive(Debug, Error)]
enum ProbeFailure {
    #[error("{0}")]
    Credentials(#[from] CredentialError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
