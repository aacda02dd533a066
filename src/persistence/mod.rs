//! # Persistence Module
//!
//! Data model and repository seams for the relational store that backs the fleet.
//! The schema itself is owned elsewhere; this module only describes the rows the
//! core reads and writes and the operations it needs on them.
//!
//! ## Key Abstractions
//! - **Device rows**: mutated here only through [`DeviceRepository::apply_status`]
//! - **Broker connection singleton**: at most one record, see [`BrokerConfigRepository`]
//! - **Audit trail**: append-only command and message logs, see [`AuditLog`]
//!
//! [`memory_store::InMemoryStore`] implements all three traits for a single process.
//! [`seed`] fills it from the `[broker]` and `[[devices]]` sections of the config file.

pub mod memory_store;
pub mod seed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use memory_store::InMemoryStore;

/// Primary key of a device row
pub type DeviceId = i64;

/// Upper bound for history queries
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Errors reported by a store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique column (MAC address or bus identifier) already holds the value
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backing store could not be reached or rejected the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Liveness of a device as last observed on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relay device registered in the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Upper-cased, unique
    pub mac_address: String,
    /// Name of the device on the bus, unique
    pub bus_id: String,
    pub ip_address: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    /// Last STATE or command result payload, opaque to the core
    pub last_payload: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// Input for registering a device (administrative path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub name: String,
    pub mac_address: String,
    pub bus_id: String,
    pub ip_address: Option<String>,
}

/// A status mutation applied to one device row in a single write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub bus_id: String,
    pub status: DeviceStatus,
    pub seen_at: DateTime<Utc>,
    /// `None` keeps the previously stored payload
    pub payload: Option<Vec<u8>>,
}

/// The broker connection singleton
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConnection {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    /// Base64 of IV followed by AES-256-CBC ciphertext
    pub encrypted_password: Option<String>,
    pub tls_enabled: bool,
    pub client_id: String,
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl BrokerConnection {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("encrypted_password", &self.encrypted_password.as_ref().map(|_| "<redacted>"))
            .field("tls_enabled", &self.tls_enabled)
            .field("client_id", &self.client_id)
            .field("connected", &self.connected)
            .field("last_connected_at", &self.last_connected_at)
            .finish()
    }
}

/// Classification of a bus message in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Lwt,
    State,
    CommandResult,
    Command,
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Lwt => "LWT",
            MessageKind::State => "STATE",
            MessageKind::CommandResult => "COMMAND_RESULT",
            MessageKind::Command => "COMMAND",
            MessageKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

/// Outcome of one operator command; immutable once written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLogEntry {
    pub device_id: DeviceId,
    pub issuer: String,
    pub command: String,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One inbound or outbound bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLogEntry {
    pub device_id: Option<DeviceId>,
    pub topic: String,
    pub payload: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

/// Device table operations used by the core
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn find_by_bus_id(&self, bus_id: &str) -> StoreResult<Option<Device>>;

    async fn find_by_id(&self, id: DeviceId) -> StoreResult<Option<Device>>;

    async fn list(&self) -> StoreResult<Vec<Device>>;

    /// Writes status, last seen and (when present) payload in one step.
    ///
    /// Returns `false` when no row carries the bus identifier.
    async fn apply_status(&self, update: StatusUpdate) -> StoreResult<bool>;
}

/// Access to the broker connection singleton
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConfigRepository: Send + Sync {
    async fn load(&self) -> StoreResult<Option<BrokerConnection>>;

    /// Inserts the singleton or replaces the existing record
    async fn save(&self, config: BrokerConnection) -> StoreResult<()>;

    /// Sets the connected flag; `connected_at` also moves `last_connected_at`.
    /// No-op when nothing is stored.
    async fn record_connection(
        &self,
        connected: bool,
        connected_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
}

/// Append-only audit trail
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append_command(&self, entry: CommandLogEntry) -> StoreResult<()>;

    async fn append_message(&self, entry: MessageLogEntry) -> StoreResult<()>;

    /// Newest first
    async fn recent_messages(&self, limit: usize) -> StoreResult<Vec<MessageLogEntry>>;

    /// Newest first
    async fn recent_commands(&self, limit: usize) -> StoreResult<Vec<CommandLogEntry>>;
}

/// Clamps a requested history size to `1..=MAX_HISTORY_LIMIT`
pub fn clamp_history_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_HISTORY_LIMIT)
}
