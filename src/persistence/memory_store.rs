use super::{
    AuditLog, BrokerConfigRepository, BrokerConnection, CommandLogEntry, Device, DeviceId,
    DeviceRepository, DeviceStatus, MessageLogEntry, NewDevice, StatusUpdate, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct DeviceTable {
    next_id: DeviceId,
    rows: BTreeMap<DeviceId, Device>,
}

/// Process-local store implementing every repository trait.
///
/// Each table sits behind its own `RwLock`; a status update takes the device
/// table's write lock once, so status, last seen and payload land together.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    devices: RwLock<DeviceTable>,
    broker: RwLock<Option<BrokerConnection>>,
    commands: RwLock<Vec<CommandLogEntry>>,
    messages: RwLock<Vec<MessageLogEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device with status `unknown`.
    ///
    /// MAC addresses are stored upper-cased; both the MAC address and the bus
    /// identifier must be unique.
    pub async fn register_device(&self, input: NewDevice) -> StoreResult<Device> {
        let mac_address = input.mac_address.trim().to_uppercase();
        let bus_id = input.bus_id.trim().to_string();

        let mut table = self.devices.write().await;
        if table
            .rows
            .values()
            .any(|d| d.mac_address == mac_address || d.bus_id == bus_id)
        {
            return Err(StoreError::Conflict(format!(
                "device with MAC {} or bus id {} already exists",
                mac_address, bus_id
            )));
        }

        table.next_id += 1;
        let device = Device {
            id: table.next_id,
            name: input.name.trim().to_string(),
            mac_address,
            bus_id,
            ip_address: input.ip_address,
            status: DeviceStatus::Unknown,
            last_seen: None,
            last_payload: None,
            created_at: Utc::now(),
        };
        let _ = table.rows.insert(device.id, device.clone());

        info!("Registered device {} ({})", device.name, device.bus_id);
        Ok(device)
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.rows.len()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryStore {
    async fn find_by_bus_id(&self, bus_id: &str) -> StoreResult<Option<Device>> {
        let table = self.devices.read().await;
        Ok(table.rows.values().find(|d| d.bus_id == bus_id).cloned())
    }

    async fn find_by_id(&self, id: DeviceId) -> StoreResult<Option<Device>> {
        let table = self.devices.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<Device>> {
        let table = self.devices.read().await;
        Ok(table.rows.values().cloned().collect())
    }

    async fn apply_status(&self, update: StatusUpdate) -> StoreResult<bool> {
        let mut table = self.devices.write().await;
        let Some(device) = table.rows.values_mut().find(|d| d.bus_id == update.bus_id) else {
            return Ok(false);
        };

        device.status = update.status;
        device.last_seen = Some(update.seen_at);
        if let Some(payload) = update.payload {
            device.last_payload = Some(payload);
        }
        debug!("Applied status {} to {}", device.status, device.bus_id);
        Ok(true)
    }
}

#[async_trait]
impl BrokerConfigRepository for InMemoryStore {
    async fn load(&self) -> StoreResult<Option<BrokerConnection>> {
        Ok(self.broker.read().await.clone())
    }

    async fn save(&self, config: BrokerConnection) -> StoreResult<()> {
        *self.broker.write().await = Some(config);
        Ok(())
    }

    async fn record_connection(
        &self,
        connected: bool,
        connected_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        if let Some(config) = self.broker.write().await.as_mut() {
            config.connected = connected;
            if connected_at.is_some() {
                config.last_connected_at = connected_at;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLog for InMemoryStore {
    async fn append_command(&self, entry: CommandLogEntry) -> StoreResult<()> {
        self.commands.write().await.push(entry);
        Ok(())
    }

    async fn append_message(&self, entry: MessageLogEntry) -> StoreResult<()> {
        self.messages.write().await.push(entry);
        Ok(())
    }

    async fn recent_messages(&self, limit: usize) -> StoreResult<Vec<MessageLogEntry>> {
        let messages = self.messages.read().await;
        Ok(messages.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_commands(&self, limit: usize) -> StoreResult<Vec<CommandLogEntry>> {
        let commands = self.commands.read().await;
        Ok(commands.iter().rev().take(limit).cloned().collect())
    }
}
