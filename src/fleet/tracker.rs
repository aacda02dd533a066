use crate::persistence::{DeviceId, DeviceRepository, DeviceStatus, StatusUpdate, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Result of one status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { device_id: DeviceId },
    /// No device carries the bus identifier; nothing was written
    DeviceNotFound,
}

/// Applies liveness and payload changes to device rows.
///
/// Updates for the same bus identifier are serialized through a per-device
/// async lock held across lookup and write, so concurrent LWT, STATE and
/// command-result messages for one device never interleave.
pub struct DeviceStateTracker {
    devices: Arc<dyn DeviceRepository>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceStateTracker {
    pub fn new(devices: Arc<dyn DeviceRepository>) -> Self {
        Self {
            devices,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn device_lock(&self, bus_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(bus_id.to_string()).or_default().clone()
    }

    /// Drops the map entry once no other update holds or waits on it
    fn release_lock(&self, bus_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(bus_id);
        }
    }

    /// Number of bus identifiers with an update in flight
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sets status and last seen; replaces the stored payload only when one is given.
    ///
    /// Unknown bus identifiers are logged and ignored; devices are never created here.
    pub async fn update_status(
        &self,
        bus_id: &str,
        status: DeviceStatus,
        payload: Option<Vec<u8>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let lock = self.device_lock(bus_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(bus_id, status, payload).await
        };
        self.release_lock(bus_id, lock);
        result
    }

    async fn apply(
        &self,
        bus_id: &str,
        status: DeviceStatus,
        payload: Option<Vec<u8>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let Some(device) = self.devices.find_by_bus_id(bus_id).await? else {
            warn!("Device not found: {}", bus_id);
            return Ok(UpdateOutcome::DeviceNotFound);
        };

        let applied = self
            .devices
            .apply_status(StatusUpdate {
                bus_id: bus_id.to_string(),
                status,
                seen_at: Utc::now(),
                payload,
            })
            .await?;
        if !applied {
            warn!("Device vanished before update: {}", bus_id);
            return Ok(UpdateOutcome::DeviceNotFound);
        }

        info!("Status updated: {} -> {}", bus_id, status);
        Ok(UpdateOutcome::Updated {
            device_id: device.id,
        })
    }
}
