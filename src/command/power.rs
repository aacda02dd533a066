use super::dispatcher::{CommandDispatcher, CommandReceipt};
use super::DispatchError;
use crate::persistence::{DeviceId, DeviceRepository};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Relay power command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    On,
    Off,
}

impl PowerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerCommand::On => "ON",
            PowerCommand::Off => "OFF",
        }
    }
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerCommand {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ON" => Ok(PowerCommand::On),
            "OFF" => Ok(PowerCommand::Off),
            _ => Err(DispatchError::InvalidCommand(s.to_string())),
        }
    }
}

/// Operator-facing power switch addressed by device id
pub struct DevicePowerService {
    devices: Arc<dyn DeviceRepository>,
    dispatcher: Arc<CommandDispatcher>,
}

impl DevicePowerService {
    pub fn new(devices: Arc<dyn DeviceRepository>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            devices,
            dispatcher,
        }
    }

    /// Validates `power`, resolves the device and sends the command.
    ///
    /// An invalid command is rejected before any lookup or audit write.
    pub async fn toggle_power(
        &self,
        device_id: DeviceId,
        power: &str,
        issuer: &str,
    ) -> Result<CommandReceipt, DispatchError> {
        let command: PowerCommand = power.parse()?;

        let Some(device) = self.devices.find_by_id(device_id).await? else {
            warn!("Power command for unknown device id {}", device_id);
            return Err(DispatchError::DeviceNotFound(device_id.to_string()));
        };

        self.dispatcher
            .publish(&device.bus_id, command.as_str(), issuer)
            .await
    }
}
