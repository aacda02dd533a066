//! # Command Path
//!
//! Outbound half of the core. [`dispatcher::CommandDispatcher`] turns one
//! operator request into one publish on `cmnd/<bus_id>/POWER` and writes the
//! audit pair for it; [`power::DevicePowerService`] is the id-addressed entry
//! point used by the device API.
//!
//! ```text
//! DevicePowerService ──► CommandDispatcher ──► BusSession ──► broker
//!                               │
//!                               └──► command log + message log (OUT)
//! ```

pub mod dispatcher;
pub mod power;

use crate::persistence::StoreError;
use std::time::Duration;
use thiserror::Error;

pub use dispatcher::{CommandDispatcher, CommandReceipt};
pub use power::{DevicePowerService, PowerCommand};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("MQTT broker not connected")]
    BrokerUnavailable,

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Publish not acknowledged within {0:?}")]
    PublishTimeout(Duration),

    #[error("Invalid command {0:?}, expected ON or OFF")]
    InvalidCommand(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
