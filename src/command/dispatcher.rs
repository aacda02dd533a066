use super::DispatchError;
use crate::mqtt::session::{BusSession, ConnectionState, SessionError};
use crate::mqtt::topic::command_topic;
use crate::persistence::{
    AuditLog, CommandLogEntry, DeviceId, DeviceRepository, Direction, MessageKind,
    MessageLogEntry,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A command that reached the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub device_id: DeviceId,
    pub topic: String,
    pub command: String,
    pub message: String,
    pub issued_at: DateTime<Utc>,
}

/// Publishes power commands and records every attempt.
///
/// No queueing and no retry: when the session is not connected the command
/// fails immediately. Identical commands are independent audit events.
pub struct CommandDispatcher {
    session: Arc<dyn BusSession>,
    devices: Arc<dyn DeviceRepository>,
    audit: Arc<dyn AuditLog>,
    publish_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        session: Arc<dyn BusSession>,
        devices: Arc<dyn DeviceRepository>,
        audit: Arc<dyn AuditLog>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            session,
            devices,
            audit,
            publish_timeout,
        }
    }

    /// Sends `command` to `cmnd/<bus_id>/POWER`.
    ///
    /// An unknown bus identifier fails with [`DispatchError::DeviceNotFound`]
    /// and writes nothing. Otherwise exactly one command log entry and one
    /// outbound message log entry are written, whatever the outcome.
    pub async fn publish(
        &self,
        bus_id: &str,
        command: &str,
        issuer: &str,
    ) -> Result<CommandReceipt, DispatchError> {
        let Some(device) = self.devices.find_by_bus_id(bus_id).await? else {
            warn!("Command {} for unknown device {} rejected", command, bus_id);
            return Err(DispatchError::DeviceNotFound(bus_id.to_string()));
        };

        let topic = command_topic(bus_id);
        let outcome = self.send(&topic, command).await;
        let issued_at = Utc::now();

        let message = match &outcome {
            Ok(()) => format!("Command {} sent to {}", command, device.name),
            Err(e) => e.to_string(),
        };
        match &outcome {
            Ok(()) => info!("PUBLISH: {} -> {} (issuer {})", topic, command, issuer),
            Err(e) => warn!("PUBLISH failed: {} -> {}: {}", topic, command, e),
        }

        self.record(
            CommandLogEntry {
                device_id: device.id,
                issuer: issuer.to_string(),
                command: command.to_string(),
                success: outcome.is_ok(),
                message: message.clone(),
                timestamp: issued_at,
            },
            MessageLogEntry {
                device_id: Some(device.id),
                topic: topic.clone(),
                payload: command.to_string(),
                kind: MessageKind::Command,
                direction: Direction::Out,
                timestamp: issued_at,
            },
        )
        .await;

        outcome.map(|()| CommandReceipt {
            device_id: device.id,
            topic,
            command: command.to_string(),
            message,
            issued_at,
        })
    }

    async fn send(&self, topic: &str, command: &str) -> Result<(), DispatchError> {
        if self.session.state() != ConnectionState::Connected {
            return Err(DispatchError::BrokerUnavailable);
        }

        match tokio::time::timeout(self.publish_timeout, self.session.publish(topic, command.as_bytes()))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SessionError::NotConnected)) => Err(DispatchError::BrokerUnavailable),
            Ok(Err(e)) => Err(DispatchError::PublishFailed(e.to_string())),
            Err(_) => Err(DispatchError::PublishTimeout(self.publish_timeout)),
        }
    }

    async fn record(&self, command: CommandLogEntry, message: MessageLogEntry) {
        if let Err(e) = self.audit.append_command(command).await {
            error!("Failed to record command log entry: {}", e);
        }
        if let Err(e) = self.audit.append_message(message).await {
            error!("Failed to record outbound message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::session::MockBusSession;
    use crate::persistence::{Device, DeviceStatus, MockAuditLog, MockDeviceRepository};

    fn device() -> Device {
        Device {
            id: 7,
            name: "Sala".to_string(),
            mac_address: "AA:BB:CC:DD:EE:01".to_string(),
            bus_id: "tasmota_sala_luz".to_string(),
            ip_address: None,
            status: DeviceStatus::Online,
            last_seen: None,
            last_payload: None,
            created_at: Utc::now(),
        }
    }

    fn known_device() -> MockDeviceRepository {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_find_by_bus_id()
            .returning(|_| Ok(Some(device())));
        devices
    }

    fn dispatcher(session: MockBusSession, devices: MockDeviceRepository, audit: MockAuditLog) -> CommandDispatcher {
        CommandDispatcher::new(
            Arc::new(session),
            Arc::new(devices),
            Arc::new(audit),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_unknown_device_writes_nothing() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_find_by_bus_id().returning(|_| Ok(None));
        let mut session = MockBusSession::new();
        session.expect_publish().times(0);
        let mut audit = MockAuditLog::new();
        audit.expect_append_command().times(0);
        audit.expect_append_message().times(0);

        let err = dispatcher(session, devices, audit)
            .publish("tasmota_missing", "ON", "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeviceNotFound(id) if id == "tasmota_missing"));
    }

    #[tokio::test]
    async fn test_disconnected_fails_fast_with_one_audit_pair() {
        let mut session = MockBusSession::new();
        session
            .expect_state()
            .returning(|| ConnectionState::Disconnected);
        session.expect_publish().times(0);

        let mut audit = MockAuditLog::new();
        audit
            .expect_append_command()
            .withf(|entry: &CommandLogEntry| {
                !entry.success && entry.command == "ON" && entry.issuer == "admin" && entry.device_id == 7
            })
            .times(1)
            .returning(|_| Ok(()));
        audit
            .expect_append_message()
            .withf(|entry: &MessageLogEntry| {
                entry.direction == Direction::Out
                    && entry.kind == MessageKind::Command
                    && entry.topic == "cmnd/tasmota_sala_luz/POWER"
            })
            .times(1)
            .returning(|_| Ok(()));

        let err = dispatcher(session, known_device(), audit)
            .publish("tasmota_sala_luz", "ON", "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BrokerUnavailable));
    }

    #[tokio::test]
    async fn test_connected_publish_succeeds() {
        let mut session = MockBusSession::new();
        session.expect_state().returning(|| ConnectionState::Connected);
        session
            .expect_publish()
            .withf(|topic: &str, payload: &[u8]| topic == "cmnd/tasmota_sala_luz/POWER" && payload == b"OFF")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut audit = MockAuditLog::new();
        audit
            .expect_append_command()
            .withf(|entry: &CommandLogEntry| entry.success && entry.message == "Command OFF sent to Sala")
            .times(1)
            .returning(|_| Ok(()));
        audit.expect_append_message().times(1).returning(|_| Ok(()));

        let receipt = dispatcher(session, known_device(), audit)
            .publish("tasmota_sala_luz", "OFF", "admin")
            .await
            .unwrap();
        assert_eq!(receipt.topic, "cmnd/tasmota_sala_luz/POWER");
        assert_eq!(receipt.device_id, 7);
        assert_eq!(receipt.message, "Command OFF sent to Sala");
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported_and_audited() {
        let mut session = MockBusSession::new();
        session.expect_state().returning(|| ConnectionState::Connected);
        session
            .expect_publish()
            .returning(|_, _| Err(SessionError::Request("request channel closed".to_string())));

        let mut audit = MockAuditLog::new();
        audit
            .expect_append_command()
            .withf(|entry: &CommandLogEntry| !entry.success && entry.message.contains("request channel closed"))
            .times(1)
            .returning(|_| Ok(()));
        audit.expect_append_message().times(1).returning(|_| Ok(()));

        let err = dispatcher(session, known_device(), audit)
            .publish("tasmota_sala_luz", "ON", "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PublishFailed(_)));
    }

    #[tokio::test]
    async fn test_repeated_commands_are_independent() {
        let mut session = MockBusSession::new();
        session.expect_state().returning(|| ConnectionState::Connected);
        session.expect_publish().times(3).returning(|_, _| Ok(()));

        let mut audit = MockAuditLog::new();
        audit.expect_append_command().times(3).returning(|_| Ok(()));
        audit.expect_append_message().times(3).returning(|_| Ok(()));

        let dispatcher = dispatcher(session, known_device(), audit);
        for _ in 0..3 {
            let _ = dispatcher.publish("tasmota_sala_luz", "ON", "admin").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_mask_outcome() {
        let mut session = MockBusSession::new();
        session.expect_state().returning(|| ConnectionState::Connected);
        session.expect_publish().returning(|_, _| Ok(()));

        let mut audit = MockAuditLog::new();
        audit
            .expect_append_command()
            .returning(|_| Err(crate::persistence::StoreError::Unavailable("disk full".to_string())));
        audit.expect_append_message().times(1).returning(|_| Ok(()));

        let receipt = dispatcher(session, known_device(), audit)
            .publish("tasmota_sala_luz", "ON", "admin")
            .await;
        assert!(receipt.is_ok());
    }
}
