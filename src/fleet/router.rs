use super::tracker::{DeviceStateTracker, UpdateOutcome};
use crate::mqtt::message_manager::payload_text;
use crate::mqtt::topic::parse_topic;
use crate::persistence::{
    AuditLog, DeviceId, DeviceRepository, DeviceStatus, Direction, MessageKind, MessageLogEntry,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Device mutation implied by a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub status: DeviceStatus,
    pub payload: Option<Vec<u8>>,
}

/// How an inbound message is recorded and what it does to its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: MessageKind,
    pub mutation: Option<Mutation>,
}

/// Maps the last topic segment and payload to a message kind and device mutation.
///
/// - `LWT`: `online` in any letter case means online, everything else offline;
///   the payload is not stored
/// - `STATE`: online, payload stored
/// - `RESULT`, `POWER`, `POWER1`, `POWER2`: online, payload stored
/// - anything else: `OTHER`, no mutation
pub fn classify(kind: &str, payload: &[u8]) -> Classification {
    match kind {
        "LWT" => {
            let status = if payload_text(payload).eq_ignore_ascii_case("online") {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            };
            Classification {
                kind: MessageKind::Lwt,
                mutation: Some(Mutation {
                    status,
                    payload: None,
                }),
            }
        }
        "STATE" => Classification {
            kind: MessageKind::State,
            mutation: Some(Mutation {
                status: DeviceStatus::Online,
                payload: Some(payload.to_vec()),
            }),
        },
        "RESULT" | "POWER" | "POWER1" | "POWER2" => Classification {
            kind: MessageKind::CommandResult,
            mutation: Some(Mutation {
                status: DeviceStatus::Online,
                payload: Some(payload.to_vec()),
            }),
        },
        _ => Classification {
            kind: MessageKind::Other,
            mutation: None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Topic did not have three segments; dropped
    Malformed,
    Routed {
        kind: MessageKind,
        device_id: Option<DeviceId>,
    },
}

/// Entry point for every inbound bus message
pub struct TopicRouter {
    tracker: Arc<DeviceStateTracker>,
    devices: Arc<dyn DeviceRepository>,
    audit: Arc<dyn AuditLog>,
}

impl TopicRouter {
    pub fn new(
        tracker: Arc<DeviceStateTracker>,
        devices: Arc<dyn DeviceRepository>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            tracker,
            devices,
            audit,
        }
    }

    /// Classifies one message, applies its device mutation and writes exactly
    /// one inbound audit entry. Never fails: store errors are logged.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let text = payload_text(payload);
        info!("Received: {} -> {}", topic, text);

        let parsed = match parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping message: {}", e);
                return RouteOutcome::Malformed;
            }
        };

        let classification = classify(parsed.kind, payload);
        debug!("Classified {} as {}", topic, classification.kind);

        let device_id = match classification.mutation {
            Some(mutation) => {
                match self
                    .tracker
                    .update_status(parsed.bus_id, mutation.status, mutation.payload)
                    .await
                {
                    Ok(UpdateOutcome::Updated { device_id }) => Some(device_id),
                    Ok(UpdateOutcome::DeviceNotFound) => None,
                    Err(e) => {
                        error!("Failed to update status of {}: {}", parsed.bus_id, e);
                        self.lookup_device(parsed.bus_id).await
                    }
                }
            }
            None => self.lookup_device(parsed.bus_id).await,
        };

        let entry = MessageLogEntry {
            device_id,
            topic: topic.to_string(),
            payload: text,
            kind: classification.kind,
            direction: Direction::In,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.audit.append_message(entry).await {
            error!("Failed to record inbound message on {}: {}", topic, e);
        }

        RouteOutcome::Routed {
            kind: classification.kind,
            device_id,
        }
    }

    async fn lookup_device(&self, bus_id: &str) -> Option<DeviceId> {
        match self.devices.find_by_bus_id(bus_id).await {
            Ok(device) => device.map(|d| d.id),
            Err(e) => {
                error!("Failed to look up device {}: {}", bus_id, e);
                None
            }
        }
    }
}
