//! rumqttc-backed implementation of the session traits.

use super::config::{ConnectParams, MIN_KEEP_ALIVE};
use super::message_manager::BusMessage;
use super::session::{Connector, EventSource, Link, Publisher, SessionError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Request queue depth between the client handle and the event loop
const REQUEST_CAPACITY: usize = 100;

/// Opens sessions with a real MQTT CONNECT/CONNACK handshake
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn options(params: &ConnectParams) -> MqttOptions {
        let mut options = MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);
        options
            .set_keep_alive(params.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_session(true);

        if let Some(username) = params.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(username, params.password.clone().unwrap_or_default());
        }
        if params.tls_enabled {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl Connector for RumqttConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Link, SessionError> {
        let (client, mut eventloop) = AsyncClient::new(Self::options(params), REQUEST_CAPACITY);

        // The event loop dials lazily; drive it until the broker answers.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(SessionError::Handshake(format!("{:?}", ack.code)));
                    }
                    info!("Handshake with {} completed", params.endpoint());
                    break;
                }
                Ok(event) => debug!("Pre-handshake event: {:?}", event),
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            }
        }

        Ok(Link {
            publisher: Arc::new(RumqttPublisher { client }),
            events: Box::new(RumqttEvents { eventloop }),
        })
    }
}

struct RumqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for RumqttPublisher {
    async fn subscribe(&self, filter: &str) -> Result<(), SessionError> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))
    }
}

struct RumqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl EventSource for RumqttEvents {
    async fn next_event(&mut self) -> Result<Option<BusMessage>, SessionError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(Some(BusMessage::from_topic(
                publish.topic,
                publish.payload.to_vec(),
            ))),
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
                Ok(None)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => Err(SessionError::Closed),
            Ok(_) => Ok(None),
            Err(e) => Err(SessionError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> ConnectParams {
        ConnectParams {
            host: "broker.lan".to_string(),
            port: 1883,
            client_id: "iot_server".to_string(),
            username: Some("relay".to_string()),
            password: Some("secret".to_string()),
            tls_enabled: false,
            keep_alive: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_options_carry_endpoint_and_credentials() {
        let options = RumqttConnector::options(&params());
        assert_eq!(options.broker_address(), ("broker.lan".to_string(), 1883));
        assert_eq!(options.client_id(), "iot_server");
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
        assert_eq!(
            options.credentials(),
            Some(("relay".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_empty_username_sends_no_credentials() {
        let mut params = params();
        params.username = Some(String::new());
        let options = RumqttConnector::options(&params);
        assert!(options.credentials().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let mut params = params();
        params.host = "127.0.0.1".to_string();
        params.port = 1;
        let result = RumqttConnector::new().connect(&params).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
    }
}
