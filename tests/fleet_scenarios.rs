use async_trait::async_trait;
use relaywatch::command::{CommandDispatcher, DispatchError};
use relaywatch::credentials::{CredentialCodec, EncryptionKey};
use relaywatch::fleet::{DeviceStateTracker, RouteOutcome, TopicRouter};
use relaywatch::mqtt::config::ConnectParams;
use relaywatch::mqtt::message_manager::BusMessage;
use relaywatch::mqtt::session::{EventSource, Link, Publisher};
use relaywatch::mqtt::{
    BusSession, ConnectionState, ConnectionSupervisor, Connector, SessionError, SharedSession,
    SupervisorContext, SupervisorHandle, SupervisorSettings,
};
use relaywatch::persistence::{
    AuditLog, BrokerConfigRepository, BrokerConnection, DeviceRepository, DeviceStatus, Direction,
    InMemoryStore, MessageKind, NewDevice,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn fleet() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for (name, mac, bus_id) in [
        ("Sala", "AA:BB:CC:DD:EE:01", "tasmota_sala_luz"),
        ("Cozinha", "AA:BB:CC:DD:EE:02", "tasmota_cozinha"),
    ] {
        let _ = store
            .register_device(NewDevice {
                name: name.to_string(),
                mac_address: mac.to_string(),
                bus_id: bus_id.to_string(),
                ip_address: None,
            })
            .await
            .unwrap();
    }
    store
}

fn router(store: &Arc<InMemoryStore>) -> TopicRouter {
    let tracker = Arc::new(DeviceStateTracker::new(store.clone()));
    TopicRouter::new(tracker, store.clone(), store.clone())
}

fn dispatcher(store: &Arc<InMemoryStore>, session: Arc<dyn BusSession>) -> CommandDispatcher {
    CommandDispatcher::new(session, store.clone(), store.clone(), Duration::from_secs(5))
}

#[tokio::test]
async fn lwt_online_marks_device_online() {
    let store = fleet().await;
    let router = router(&store);

    let outcome = router.route("tele/tasmota_sala_luz/LWT", b"Online").await;
    assert!(matches!(outcome, RouteOutcome::Routed { kind: MessageKind::Lwt, device_id: Some(_) }));

    let device = store.find_by_bus_id("tasmota_sala_luz").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert!(device.last_seen.is_some());
    assert!(device.last_payload.is_none());

    let messages = store.recent_messages(10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::Lwt);
    assert_eq!(messages[0].direction, Direction::In);
    assert_eq!(messages[0].device_id, Some(device.id));
}

#[tokio::test]
async fn lwt_offline_then_state_payload() {
    let store = fleet().await;
    let router = router(&store);

    let _ = router.route("tele/tasmota_cozinha/LWT", b"Offline").await;
    let device = store.find_by_bus_id("tasmota_cozinha").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);

    let state = br#"{"POWER":"ON","Wifi":{"RSSI":70}}"#;
    let _ = router.route("tele/tasmota_cozinha/STATE", state).await;
    let device = store.find_by_bus_id("tasmota_cozinha").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert_eq!(device.last_payload.as_deref(), Some(&state[..]));

    let _ = router.route("tele/tasmota_cozinha/LWT", b"Offline").await;
    let device = store.find_by_bus_id("tasmota_cozinha").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);
    assert_eq!(device.last_payload.as_deref(), Some(&state[..]));
}

#[tokio::test]
async fn unknown_bus_id_leaves_devices_untouched() {
    let store = fleet().await;
    let before = store.list().await.unwrap();

    let _ = router(&store).route("tele/tasmota_garagem/LWT", b"Online").await;

    assert_eq!(store.list().await.unwrap(), before);
    let messages = store.recent_messages(10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].device_id, None);
}

#[tokio::test]
async fn command_to_unknown_device_writes_nothing() {
    let store = fleet().await;
    let session: Arc<dyn BusSession> = Arc::new(SharedSession::new());

    let err = dispatcher(&store, session)
        .publish("tasmota_missing", "ON", "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::DeviceNotFound(_)));
    assert!(store.recent_commands(10).await.unwrap().is_empty());
    assert!(store.recent_messages(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn command_while_disconnected_is_audited_as_failure() {
    let store = fleet().await;
    let session: Arc<dyn BusSession> = Arc::new(SharedSession::new());

    let err = dispatcher(&store, session)
        .publish("tasmota_sala_luz", "ON", "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::BrokerUnavailable));

    let commands = store.recent_commands(10).await.unwrap();
    assert_eq!(commands.len(), 1);
    assert!(!commands[0].success);
    assert_eq!(commands[0].command, "ON");

    let messages = store.recent_messages(10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].direction, Direction::Out);
    assert_eq!(messages[0].kind, MessageKind::Command);
    assert_eq!(messages[0].topic, "cmnd/tasmota_sala_luz/POWER");
}

#[test]
fn stored_password_round_trips() {
    let codec = CredentialCodec::new(EncryptionKey::derive("fleet-secret"));
    let stored = codec.encrypt("hunter2");
    assert_ne!(stored, "hunter2");
    assert_eq!(codec.decrypt(&stored).unwrap(), "hunter2");

    let other = CredentialCodec::new(EncryptionKey::derive("another-secret"));
    assert!(other.decrypt(&stored).is_err());
}

/// Broker double: every session replays the same inbound messages, then idles
struct FakeBroker {
    inbound: Vec<(&'static str, &'static [u8])>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

struct FakePublisher {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn subscribe(&self, _filter: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct FakeEvents {
    queue: VecDeque<BusMessage>,
}

#[async_trait]
impl EventSource for FakeEvents {
    async fn next_event(&mut self) -> Result<Option<BusMessage>, SessionError> {
        match self.queue.pop_front() {
            Some(message) => Ok(Some(message)),
            None => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(&self, _params: &ConnectParams) -> Result<Link, SessionError> {
        let queue = self
            .inbound
            .iter()
            .map(|(topic, payload)| BusMessage::from_topic(*topic, payload.to_vec()))
            .collect();
        Ok(Link {
            publisher: Arc::new(FakePublisher {
                published: self.published.clone(),
            }),
            events: Box::new(FakeEvents { queue }),
        })
    }
}

#[tokio::test]
async fn supervised_session_routes_and_dispatches() {
    let store = fleet().await;
    store
        .save(BrokerConnection {
            host: "broker.lan".to_string(),
            port: 1883,
            username: None,
            encrypted_password: None,
            tls_enabled: false,
            client_id: "iot_server".to_string(),
            connected: false,
            last_connected_at: None,
        })
        .await
        .unwrap();

    let published = Arc::new(Mutex::new(Vec::new()));
    let session = Arc::new(SharedSession::new());
    let supervisor = ConnectionSupervisor::create(SupervisorContext {
        connector: Arc::new(FakeBroker {
            inbound: vec![("tele/tasmota_sala_luz/LWT", &b"Online"[..])],
            published: published.clone(),
        }),
        session: session.clone(),
        brokers: store.clone(),
        router: Arc::new(router(&store)),
        codec: Arc::new(CredentialCodec::new(EncryptionKey::derive("fleet-secret"))),
        settings: SupervisorSettings::default(),
    });
    let mut handle = SupervisorHandle::spawn(supervisor, CancellationToken::new());

    let mut states = session.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let device = store.find_by_bus_id("tasmota_sala_luz").await.unwrap().unwrap();
            if device.status == DeviceStatus::Online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let receipt = dispatcher(&store, session.clone())
        .publish("tasmota_sala_luz", "OFF", "admin")
        .await
        .unwrap();
    assert_eq!(receipt.message, "Command OFF sent to Sala");
    assert_eq!(
        published.lock().unwrap().clone(),
        vec![("cmnd/tasmota_sala_luz/POWER".to_string(), b"OFF".to_vec())]
    );

    handle.shutdown().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let broker = store.load().await.unwrap().unwrap();
    assert!(!broker.connected);
    assert!(broker.last_connected_at.is_some());
}
