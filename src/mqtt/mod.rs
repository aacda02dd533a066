//! # MQTT Integration Module
//!
//! Broker session plumbing for the relay fleet: the connection supervisor that
//! keeps one session alive, the shared session handle both directions use, and
//! the rumqttc client behind them.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Per-attempt connection parameters
//! ├── message_manager.rs  - Inbound message representation
//! ├── mqtt_handler.rs     - rumqttc connector, publisher and event source
//! ├── session.rs          - Session traits and the shared session slot
//! ├── supervisor.rs       - Connection state machine and reconnect loop
//! └── topic.rs            - Topic parsing and the subscribed filter set
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! ConnectionSupervisor ──connect──► broker
//!        │  attach/detach                │ inbound publishes
//!        ▼                               ▼
//!  SharedSession ◄──publish── CommandDispatcher     TopicRouter
//! ```

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod session;
pub mod supervisor;
pub mod topic;

pub use mqtt_handler::RumqttConnector;
pub use session::{BusSession, ConnectionState, Connector, SessionError, SharedSession};
pub use supervisor::{
    ConnectionSupervisor, SupervisorContext, SupervisorError, SupervisorHandle, SupervisorSettings,
};
