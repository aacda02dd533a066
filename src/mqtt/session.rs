//! The single broker session shared by the supervisor and the dispatcher.
//!
//! [`SharedSession`] is created once in `main` and handed to both sides
//! explicitly. The supervisor is the only writer: it attaches a [`Publisher`]
//! after a handshake and detaches it when the session ends. The dispatcher only
//! sees the narrow [`BusSession`] trait.
//!
//! Opening a session goes through [`Connector`], which yields a [`Link`]: a
//! cloneable publish half and an exclusively owned event half. The two halves
//! are independent, so outbound publishes never wait on the inbound path.

use super::config::ConnectParams;
use super::message_manager::BusMessage;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Upper bound for flushing the disconnect packet on close
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("DISCONNECTED"),
            ConnectionState::Connecting => f.write_str("CONNECTING"),
            ConnectionState::Connected => f.write_str("CONNECTED"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No active broker session")]
    NotConnected,

    #[error("Broker rejected the connection: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request could not be queued: {0}")]
    Request(String),

    /// The disconnect packet went out; the session is over
    #[error("Session closed")]
    Closed,
}

/// Outbound half of an open session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), SessionError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;
}

/// Inbound half of an open session
#[async_trait]
pub trait EventSource: Send {
    /// Next event from the transport.
    ///
    /// `Ok(None)` is protocol traffic without an application message (acks,
    /// pings); it still proves the transport is alive.
    async fn next_event(&mut self) -> Result<Option<BusMessage>, SessionError>;
}

/// Both halves of a freshly handshaken session
pub struct Link {
    pub publisher: Arc<dyn Publisher>,
    pub events: Box<dyn EventSource>,
}

impl Link {
    /// Sends a disconnect and drives the transport until it is flushed.
    ///
    /// Traffic still queued ahead of the disconnect is drained first. Gives
    /// up after [`CLOSE_FLUSH_TIMEOUT`].
    pub async fn close(mut self) {
        if let Err(e) = self.publisher.disconnect().await {
            debug!("Disconnect request failed: {}", e);
        }

        let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            loop {
                match self.events.next_event().await {
                    Ok(_) => continue,
                    Err(SessionError::Closed) => break,
                    Err(e) => {
                        debug!("Transport ended while closing: {}", e);
                        break;
                    }
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Disconnect not flushed within {:?}", CLOSE_FLUSH_TIMEOUT);
        }
    }
}

/// Opens broker sessions; implementations perform the full protocol handshake
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Link, SessionError>;
}

/// What the command path is allowed to see of the session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusSession: Send + Sync {
    fn state(&self) -> ConnectionState;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
}

/// Process-wide session slot owned by the connection supervisor
pub struct SharedSession {
    state: watch::Sender<ConnectionState>,
    publisher: RwLock<Option<Arc<dyn Publisher>>>,
}

impl Default for SharedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            publisher: RwLock::new(None),
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send_replace(state);
    }

    /// Makes a handshaken publisher available and marks the session connected
    pub(crate) async fn attach(&self, publisher: Arc<dyn Publisher>) {
        *self.publisher.write().await = Some(publisher);
        self.set_state(ConnectionState::Connected);
    }

    /// Marks the session disconnected and drops the publisher
    pub(crate) async fn detach(&self) {
        self.set_state(ConnectionState::Disconnected);
        *self.publisher.write().await = None;
    }
}

#[async_trait]
impl BusSession for SharedSession {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let publisher = self
            .publisher
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)?;
        publisher.publish(topic, payload).await
    }
}
