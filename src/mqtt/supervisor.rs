//! Connection supervisor with statum state machine for the broker session
//!
//! Owns the lifecycle of the single broker session: connect, subscribe, serve
//! inbound traffic, detect failure and reconnect after a fixed delay. Every
//! transition writes an audit line carrying the broker `host:port` and
//! persists the connected flag.
//!
//! # State Machine
//!
//! ```text
//!                 tick                 handshake ok
//! Disconnected ─────────► Connecting ───────────────► Connected
//!      ▲                      │                           │
//!      │   handshake failure  │   transport error,        │
//!      └──────────────────────┴── keepalive timeout ◄─────┘
//!            (retry after fixed delay, cancellable on shutdown)
//! ```
//!
//! The reconnect delay is fixed, not exponential, and retries are unbounded.

use super::config::{ConnectParams, MIN_KEEP_ALIVE};
use super::message_manager::BusMessage;
use super::session::{ConnectionState, Connector, Link, SessionError, SharedSession};
use super::topic::SUBSCRIPTION_FILTERS;
use crate::config::ServiceConfig;
use crate::credentials::{CredentialCodec, CredentialError};
use crate::fleet::TopicRouter;
use crate::persistence::{BrokerConfigRepository, BrokerConnection, StoreError};
use chrono::Utc;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a connect attempt or a live session ended
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no broker configuration stored")]
    NotConfigured,

    #[error("broker configuration unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Credentials(#[from] CredentialError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no traffic for {0:?}, keepalive expired")]
    KeepaliveTimeout(Duration),

    #[error("shutdown requested")]
    Cancelled,

    #[error("supervisor task failed: {0}")]
    Task(String),
}

/// Timing of the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub reconnect_delay: Duration,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_service(&ServiceConfig::default())
    }
}

impl SupervisorSettings {
    pub fn from_service(service: &ServiceConfig) -> Self {
        Self {
            reconnect_delay: service.reconnect_delay(),
            keepalive: service.keepalive(),
            connect_timeout: service.connect_timeout(),
        }
    }

    /// Silence on the transport longer than this ends the session.
    ///
    /// Based on the keepalive the client actually negotiates, which is never
    /// below [`MIN_KEEP_ALIVE`].
    pub fn watchdog(&self) -> Duration {
        let keepalive = self.keepalive.max(MIN_KEEP_ALIVE);
        keepalive + keepalive / 2
    }
}

/// Collaborators injected into the supervisor
pub struct SupervisorContext {
    pub connector: Arc<dyn Connector>,
    pub session: Arc<SharedSession>,
    pub brokers: Arc<dyn BrokerConfigRepository>,
    pub router: Arc<TopicRouter>,
    pub codec: Arc<CredentialCodec>,
    pub settings: SupervisorSettings,
}

#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
}

#[machine]
pub struct ConnectionSupervisor<S: SupervisorState> {
    context: Arc<SupervisorContext>,
    endpoint: String,
    failures: u64,
}

/// How a served session ended
enum SessionEnd {
    Shutdown,
    Lost(ConnectionSupervisor<Disconnected>),
}

impl<S: SupervisorState> ConnectionSupervisor<S> {
    /// Last known `host:port`
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn record_connection(&self, connected: bool) {
        if let Err(e) = self
            .context
            .brokers
            .record_connection(connected, connected.then(Utc::now))
            .await
        {
            error!("Failed to persist connection state for {}: {}", self.endpoint, e);
        }
    }
}

impl ConnectionSupervisor<Disconnected> {
    pub fn create(context: SupervisorContext) -> Self {
        Self::new(Arc::new(context), "<unconfigured>".to_string(), 0)
    }

    /// Runs until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Connection supervisor started");
        let mut idle = self;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            idle = match idle.begin_attempt().await {
                Ok((connecting, config)) => match connecting.handshake(config, &shutdown).await {
                    Ok((connected, link)) => match connected.serve(link, &shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(disconnected) => disconnected,
                    },
                    Err(disconnected) => disconnected,
                },
                Err(disconnected) => disconnected,
            };

            if !idle.wait_before_retry(&shutdown).await {
                break;
            }
        }

        info!("Connection supervisor stopped");
    }

    /// Loads the stored broker record and moves to `Connecting`.
    ///
    /// Stays disconnected when nothing is stored or the store fails.
    async fn begin_attempt(
        mut self,
    ) -> Result<(ConnectionSupervisor<Connecting>, BrokerConnection), Self> {
        let config = match self.context.brokers.load().await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("DISCONNECTED: {}", SupervisorError::NotConfigured);
                return Err(self);
            }
            Err(e) => {
                error!("DISCONNECTED: {}", SupervisorError::Store(e));
                return Err(self);
            }
        };

        self.endpoint = config.endpoint();
        info!(
            "DISCONNECTED -> CONNECTING: no active session, dialing {} ({} consecutive failures)",
            self.endpoint, self.failures
        );
        self.context.session.set_state(ConnectionState::Connecting);
        Ok((self.transition(), config))
    }

    /// Sleeps for the reconnect delay; `false` when shutdown interrupted it
    async fn wait_before_retry(&self, shutdown: &CancellationToken) -> bool {
        let delay = self.context.settings.reconnect_delay;
        info!("Reconnecting to {} in {}s", self.endpoint, delay.as_secs());

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown during reconnect delay for {}", self.endpoint);
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl ConnectionSupervisor<Connecting> {
    async fn handshake(
        mut self,
        config: BrokerConnection,
        shutdown: &CancellationToken,
    ) -> Result<(ConnectionSupervisor<Connected>, Link), ConnectionSupervisor<Disconnected>> {
        match self.open_link(config, shutdown).await {
            Ok(link) => {
                self.context.session.attach(link.publisher.clone()).await;
                self.record_connection(true).await;
                info!("CONNECTING -> CONNECTED: session established with {}", self.endpoint);
                self.failures = 0;
                Ok((self.transition(), link))
            }
            Err(SupervisorError::Cancelled) => {
                info!("CONNECTING -> DISCONNECTED: shutdown while connecting to {}", self.endpoint);
                self.context.session.set_state(ConnectionState::Disconnected);
                Err(self.transition())
            }
            Err(e) => {
                warn!("CONNECTING -> DISCONNECTED: {} ({})", self.endpoint, e);
                self.failures += 1;
                self.context.session.set_state(ConnectionState::Disconnected);
                self.record_connection(false).await;
                Err(self.transition())
            }
        }
    }

    async fn open_link(
        &self,
        config: BrokerConnection,
        shutdown: &CancellationToken,
    ) -> Result<Link, SupervisorError> {
        let password = match config.encrypted_password.as_deref().filter(|p| !p.is_empty()) {
            Some(encrypted) => Some(self.context.codec.decrypt(encrypted)?),
            None => None,
        };

        let params = ConnectParams::from_stored(config, password, self.context.settings.keepalive);
        debug!("Connect parameters: {:?}", params);

        let timeout = self.context.settings.connect_timeout;
        tokio::select! {
            _ = shutdown.cancelled() => Err(SupervisorError::Cancelled),
            result = tokio::time::timeout(timeout, self.context.connector.connect(&params)) => {
                match result {
                    Ok(connected) => Ok(connected?),
                    Err(_) => Err(SupervisorError::HandshakeTimeout(timeout)),
                }
            }
        }
    }
}

enum Step {
    Shutdown,
    Event(Result<Result<Option<BusMessage>, SessionError>, Elapsed>),
}

impl ConnectionSupervisor<Connected> {
    async fn serve(self, mut link: Link, shutdown: &CancellationToken) -> SessionEnd {
        for filter in SUBSCRIPTION_FILTERS {
            if let Err(e) = link.publisher.subscribe(filter).await {
                link.close().await;
                return SessionEnd::Lost(self.lose(SupervisorError::Session(e)).await);
            }
            info!("Subscribed to {} on {}", filter, self.endpoint);
        }

        let watchdog = self.context.settings.watchdog();
        let reason = loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => Step::Shutdown,
                event = tokio::time::timeout(watchdog, link.events.next_event()) => Step::Event(event),
            };

            match step {
                Step::Shutdown => {
                    info!("CONNECTED -> DISCONNECTED: shutdown, closing session with {}", self.endpoint);
                    self.context.session.detach().await;
                    link.close().await;
                    self.record_connection(false).await;
                    return SessionEnd::Shutdown;
                }
                Step::Event(Ok(Ok(Some(message)))) => {
                    let _ = self.context.router.route(&message.topic, &message.payload).await;
                }
                Step::Event(Ok(Ok(None))) => {}
                Step::Event(Ok(Err(e))) => break SupervisorError::Session(e),
                Step::Event(Err(_)) => break SupervisorError::KeepaliveTimeout(watchdog),
            }
        };

        SessionEnd::Lost(self.lose(reason).await)
    }

    async fn lose(self, reason: SupervisorError) -> ConnectionSupervisor<Disconnected> {
        warn!("CONNECTED -> DISCONNECTED: {} ({})", self.endpoint, reason);
        self.context.session.detach().await;
        self.record_connection(false).await;
        self.transition()
    }
}

/// Owns the spawned supervisor task and its shutdown token
pub struct SupervisorHandle {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn spawn(supervisor: ConnectionSupervisor<Disconnected>, shutdown: CancellationToken) -> Self {
        let token = shutdown.clone();
        let task = tokio::spawn(async move { supervisor.run(token).await });
        Self {
            shutdown,
            task: Some(task),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels the supervisor and waits for the session to close
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        debug!("Sending shutdown signal to connection supervisor");
        self.shutdown.cancel();

        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                error!("Connection supervisor task failed: {}", e);
                SupervisorError::Task(e.to_string())
            }),
            None => {
                debug!("Connection supervisor already shut down");
                Ok(())
            }
        }
    }
}
