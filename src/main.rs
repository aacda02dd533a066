use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use relaywatch::admin::BrokerAdmin;
use relaywatch::command::{CommandDispatcher, DevicePowerService};
use relaywatch::config::AppConfig;
use relaywatch::credentials::CredentialCodec;
use relaywatch::fleet::{DeviceStateTracker, TopicRouter};
use relaywatch::mqtt::{
    ConnectionState, ConnectionSupervisor, RumqttConnector, SharedSession, SupervisorContext,
    SupervisorHandle, SupervisorSettings,
};
use relaywatch::persistence::seed::seed_store;
use relaywatch::persistence::{DeviceId, InMemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Supervises the MQTT session of a Tasmota relay fleet.
#[derive(Parser, Debug)]
#[command(name = "relaywatch", version, about)]
struct Cli {
    /// Config file (defaults to <config dir>/relaywatch/relaywatch.toml)
    #[arg(short, long, global = true, env = "RELAYWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the broker session alive until SIGINT/SIGTERM (default)
    Run,
    /// Open and close one session against the configured broker
    Probe,
    /// Switch one relay once the session is up
    Power {
        device_id: DeviceId,
        /// ON or OFF
        state: String,
        #[arg(long, default_value = "cli")]
        issuer: String,
    },
    /// Print the stored form of a broker password
    EncryptPassword { plaintext: String },
}

/// Everything built from the config file, shared by the subcommands
struct Services {
    config: AppConfig,
    store: Arc<InMemoryStore>,
    codec: Arc<CredentialCodec>,
    connector: Arc<RumqttConnector>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_error_reporting()?;

    let config = AppConfig::load(cli.config.as_deref()).await?;
    setup_logging_env(config.service.log_level()?);
    debug!("Service settings: {:?}", config.service);

    match cli.command.unwrap_or(Command::Run) {
        Command::EncryptPassword { plaintext } => {
            let codec = CredentialCodec::new(config.encryption_key()?);
            println!("{}", codec.encrypt(&plaintext));
            Ok(())
        }
        Command::Run => run(build_services(config).await?).await,
        Command::Probe => probe(build_services(config).await?).await,
        Command::Power {
            device_id,
            state,
            issuer,
        } => power(build_services(config).await?, device_id, &state, &issuer).await,
    }
}

fn setup_error_reporting() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn build_services(config: AppConfig) -> Result<Services> {
    let codec = Arc::new(CredentialCodec::new(config.encryption_key()?));

    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_store(&store, &config)
        .await
        .map_err(|e| eyre!("Failed to seed store: {}", e))?;
    info!("Seeded {} devices", seeded);

    Ok(Services {
        config,
        store,
        codec,
        connector: Arc::new(RumqttConnector::new()),
    })
}

fn spawn_supervisor(services: &Services, session: Arc<SharedSession>) -> SupervisorHandle {
    let tracker = Arc::new(DeviceStateTracker::new(services.store.clone()));
    let router = Arc::new(TopicRouter::new(
        tracker,
        services.store.clone(),
        services.store.clone(),
    ));

    let supervisor = ConnectionSupervisor::create(SupervisorContext {
        connector: services.connector.clone(),
        session,
        brokers: services.store.clone(),
        router,
        codec: services.codec.clone(),
        settings: SupervisorSettings::from_service(&services.config.service),
    });
    SupervisorHandle::spawn(supervisor, CancellationToken::new())
}

async fn run(services: Services) -> Result<()> {
    let session = Arc::new(SharedSession::new());
    let mut handle = spawn_supervisor(&services, session.clone());
    let token = handle.shutdown_token();

    let mut states = session.watch_state();
    let watcher_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watcher_token.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("Session state: {}", *states.borrow_and_update());
                }
            }
        }
    });

    wait_for_signal(token).await;
    handle
        .shutdown()
        .await
        .map_err(|e| eyre!("Failed to stop supervisor: {}", e))?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal(token: CancellationToken) {
    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(err) => {
                error!("Error setting up signal handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    {
        let sigterm_token = token.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM signal");
                    sigterm_token.cancel();
                }
                Err(err) => error!("Error setting up SIGTERM handler: {}", err),
            }
        });
    }

    token.cancelled().await;
}

async fn probe(services: Services) -> Result<()> {
    let admin = BrokerAdmin::new(
        services.store.clone(),
        services.codec.clone(),
        services.connector.clone(),
        services.config.service.connect_timeout(),
        services.config.service.keepalive(),
    );

    let outcome = admin
        .test_connection()
        .await
        .map_err(|e| eyre!("Connection test failed: {}", e))?;
    println!("{}", outcome.message);
    if outcome.connected {
        Ok(())
    } else {
        Err(eyre!("Broker unreachable"))
    }
}

async fn power(services: Services, device_id: DeviceId, state: &str, issuer: &str) -> Result<()> {
    let session = Arc::new(SharedSession::new());
    let mut handle = spawn_supervisor(&services, session.clone());

    let dispatcher = Arc::new(CommandDispatcher::new(
        session.clone(),
        services.store.clone(),
        services.store.clone(),
        services.config.service.publish_timeout(),
    ));
    let power = DevicePowerService::new(services.store.clone(), dispatcher);

    let wait = services.config.service.connect_timeout() + Duration::from_secs(1);
    let mut states = session.watch_state();
    if tokio::time::timeout(wait, states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .is_err()
    {
        warn!("Session not up after {}s, sending anyway", wait.as_secs());
    }

    let result = power.toggle_power(device_id, state, issuer).await;

    handle
        .shutdown()
        .await
        .map_err(|e| eyre!("Failed to stop supervisor: {}", e))?;

    let receipt = result.map_err(|e| eyre!("Power command failed: {}", e))?;
    println!("{}", receipt.message);
    Ok(())
}
