//! Command-line interface for the BlueServo controller.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use blueservo_core::config::{env_vars, TransportKind};
use blueservo_core::{
    ActuatorState, EventBus, EventBusReceiver, ServoConfig, ServoEvent, StateStore,
};
use blueservo_devices::{MockTransport, SessionConfig, SessionManager, Transport};
use blueservo_sync::{QueueListener, StateReconciler};
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// BlueServo - keep a Bluetooth LE servo in sync with its recorded state.
#[derive(Parser, Debug)]
#[command(name = "blueservo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ./blueservo.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the servo to a state and print what it reports.
    Set {
        /// Desired state (on or off).
        state: ActuatorState,
    },
    /// Print the last recorded state.
    State,
    /// Queue a desired state for a running listener.
    Request {
        /// Desired state (on or off).
        state: ActuatorState,
    },
    /// Apply queued requests until interrupted.
    Listen,
    /// Print recorded states, newest first.
    History {
        /// Maximum number of records.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config =
        ServoConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Set { state } => run_set(&config, state).await,
        Command::State => run_state(&config).await,
        Command::Request { state } => run_request(&config, state).await,
        Command::Listen => run_listen(&config).await,
        Command::History { limit } => run_history(&config, limit).await,
    }
}

const LOG_TARGETS: &[&str] = &[
    "blueservo",
    "blueservo_core",
    "blueservo_devices",
    "blueservo_storage",
    "blueservo_sync",
];

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = LOG_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, level))
            .collect::<Vec<_>>()
            .join(",");
        tracing_subscriber::EnvFilter::new(directives).add_directive(tracing::Level::WARN.into())
    });

    // Logs go to stderr; stdout carries command output
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Everything needed to talk to the servo.
struct Controller {
    sessions: SessionManager,
    reconciler: Arc<StateReconciler>,
    event_bus: EventBus,
}

async fn build_transport(config: &ServoConfig) -> Result<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Simulated => {
            info!("Using simulated servo");
            Ok(Arc::new(MockTransport::simulated(
                config.device.peripheral_id.clone(),
            )))
        }
        TransportKind::Ble => build_ble_transport().await,
    }
}

#[cfg(feature = "ble")]
async fn build_ble_transport() -> Result<Arc<dyn Transport>> {
    let transport = blueservo_devices::BleTransport::new()
        .await
        .context("Failed to initialize Bluetooth adapter")?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "ble"))]
async fn build_ble_transport() -> Result<Arc<dyn Transport>> {
    anyhow::bail!(
        "this build has no Bluetooth support; rebuild with `--features ble` or set {}=simulated",
        env_vars::TRANSPORT
    )
}

fn open_store(config: &ServoConfig) -> Result<Arc<dyn StateStore>> {
    blueservo_storage::open_store(&config.storage).with_context(|| {
        format!(
            "Failed to open {:?} store at {}",
            config.storage.backend,
            config.storage.path.display()
        )
    })
}

async fn build_controller(config: &ServoConfig) -> Result<Controller> {
    let store = open_store(config)?;
    let transport = build_transport(config).await?;
    let event_bus = EventBus::new();
    let sessions = SessionManager::with_event_bus(
        transport,
        SessionConfig::from_config(config),
        event_bus.clone(),
    );
    let reconciler = Arc::new(
        StateReconciler::from_config(store, sessions.clone(), config)
            .with_event_bus(event_bus.clone()),
    );
    Ok(Controller {
        sessions,
        reconciler,
        event_bus,
    })
}

async fn run_set(config: &ServoConfig, desired: ActuatorState) -> Result<()> {
    let controller = build_controller(config).await?;

    let result = tokio::select! {
        result = controller.reconciler.reconcile(desired) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, disconnecting");
            controller.sessions.shutdown().await;
            anyhow::bail!("interrupted");
        }
    };

    controller.sessions.shutdown().await;
    let observed = result.with_context(|| format!("Failed to set servo {}", desired))?;
    println!("{}", observed);
    Ok(())
}

async fn run_state(config: &ServoConfig) -> Result<()> {
    let store = open_store(config)?;
    match store.last_known_state().await? {
        Some(state) => println!("{}", state),
        None => println!("unknown"),
    }
    Ok(())
}

async fn run_request(config: &ServoConfig, desired: ActuatorState) -> Result<()> {
    let store = open_store(config)?;
    store.submit_request(desired).await?;
    println!("queued {}", desired);
    Ok(())
}

async fn run_listen(config: &ServoConfig) -> Result<()> {
    let controller = build_controller(config).await?;
    let (stop_events, events_stopped) = oneshot::channel();
    let events = tokio::spawn(tally_events(
        controller.event_bus.subscribe(),
        events_stopped,
    ));
    let handle = QueueListener::new(controller.reconciler.clone()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let stats = handle.stop().await;
    controller.sessions.shutdown().await;
    let _ = stop_events.send(());
    let tally = events.await.unwrap_or_default();
    info!(
        delivered = stats.delivered,
        applied = stats.applied,
        failed = stats.failed,
        sessions = tally.sessions,
        state_changes = tally.state_changes,
        "Listener finished"
    );
    Ok(())
}

/// What the listener did, as seen on the event bus.
#[derive(Debug, Default)]
struct EventTally {
    sessions: u64,
    state_changes: u64,
}

/// Log state transitions and count sessions until told to stop.
async fn tally_events(
    mut events: EventBusReceiver,
    mut stopped: oneshot::Receiver<()>,
) -> EventTally {
    let mut tally = EventTally::default();
    loop {
        // Events already published are drained before stopping
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut stopped => break,
        };
        match event {
            ServoEvent::SessionEstablished { .. } => tally.sessions += 1,
            ServoEvent::StateChanged {
                previous, observed, ..
            } => {
                tally.state_changes += 1;
                let previous = previous.map_or_else(|| "unknown".to_string(), |s| s.to_string());
                info!("Servo state changed: {} -> {}", previous, observed);
            }
            other => debug!(event = other.type_name(), "Event"),
        }
    }
    tally
}

async fn run_history(config: &ServoConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    for record in store.history(limit).await? {
        let when = chrono::DateTime::from_timestamp_millis(record.created_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| record.created_at.to_string());
        println!("{}\t{}", when, record.state);
    }
    Ok(())
}
