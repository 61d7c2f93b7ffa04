//! State reconciler.
//!
//! Compares a desired state with the last state the store knows about and,
//! only when they differ, drives the device through one command exchange.
//! The state the device reports back is what gets recorded, not the state
//! that was asked for.

use std::sync::Arc;
use std::time::Duration;

use blueservo_core::config::SyncConfig;
use blueservo_core::{
    now_millis, ActuatorState, EventBus, Result, ServoConfig, ServoEvent, StateRecord, StateStore,
};
use blueservo_devices::{protocol, SessionManager};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct StateReconciler {
    store: Arc<dyn StateStore>,
    sessions: SessionManager,
    config: SyncConfig,
    notify_timeout: Duration,
    event_bus: Option<EventBus>,
    /// Serializes actuation
    lock: Mutex<()>,
}

impl StateReconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        sessions: SessionManager,
        config: SyncConfig,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            config,
            notify_timeout,
            event_bus: None,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(
        store: Arc<dyn StateStore>,
        sessions: SessionManager,
        config: &ServoConfig,
    ) -> Self {
        Self::new(store, sessions, config.sync.clone(), config.timeouts.notify())
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.event_bus.as_ref()
    }

    /// Bring the servo to `desired` and return the state it reports.
    ///
    /// Returns without touching the device when the store already holds
    /// `desired`. Failures are not retried.
    pub async fn reconcile(&self, desired: ActuatorState) -> Result<ActuatorState> {
        let _guard = self.lock.lock().await;

        let result = self.reconcile_locked(desired).await;
        if let Err(e) = &result {
            warn!(%desired, error = %e, kind = e.kind(), "Reconcile failed");
            self.publish(ServoEvent::ReconcileFailed {
                desired,
                error: e.to_string(),
                timestamp: now_millis(),
            });
        }
        result
    }

    async fn reconcile_locked(&self, desired: ActuatorState) -> Result<ActuatorState> {
        let last_known = self.store.last_known_state().await?;
        debug!(?last_known, %desired, "Reconciling");

        match last_known {
            Some(state) if state == desired => {
                info!("Servo already {}, nothing to do", state);
                return Ok(self.skip(state));
            }
            None if self.config.assume_absent_satisfied => {
                info!("No recorded state, assuming {}", desired);
                return Ok(self.skip(desired));
            }
            _ => {}
        }

        let session = self.sessions.acquire_session().await?;
        let observed = match protocol::exchange(&session, desired, self.notify_timeout).await {
            Ok(observed) => observed,
            Err(e) => {
                self.sessions.invalidate(&session, &e.to_string()).await;
                return Err(e);
            }
        };

        if observed != desired {
            warn!(%desired, %observed, "Device reports a different state than requested");
        }

        match self.store.record_state(observed).await {
            Ok(_) => debug!(%observed, "Recorded observed state"),
            Err(e) => {
                warn!(%observed, error = %e, "Failed to record observed state");
                self.publish(ServoEvent::RecordFailed {
                    state: observed,
                    error: e.to_string(),
                    timestamp: now_millis(),
                });
            }
        }

        info!("Servo is now {}", observed);
        self.publish(ServoEvent::StateChanged {
            previous: last_known,
            observed,
            timestamp: now_millis(),
        });

        if !self.config.keep_alive {
            self.sessions.release(&session).await;
        }

        Ok(observed)
    }

    fn skip(&self, state: ActuatorState) -> ActuatorState {
        self.publish(ServoEvent::ReconcileSkipped {
            state,
            timestamp: now_millis(),
        });
        state
    }

    /// Last state recorded in the store.
    pub async fn last_known_state(&self) -> Result<Option<ActuatorState>> {
        self.store.last_known_state().await
    }

    /// Recorded states, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<StateRecord>> {
        self.store.history(limit).await
    }

    fn publish(&self, event: ServoEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}
