//! Request queue listener.
//!
//! Takes desired states from the store's request queue and hands each one to
//! the reconciler. A failed reconcile is logged and the listener keeps going;
//! the entry is already gone from the queue by then.

use std::sync::Arc;

use blueservo_core::{now_millis, ActuatorState, Error, Result, ServoEvent};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::reconciler::StateReconciler;

/// Counters of what the listener has seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    /// Valid requests taken from the queue
    pub delivered: u64,
    /// Cleared-queue deliveries
    pub ignored: u64,
    /// Entries that were not a valid state
    pub invalid: u64,
    pub applied: u64,
    pub failed: u64,
}

pub struct QueueListener {
    reconciler: Arc<StateReconciler>,
    stats: Arc<Mutex<ListenerStats>>,
}

impl QueueListener {
    pub fn new(reconciler: Arc<StateReconciler>) -> Self {
        Self {
            reconciler,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> ListenerStats {
        *self.stats.lock()
    }

    /// Process requests until `stop` turns true or the queue stream ends.
    ///
    /// A reconcile in progress when the stop signal arrives is finished first.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> ListenerStats {
        let mut requests = self.reconciler.store().subscribe_requests();
        info!(
            backend = self.reconciler.store().backend_name(),
            "Listening for state requests"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                next = requests.next() => next,
            };
            match next {
                Some(entry) => self.handle(entry).await,
                None => {
                    warn!("Request stream ended");
                    break;
                }
            }
        }

        let stats = self.stats();
        info!(
            delivered = stats.delivered,
            applied = stats.applied,
            failed = stats.failed,
            "Queue listener stopped"
        );
        stats
    }

    /// Run on a background task.
    pub fn spawn(self) -> ListenerHandle {
        let (stop, rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(async move { self.run(rx).await });
        ListenerHandle { stop, join, stats }
    }

    async fn handle(&self, entry: Result<Option<ActuatorState>>) {
        match entry {
            Ok(None) => {
                self.stats.lock().ignored += 1;
                debug!("Request queue cleared, nothing to apply");
            }
            Ok(Some(desired)) => {
                self.stats.lock().delivered += 1;
                info!("Request received: {}", desired);
                if let Some(bus) = self.reconciler.event_bus() {
                    bus.publish(ServoEvent::RequestReceived {
                        desired,
                        timestamp: now_millis(),
                    });
                }

                match self.reconciler.reconcile(desired).await {
                    Ok(observed) => {
                        self.stats.lock().applied += 1;
                        debug!(%desired, %observed, "Request applied");
                    }
                    Err(e) => {
                        self.stats.lock().failed += 1;
                        error!(%desired, error = %e, "Failed to apply request");
                    }
                }
            }
            Err(Error::InvalidState(raw)) => {
                self.stats.lock().invalid += 1;
                warn!("Ignoring invalid request {:?}", raw);
            }
            Err(e) => {
                self.stats.lock().failed += 1;
                warn!(error = %e, "Request queue error");
            }
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to a spawned [`QueueListener`].
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<ListenerStats>,
    stats: Arc<Mutex<ListenerStats>>,
}

impl ListenerHandle {
    pub fn stats(&self) -> ListenerStats {
        *self.stats.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the listener to stop and wait for it.
    pub async fn stop(self) -> ListenerStats {
        let _ = self.stop.send(true);
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Queue listener task failed");
                *self.stats.lock()
            }
        }
    }
}
