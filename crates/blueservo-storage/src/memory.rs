//! In-memory state store.
//!
//! Holds history and the request queue in process memory. Nothing survives
//! a restart; used for tests and for running without a database file.

use std::sync::Arc;

use async_trait::async_trait;
use blueservo_core::{ActuatorState, RequestStream, Result, StateRecord, StateStore};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::trace;

use crate::parse_entry;

/// Single-slot queue shared with subscribers.
#[derive(Default)]
struct QueueSlot {
    pending: Mutex<Option<String>>,
    wake: Notify,
}

/// In-memory [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<Vec<StateRecord>>,
    queue: Arc<QueueSlot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a pre-existing history, oldest first.
    pub fn with_history(records: Vec<StateRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            queue: Arc::default(),
        }
    }

    /// Put an arbitrary queue entry, as an external writer could.
    pub fn submit_raw_request(&self, raw: impl Into<String>) {
        *self.queue.pending.lock() = Some(raw.into());
        self.queue.wake.notify_one();
    }

    /// Whether a request is waiting in the queue.
    pub fn has_pending_request(&self) -> bool {
        self.queue.pending.lock().is_some()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn last_known_state(&self) -> Result<Option<ActuatorState>> {
        Ok(self.records.read().last().map(|r| r.state))
    }

    async fn record_state(&self, state: ActuatorState) -> Result<StateRecord> {
        let record = StateRecord::now(state);
        self.records.write().push(record.clone());
        trace!(%state, "Recorded state");
        Ok(record)
    }

    async fn history(&self, limit: usize) -> Result<Vec<StateRecord>> {
        Ok(self.records.read().iter().rev().take(limit).cloned().collect())
    }

    async fn submit_request(&self, state: ActuatorState) -> Result<()> {
        self.submit_raw_request(state.as_str());
        Ok(())
    }

    fn subscribe_requests(&self) -> RequestStream {
        let queue = self.queue.clone();
        Box::pin(async_stream::stream! {
            loop {
                let entry = queue.pending.lock().take();
                match entry {
                    Some(raw) => {
                        yield parse_entry(&raw);
                    }
                    None => queue.wake.notified().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueservo_core::Error;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let store = MemoryStateStore::new();
        assert_eq!(store.last_known_state().await.unwrap(), None);

        store.record_state(ActuatorState::On).await.unwrap();
        store.record_state(ActuatorState::Off).await.unwrap();

        assert_eq!(store.last_known_state().await.unwrap(), Some(ActuatorState::Off));
        let history = store.history(10).await.unwrap();
        assert_eq!(
            history.iter().map(|r| r.state).collect::<Vec<_>>(),
            vec![ActuatorState::Off, ActuatorState::On]
        );
        assert_eq!(store.history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_last_write_wins() {
        let store = MemoryStateStore::new();
        store.submit_request(ActuatorState::On).await.unwrap();
        store.submit_request(ActuatorState::Off).await.unwrap();

        let mut requests = store.subscribe_requests();
        assert_eq!(requests.next().await.unwrap().unwrap(), Some(ActuatorState::Off));
        assert!(!store.has_pending_request());
    }

    #[tokio::test]
    async fn test_invalid_and_cleared_entries() {
        let store = MemoryStateStore::new();
        let mut requests = store.subscribe_requests();

        store.submit_raw_request("sideways");
        assert!(matches!(
            requests.next().await.unwrap(),
            Err(Error::InvalidState(ref s)) if s == "sideways"
        ));

        store.submit_raw_request("");
        assert_eq!(requests.next().await.unwrap().unwrap(), None);
    }
}
