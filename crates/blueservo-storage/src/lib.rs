//! Storage backends for BlueServo.
//!
//! Both backends implement [`blueservo_core::StateStore`]:
//! - [`RedbStateStore`]: durable history and request queue in a redb file
//! - [`MemoryStateStore`]: process-local, for tests and throwaway runs

pub mod error;
pub mod memory;
pub mod redb_store;

use std::sync::Arc;

use blueservo_core::config::{StorageBackendKind, StorageConfig};
use blueservo_core::{ActuatorState, StateStore};

pub use error::{Error, Result};
pub use memory::MemoryStateStore;
pub use redb_store::RedbStateStore;

/// Open the backend selected by the configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackendKind::Redb => Arc::new(RedbStateStore::from_config(config)?),
        StorageBackendKind::Memory => Arc::new(MemoryStateStore::new()),
    };
    tracing::info!(backend = store.backend_name(), "State store ready");
    Ok(store)
}

/// Interpret a raw queue entry. An empty entry means the queue was cleared.
pub(crate) fn parse_entry(raw: &str) -> blueservo_core::Result<Option<ActuatorState>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some)
}
