//! Durable state mirror and request queue contract.
//!
//! The store keeps an append-only history of observed servo states and a
//! single-slot request queue (last write wins). Implementations live in
//! `blueservo-storage`.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::state::{ActuatorState, StateRecord};

/// Stream of queue deliveries.
///
/// `Ok(None)` means the queue was drained rather than a request. An entry
/// that is not a valid state is delivered as `Err(Error::InvalidState)`.
pub type RequestStream = Pin<Box<dyn Stream<Item = Result<Option<ActuatorState>>> + Send>>;

/// State store trait.
///
/// Errors are reported as `Error::StoreUnavailable`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// State of the most recent record, if any.
    async fn last_known_state(&self) -> Result<Option<ActuatorState>>;

    /// Append a timestamped record. History is never overwritten.
    async fn record_state(&self, state: ActuatorState) -> Result<StateRecord>;

    /// Most recent records, newest first.
    async fn history(&self, limit: usize) -> Result<Vec<StateRecord>>;

    /// Put a desired state in the queue, replacing any pending one.
    async fn submit_request(&self, state: ActuatorState) -> Result<()>;

    /// Subscribe to queue deliveries.
    ///
    /// Each entry is removed from the queue at the moment it is delivered, so
    /// a delivery is never replayed (at-most-once).
    fn subscribe_requests(&self) -> RequestStream;
}
