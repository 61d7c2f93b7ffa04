//! Desired/observed state synchronization.
//!
//! - [`StateReconciler`]: brings the servo to a desired state and records
//!   what the device confirms
//! - [`QueueListener`]: feeds requests from the store's queue into the
//!   reconciler

pub mod listener;
pub mod reconciler;

pub use listener::{ListenerHandle, ListenerStats, QueueListener};
pub use reconciler::StateReconciler;
