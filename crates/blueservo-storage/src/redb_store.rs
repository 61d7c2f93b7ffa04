//! Durable state store backed by redb.
//!
//! Records live in a table keyed by a monotonically increasing sequence
//! number, so iteration order is insertion order. The request queue is a
//! single key in a second table; a delivery removes it in the same write
//! transaction that reads it.
//!
//! redb locks the database file for as long as it is open. The store opens
//! it for one operation at a time and waits while another handle (in this or
//! another process) holds the lock, so `request` and a running listener can
//! share one file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use blueservo_core::config::StorageConfig;
use blueservo_core::{ActuatorState, RequestStream, StateRecord, StateStore};
use redb::{Database, DatabaseError, ReadableTable, ReadableTableMetadata, TableDefinition};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::parse_entry;

/// Observed states: sequence -> JSON `StateRecord`.
const STATES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("state_records");

/// Request queue: single entry under [`QUEUE_KEY`].
const QUEUE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("request_queue");

const QUEUE_KEY: &str = "state";

/// How long an operation waits for another handle to release the file.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// redb-backed [`StateStore`].
pub struct RedbStateStore {
    path: Arc<PathBuf>,
    poll_interval: Duration,
    /// Wakes subscribers on submits through this handle
    wake: Arc<Notify>,
}

impl RedbStateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, poll_interval: Duration) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Create tables if missing
        with_database(path_ref, |db| {
            let write_txn = db.begin_write()?;
            {
                let _states = write_txn.open_table(STATES_TABLE)?;
                let _queue = write_txn.open_table(QUEUE_TABLE)?;
            }
            write_txn.commit()?;
            Ok(())
        })?;

        debug!(path = %path_ref.display(), "Opened state store");
        Ok(Self {
            path: Arc::new(path_ref.to_path_buf()),
            poll_interval,
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open(&config.path, config.queue_poll_interval())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Put an arbitrary queue entry, as an external writer could.
    pub async fn submit_raw_request(&self, raw: impl Into<String>) -> Result<()> {
        let raw = raw.into();
        self.blocking(move |db| put_request(db, &raw)).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Number of stored records.
    pub async fn len(&self) -> Result<usize> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(STATES_TABLE)?;
            Ok(table.len()? as usize)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || with_database(&path, f)).await?
    }
}

/// Open the database, run `f` and close it again.
///
/// Waits up to [`LOCK_WAIT`] while the file is held open elsewhere.
fn with_database<T>(path: &Path, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
    let started = Instant::now();
    let db = loop {
        match Database::create(path) {
            Ok(db) => break db,
            Err(DatabaseError::DatabaseAlreadyOpen) if started.elapsed() < LOCK_WAIT => {
                trace!(path = %path.display(), "Database busy, retrying");
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    };
    f(&db)
}

fn put_request(db: &Database, raw: &str) -> Result<()> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(QUEUE_TABLE)?;
        table.insert(QUEUE_KEY, raw)?;
    }
    write_txn.commit()?;
    Ok(())
}

fn take_request(db: &Database) -> Result<Option<String>> {
    let write_txn = db.begin_write()?;
    let taken = {
        let mut table = write_txn.open_table(QUEUE_TABLE)?;
        let removed = table.remove(QUEUE_KEY)?;
        removed.map(|v| v.value().to_string())
    };
    if taken.is_some() {
        write_txn.commit()?;
    } else {
        write_txn.abort()?;
    }
    Ok(taken)
}

fn decode_record(json: &str) -> Result<StateRecord> {
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl StateStore for RedbStateStore {
    fn backend_name(&self) -> &'static str {
        "redb"
    }

    async fn last_known_state(&self) -> blueservo_core::Result<Option<ActuatorState>> {
        let state = self
            .blocking(|db| {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(STATES_TABLE)?;
                let last = table.last()?.map(|(_, value)| value.value().to_string());
                match last {
                    Some(json) => Ok(Some(decode_record(&json)?.state)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(state)
    }

    async fn record_state(&self, state: ActuatorState) -> blueservo_core::Result<StateRecord> {
        let record = StateRecord::now(state);
        let json = serde_json::to_string(&record).map_err(Error::from)?;
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(STATES_TABLE)?;
                let next = table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(1);
                table.insert(next, json.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn history(&self, limit: usize) -> blueservo_core::Result<Vec<StateRecord>> {
        let records = self
            .blocking(move |db| {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(STATES_TABLE)?;
                let mut records = Vec::new();
                for result in table.iter()?.rev().take(limit) {
                    let (_, value) = result?;
                    records.push(decode_record(value.value())?);
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    async fn submit_request(&self, state: ActuatorState) -> blueservo_core::Result<()> {
        self.submit_raw_request(state.as_str()).await?;
        Ok(())
    }

    fn subscribe_requests(&self) -> RequestStream {
        let path = self.path.clone();
        let wake = self.wake.clone();
        let poll_interval = self.poll_interval;
        Box::pin(async_stream::stream! {
            loop {
                let db_path = path.clone();
                let taken = match tokio::task::spawn_blocking(move || {
                    with_database(&db_path, take_request)
                })
                .await
                {
                    Ok(taken) => taken,
                    Err(e) => Err(Error::from(e)),
                };
                match taken {
                    Ok(Some(raw)) => {
                        yield parse_entry(&raw);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to poll request queue");
                        yield Err(blueservo_core::Error::from(e));
                    }
                }
                // Submits from other handles are only seen by polling
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        })
    }
}
