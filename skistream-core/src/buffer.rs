//! Durable staging between bursty local producers and the ingestion service.
//!
//! The [BufferStore] keeps three independent append-only logs, one per [LogType]. Every log
//! assigns its own strictly increasing [SequenceId]s; the only deletion is [BufferStore::prune_up_to],
//! which removes a contiguous prefix once the ingestion service has confirmed it.
//!
//! Each log lives in its own SQLite file (WAL journal, full sync), so a write to one log never
//! waits on another. Lock contention from other processes sharing the files is retried with
//! backoff; any other storage failure is returned immediately.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::str::FromStr;

use backoff::retry::Retry;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{RetryConfig, StoreConfig};
use crate::metrics::{buffer_metrics, log_labels};
use crate::{Error, Result};

use self::log::LogStore;

mod log;

/// Identifier assigned to a record at append time, scoped to one log.
pub type SequenceId = i64;

/// The entity type of a log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    SeasonPass,
    ResortTicket,
    LiftRide,
}

impl LogType {
    pub const ALL: [LogType; 3] = [LogType::SeasonPass, LogType::ResortTicket, LogType::LiftRide];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::SeasonPass => "SEASON_PASS",
            LogType::ResortTicket => "RESORT_TICKET",
            LogType::LiftRide => "LIFT_RIDE",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            LogType::SeasonPass => "season_pass.db",
            LogType::ResortTicket => "resort_ticket.db",
            LogType::LiftRide => "lift_ride.db",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = Error;

    /// Accepts `LIFT_RIDE`, `lift_ride` and `lift-ride`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        LogType::ALL
            .into_iter()
            .find(|log| log.as_str() == normalized)
            .ok_or_else(|| Error::Config(format!("unknown log type {s:?}")))
    }
}

/// A record as stored in a log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    pub sequence_id: SequenceId,
    /// Opaque serialized document.
    pub payload: String,
}

/// Handle to the three logs. Cloning is cheap and every clone shares the same storage.
#[derive(Clone)]
pub struct BufferStore {
    season_pass: LogStore,
    resort_ticket: LogStore,
    lift_ride: LogStore,
    retry: RetryConfig,
}

impl BufferStore {
    /// Opens the three logs under `config.data_dir`, creating whatever is missing. Calling it
    /// again on the same directory reopens the existing logs untouched.
    pub async fn initialize(config: &StoreConfig) -> Result<Self> {
        let dir = &config.data_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            Error::Storage(format!("creating data directory {}: {e}", dir.display()))
        })?;

        let store = Self {
            season_pass: LogStore::open(LogType::SeasonPass, dir, config.lock_timeout).await?,
            resort_ticket: LogStore::open(LogType::ResortTicket, dir, config.lock_timeout).await?,
            lift_ride: LogStore::open(LogType::LiftRide, dir, config.lock_timeout).await?,
            retry: config.retry.clone(),
        };

        for log in LogType::ALL {
            let handle = store.log(log);
            retry_storage(&store.retry, log, "initialize", || handle.create_table()).await?;
            // seeds the pending gauge, appends and prunes keep it current from here
            store.pending(log).await?;
        }

        info!(data_dir = %dir.display(), "Buffer store initialized");
        Ok(store)
    }

    /// Durably appends `payload` and returns its sequence id. A successful return means the
    /// record survives a crash.
    pub async fn append(&self, log: LogType, payload: &str) -> Result<SequenceId> {
        let handle = self.log(log);
        let sequence_id = retry_storage(&self.retry, log, "append", || handle.insert(payload)).await?;

        let metrics = buffer_metrics();
        metrics.appended.get_or_create(log_labels(log)).inc();
        metrics.pending.get_or_create(log_labels(log)).inc();
        Ok(sequence_id)
    }

    /// Up to `limit` records with a sequence id greater than `after`, in ascending order. Never
    /// changes the log, so the same call can be repeated.
    pub async fn read_batch(
        &self,
        log: LogType,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<BufferedRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let handle = self.log(log);
        retry_storage(&self.retry, log, "read_batch", || {
            handle.select_after(after, limit)
        })
        .await
    }

    /// Deletes every record with a sequence id up to and including `sequence_id`, returning how
    /// many went. Repeating it, or asking for a lower id, deletes nothing.
    pub async fn prune_up_to(&self, log: LogType, sequence_id: SequenceId) -> Result<u64> {
        let handle = self.log(log);
        let pruned = retry_storage(&self.retry, log, "prune_up_to", || {
            handle.delete_up_to(sequence_id)
        })
        .await?;

        let metrics = buffer_metrics();
        metrics.pruned.get_or_create(log_labels(log)).inc_by(pruned);
        let pending = metrics.pending.get_or_create(log_labels(log));
        let pruned_count = i64::try_from(pruned).unwrap_or(i64::MAX);
        // records appended by another process were never counted here
        if pending.dec_by(pruned_count) < pruned_count {
            pending.set(0);
        }
        Ok(pruned)
    }

    /// Number of records still waiting in a log. Counts the whole log, so the streaming loops
    /// never call it.
    pub async fn pending(&self, log: LogType) -> Result<u64> {
        let handle = self.log(log);
        let pending = retry_storage(&self.retry, log, "pending", || handle.count()).await?;

        buffer_metrics()
            .pending
            .get_or_create(log_labels(log))
            .set(i64::try_from(pending).unwrap_or(i64::MAX));
        Ok(pending)
    }

    /// Waits for in-flight statements and closes every log.
    pub async fn close(&self) {
        for log in LogType::ALL {
            self.log(log).close().await;
        }
    }

    fn log(&self, log: LogType) -> &LogStore {
        match log {
            LogType::SeasonPass => &self.season_pass,
            LogType::ResortTicket => &self.resort_ticket,
            LogType::LiftRide => &self.lift_ride,
        }
    }
}

/// Runs a storage operation, retrying it with backoff while the storage engine reports it is
/// locked. Other errors, and a lock that outlasts the retries, are returned as-is.
pub(crate) async fn retry_storage<T, F, Fut>(
    retry: &RetryConfig,
    log: LogType,
    operation: &'static str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = retry.max_retries;
    let mut retrying = pin!(Retry::new(retry.strategy(), op, |e: &Error| {
        if !e.is_transient_storage() {
            return false;
        }
        warn!(%log, operation, error = %e, ?max_retries, "Storage busy, retrying");
        buffer_metrics()
            .store_retries
            .get_or_create(log_labels(log))
            .inc();
        true
    }));
    let result = retrying.as_mut().await;

    if let Err(e) = &result {
        let attempts = retrying.attempts();
        if e.is_transient_storage() {
            error!(%log, operation, attempts, "Storage still busy after all retries");
        } else {
            error!(%log, operation, attempts, error = %e, "Storage operation failed");
        }
    }
    result
}
