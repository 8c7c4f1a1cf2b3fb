//! One streaming loop per log. It drains the log in order into the ingestion service, and deletes
//! records only once the service has reported them committed.
//!
//! ```text
//! INIT -> POLL -> (IDLE | SEND -> CONFIRM -> PRUNE) -> POLL ...
//! ```
//!
//! The watermark is the highest sequence id the service has committed. It only moves forward, so
//! a stale report from the service can neither re-expose pruned records nor trigger a resend of
//! committed ones. A crash anywhere between SEND and PRUNE is recovered by reading the
//! watermark back from the service, which means a batch can be delivered more than once.

use std::future::Future;

use backoff::retry::Retry;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferStore, LogType, SequenceId};
use crate::config::{RetryConfig, StreamerConfig};
use crate::metrics::{log_labels, streamer_metrics};
use crate::sink::{ChannelHandle, Ingest, channel_name};
use crate::{Error, Result};

/// What one POLL cycle achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing past the watermark.
    Idle,
    /// The batch was sent but the service has not committed past the watermark yet. It will be
    /// read and sent again.
    Unconfirmed { end_offset: SequenceId },
    /// The service committed up to `watermark` and everything up to it was pruned.
    Committed {
        end_offset: SequenceId,
        watermark: SequenceId,
        pruned: u64,
    },
    /// The service refused the batch. The log does not move until it is accepted.
    Rejected { end_offset: SequenceId },
}

/// The streaming loop of one log.
pub struct Streamer<C> {
    log: LogType,
    store: BufferStore,
    ingest: C,
    config: StreamerConfig,
    channel: ChannelHandle,
    watermark: SequenceId,
    /// Everything up to here is known to be deleted from the log.
    pruned_through: SequenceId,
}

impl<C> Streamer<C>
where
    C: Ingest + Sync,
{
    /// INIT: opens the log's channel and takes the watermark from the service's committed
    /// offset, 0 if it never committed anything. Records a previous run left behind at or below
    /// the watermark are pruned right away.
    pub async fn init(
        log: LogType,
        store: BufferStore,
        ingest: C,
        config: StreamerConfig,
    ) -> Result<Self> {
        let (channel, committed) = loop {
            match connect(log, &ingest, &config).await {
                Ok(connected) => break connected,
                Err(Error::SinkRejected(reason)) => {
                    error!(%log, %reason, "Ingestion service refused the channel, retrying");
                    sleep(config.rejected_pause).await;
                }
                Err(e) => return Err(e),
            }
        };
        let watermark = committed.unwrap_or(0);
        streamer_metrics()
            .watermark
            .get_or_create(log_labels(log))
            .set(watermark);

        let mut streamer = Self {
            log,
            store,
            ingest,
            config,
            channel,
            watermark,
            pruned_through: 0,
        };
        if watermark > 0 {
            match streamer.prune().await {
                Ok(_) => {}
                Err(e) if e.is_transient_storage() => {
                    warn!(%log, error = %e, "Could not prune on startup, will retry");
                }
                Err(e) => return Err(e),
            }
        }

        info!(%log, channel = %streamer.channel.name, watermark, "Streamer initialized");
        Ok(streamer)
    }

    pub fn log(&self) -> LogType {
        self.log
    }

    /// Highest sequence id the service has committed, as far as this loop knows.
    pub fn watermark(&self) -> SequenceId {
        self.watermark
    }

    /// One cycle: POLL, and if there is anything to send SEND, CONFIRM and PRUNE.
    ///
    /// Transient sink failures are retried inside the cycle. Storage errors, a busy log that
    /// outlasted its retries included, are returned.
    pub async fn run_once(&mut self) -> Result<Progress> {
        if self.pruned_through < self.watermark {
            self.prune().await?;
        }

        let batch = self
            .store
            .read_batch(self.log, self.watermark, self.config.batch_size)
            .await?;
        let Some(end_offset) = batch.last().map(|record| record.sequence_id) else {
            return Ok(Progress::Idle);
        };

        let labels = log_labels(self.log);
        let metrics = streamer_metrics();
        metrics
            .read
            .get_or_create(labels)
            .inc_by(batch.len() as u64);

        let rows: Vec<String> = batch.into_iter().map(|record| record.payload).collect();
        match self.send(&rows, end_offset).await {
            Ok(()) => {}
            Err(Error::SinkRejected(reason)) => {
                error!(
                    log = %self.log,
                    end_offset,
                    %reason,
                    "Ingestion service rejected the batch, the log is stalled until it is accepted"
                );
                metrics.rejected_batches.get_or_create(labels).inc();
                return Ok(Progress::Rejected { end_offset });
            }
            Err(e) => return Err(e),
        }
        metrics.sent.get_or_create(labels).inc_by(rows.len() as u64);
        metrics.sent_batches.get_or_create(labels).inc();
        debug!(log = %self.log, end_offset, rows = rows.len(), "Sent batch");

        let committed = self.confirm(end_offset).await?;
        if committed <= self.watermark {
            debug!(
                log = %self.log,
                end_offset,
                committed,
                watermark = self.watermark,
                "Batch not committed yet"
            );
            return Ok(Progress::Unconfirmed { end_offset });
        }

        self.watermark = committed;
        metrics.watermark.get_or_create(labels).set(committed);
        let pruned = self.prune().await?;
        info!(log = %self.log, watermark = committed, pruned, "Pruned committed records");

        Ok(Progress::Committed {
            end_offset,
            watermark: committed,
            pruned,
        })
    }

    /// Runs cycles until `cancel` fires. Returns an error only for a storage failure the loop
    /// cannot get past; whatever the ingestion service answers is waited out.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(log = %self.log, watermark = self.watermark, "Streaming");
        loop {
            let progress = tokio::select! {
                _ = cancel.cancelled() => break,
                progress = self.run_once() => progress,
            };

            let pause = match progress {
                Ok(Progress::Committed { .. }) => continue,
                Ok(Progress::Idle | Progress::Unconfirmed { .. }) => self.config.idle_pause,
                Ok(Progress::Rejected { .. }) => self.config.rejected_pause,
                Err(e @ Error::Storage(_)) => {
                    error!(log = %self.log, error = %e, "Streamer failed");
                    return Err(e);
                }
                Err(Error::SinkRejected(reason)) => {
                    error!(
                        log = %self.log,
                        %reason,
                        "Ingestion service refused a request, retrying after a pause"
                    );
                    self.config.rejected_pause
                }
                Err(e) => {
                    warn!(log = %self.log, error = %e, "Cycle failed, retrying on the next poll");
                    self.config.idle_pause
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }

        info!(log = %self.log, watermark = self.watermark, "Streamer stopped");
        Ok(())
    }

    /// SEND: hands the batch over, retrying while the service is unreachable.
    async fn send(&self, rows: &[String], end_offset: SequenceId) -> Result<()> {
        let ingest = &self.ingest;
        let channel = &self.channel;
        retry_sink(&self.config.sink_retry, self.log, "insert_rows", move || {
            ingest.insert_rows(channel, rows, end_offset)
        })
        .await
    }

    /// CONFIRM: the service's committed offset, polled until it covers `end_offset` or
    /// `commit_wait` runs out. An absent offset reads as 0.
    async fn confirm(&self, end_offset: SequenceId) -> Result<SequenceId> {
        let deadline = Instant::now() + self.config.commit_wait;
        loop {
            let committed = self.committed_offset().await?.unwrap_or(0);
            let now = Instant::now();
            if committed >= end_offset || now >= deadline {
                return Ok(committed);
            }
            sleep(self.config.commit_poll_interval.min(deadline - now)).await;
        }
    }

    async fn committed_offset(&self) -> Result<Option<SequenceId>> {
        let ingest = &self.ingest;
        let channel = &self.channel;
        retry_sink(
            &self.config.sink_retry,
            self.log,
            "latest_committed_offset",
            move || ingest.latest_committed_offset(channel),
        )
        .await
    }

    /// PRUNE: deletes everything up to the watermark.
    async fn prune(&mut self) -> Result<u64> {
        let pruned = self.store.prune_up_to(self.log, self.watermark).await?;
        self.pruned_through = self.watermark;
        Ok(pruned)
    }
}

/// Opens the log's channel and asks for its committed offset.
async fn connect<C: Ingest>(
    log: LogType,
    ingest: &C,
    config: &StreamerConfig,
) -> Result<(ChannelHandle, Option<SequenceId>)> {
    let name = channel_name(&config.channel_prefix, log);
    let channel = retry_sink(&config.sink_retry, log, "open_channel", || {
        ingest.open_channel(&name, &config.routing)
    })
    .await?;

    let committed = retry_sink(&config.sink_retry, log, "latest_committed_offset", || {
        ingest.latest_committed_offset(&channel)
    })
    .await?;
    Ok((channel, committed))
}

/// Runs a call to the ingestion service, retrying it with backoff while the service is
/// unavailable. With no retry limit configured it only returns once the call went through or
/// failed for another reason.
async fn retry_sink<T, F, Fut>(
    retry: &RetryConfig,
    log: LogType,
    operation: &'static str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Retry::new(retry.strategy(), op, |e: &Error| {
        if !e.is_transient_sink() {
            return false;
        }
        warn!(%log, operation, error = %e, "Ingestion service unavailable, retrying");
        streamer_metrics()
            .sink_retries
            .get_or_create(log_labels(log))
            .inc();
        true
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::StoreConfig;
    use crate::sink::simulated::SimulatedIngest;

    const LOG: LogType = LogType::LiftRide;
    const CHANNEL: &str = "ski_LIFT_RIDE";

    fn config() -> StreamerConfig {
        StreamerConfig {
            batch_size: 100,
            idle_pause: Duration::from_millis(10),
            commit_wait: Duration::ZERO,
            commit_poll_interval: Duration::from_millis(5),
            rejected_pause: Duration::from_millis(10),
            sink_retry: RetryConfig {
                initial: Duration::from_millis(1),
                factor: 2.0,
                cap: Duration::from_millis(10),
                jitter: 0.0,
                max_retries: None,
            },
            channel_prefix: "ski".to_string(),
            ..StreamerConfig::default()
        }
    }

    async fn store() -> (TempDir, BufferStore) {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let store = BufferStore::initialize(&config).await.unwrap();
        (dir, store)
    }

    async fn append(store: &BufferStore, ids: std::ops::RangeInclusive<i64>) {
        for id in ids {
            store.append(LOG, &ride(id)).await.unwrap();
        }
    }

    fn ride(id: i64) -> String {
        format!(r#"{{"ride_id":{id}}}"#)
    }

    #[tokio::test]
    async fn init_recovers_the_watermark_and_prunes() {
        let (_dir, store) = store().await;
        append(&store, 1..=5).await;

        let sink = SimulatedIngest::new();
        sink.set_committed(CHANNEL, 3);

        let streamer = Streamer::init(LOG, store.clone(), sink, config())
            .await
            .unwrap();
        assert_eq!(streamer.watermark(), 3);
        assert_eq!(store.pending(LOG).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn absent_offset_starts_from_zero() {
        let (_dir, store) = store().await;
        append(&store, 1..=2).await;

        let streamer = Streamer::init(LOG, store.clone(), SimulatedIngest::new(), config())
            .await
            .unwrap();
        assert_eq!(streamer.watermark(), 0);
        assert_eq!(store.pending(LOG).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sends_confirms_and_prunes() {
        let (_dir, store) = store().await;
        append(&store, 1..=3).await;
        let sink = SimulatedIngest::new();

        let mut streamer = Streamer::init(LOG, store.clone(), sink.clone(), config())
            .await
            .unwrap();
        assert_eq!(
            streamer.run_once().await.unwrap(),
            Progress::Committed {
                end_offset: 3,
                watermark: 3,
                pruned: 3
            }
        );
        assert_eq!(sink.delivered(CHANNEL), (1..=3).map(ride).collect::<Vec<_>>());
        assert_eq!(sink.batches(CHANNEL), vec![3]);
        assert_eq!(store.pending(LOG).await.unwrap(), 0);

        assert_eq!(streamer.run_once().await.unwrap(), Progress::Idle);
    }

    #[tokio::test]
    async fn batches_are_bounded_and_ordered() {
        let (_dir, store) = store().await;
        append(&store, 1..=7).await;
        let sink = SimulatedIngest::new();

        let mut config = config();
        config.batch_size = 3;
        let mut streamer = Streamer::init(LOG, store, sink.clone(), config)
            .await
            .unwrap();
        while streamer.run_once().await.unwrap() != Progress::Idle {}

        assert_eq!(sink.batches(CHANNEL), vec![3, 6, 7]);
        assert_eq!(sink.delivered(CHANNEL), (1..=7).map(ride).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn uncommitted_batch_is_kept_and_resent() {
        let (_dir, store) = store().await;
        append(&store, 1..=3).await;
        let sink = SimulatedIngest::with_commit_lag(Duration::from_secs(3600));

        let mut config = config();
        config.commit_wait = Duration::from_millis(20);
        let mut streamer = Streamer::init(LOG, store.clone(), sink.clone(), config)
            .await
            .unwrap();

        assert_eq!(
            streamer.run_once().await.unwrap(),
            Progress::Unconfirmed { end_offset: 3 }
        );
        assert_eq!(store.pending(LOG).await.unwrap(), 3);
        assert_eq!(streamer.watermark(), 0);

        streamer.run_once().await.unwrap();
        assert_eq!(sink.batches(CHANNEL), vec![3, 3]);
        assert_eq!(store.pending(LOG).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn confirm_waits_for_a_lagging_commit() {
        let (_dir, store) = store().await;
        append(&store, 1..=3).await;
        let sink = SimulatedIngest::with_commit_lag(Duration::from_millis(30));

        let mut config = config();
        config.commit_wait = Duration::from_secs(5);
        let mut streamer = Streamer::init(LOG, store, sink.clone(), config)
            .await
            .unwrap();

        assert!(matches!(
            streamer.run_once().await.unwrap(),
            Progress::Committed { watermark: 3, .. }
        ));
        assert_eq!(sink.batches(CHANNEL), vec![3]);
    }

    #[tokio::test]
    async fn unavailable_sink_is_retried() {
        let (_dir, store) = store().await;
        append(&store, 1..=3).await;
        let sink = SimulatedIngest::new();

        let mut streamer = Streamer::init(LOG, store, sink.clone(), config())
            .await
            .unwrap();
        sink.fail_next_inserts(3);
        sink.fail_next_offset_queries(2);

        assert!(matches!(
            streamer.run_once().await.unwrap(),
            Progress::Committed { watermark: 3, .. }
        ));
        // failed attempts never reached the channel
        assert_eq!(sink.batches(CHANNEL), vec![3]);
    }

    #[tokio::test]
    async fn rejected_batch_stalls_the_log() {
        let (_dir, store) = store().await;
        append(&store, 1..=2).await;
        let sink = SimulatedIngest::new();

        let mut streamer = Streamer::init(LOG, store.clone(), sink.clone(), config())
            .await
            .unwrap();
        sink.reject_next_inserts(2);

        for _ in 0..2 {
            assert_eq!(
                streamer.run_once().await.unwrap(),
                Progress::Rejected { end_offset: 2 }
            );
            assert_eq!(store.pending(LOG).await.unwrap(), 2);
        }

        // same batch once the service takes it
        assert!(matches!(
            streamer.run_once().await.unwrap(),
            Progress::Committed { end_offset: 2, .. }
        ));
        assert_eq!(sink.delivered(CHANNEL), vec![ride(1), ride(2)]);
    }

    #[tokio::test]
    async fn stale_offset_does_not_regress_the_watermark() {
        let (_dir, store) = store().await;
        append(&store, 1..=3).await;
        let sink = SimulatedIngest::new();

        let mut streamer = Streamer::init(LOG, store.clone(), sink.clone(), config())
            .await
            .unwrap();
        streamer.run_once().await.unwrap();
        assert_eq!(streamer.watermark(), 3);

        append(&store, 4..=5).await;
        sink.report_stale_offset(CHANNEL, Some(1));

        assert_eq!(
            streamer.run_once().await.unwrap(),
            Progress::Unconfirmed { end_offset: 5 }
        );
        assert_eq!(streamer.watermark(), 3);
        let remaining: Vec<_> = store
            .read_batch(LOG, 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.sequence_id)
            .collect();
        assert_eq!(remaining, vec![4, 5]);

        assert!(matches!(
            streamer.run_once().await.unwrap(),
            Progress::Committed { watermark: 5, .. }
        ));
    }

    #[tokio::test]
    async fn run_streams_until_cancelled() {
        let (_dir, store) = store().await;
        let sink = SimulatedIngest::new();

        let streamer = Streamer::init(LOG, store.clone(), sink.clone(), config())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(streamer.run(cancel.clone()));

        append(&store, 1..=10).await;
        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.committed(CHANNEL) != Some(10) {
            assert!(Instant::now() < deadline, "records were never delivered");
            sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_offset_query_pauses_instead_of_failing() {
        let (_dir, store) = store().await;
        let sink = SimulatedIngest::new();

        let streamer = Streamer::init(LOG, store.clone(), sink.clone(), config())
            .await
            .unwrap();
        // the confirm of the first batch is refused twice
        sink.reject_next_offset_queries(2);
        append(&store, 1..=3).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(streamer.run(cancel.clone()));
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.pending(LOG).await.unwrap() > 0 {
            assert!(Instant::now() < deadline, "records were never pruned");
            assert!(!handle.is_finished(), "loop ended early");
            sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(sink.committed(CHANNEL), Some(3));
    }

    #[tokio::test]
    async fn init_waits_out_a_refused_channel() {
        let (_dir, store) = store().await;
        append(&store, 1..=2).await;
        let sink = SimulatedIngest::new();
        sink.set_committed(CHANNEL, 1);
        sink.reject_next_offset_queries(2);

        let streamer = Streamer::init(LOG, store.clone(), sink, config())
            .await
            .unwrap();
        assert_eq!(streamer.watermark(), 1);
        assert_eq!(store.pending(LOG).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_store_ends_the_loop() {
        let (_dir, store) = store().await;
        let streamer = Streamer::init(LOG, store.clone(), SimulatedIngest::new(), config())
            .await
            .unwrap();

        store.close().await;
        let result = streamer.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Storage(_))), "{result:?}");
    }
}
