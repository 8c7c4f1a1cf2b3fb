use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::buffer::SequenceId;
use crate::sink::{ChannelHandle, Ingest, RoutingInfo};
use crate::{Error, Result};

/// An ingestion service living in the process.
///
/// A batch becomes committed `commit_lag` after it was inserted and is reported by the next
/// offset query after that. Faults can be queued up front: transient failures of inserts and
/// offset queries, refused batches or offset queries, and stale offset reports. Everything a channel accepted is
/// kept, duplicates included, so tests can check what was delivered.
///
/// Clones share the same state, which outlives any streamer using it, much like the remote
/// service outlives a restart of this process.
#[derive(Clone, Default)]
pub struct SimulatedIngest {
    commit_lag: Duration,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    channels: HashMap<String, Channel>,
    failing_inserts: usize,
    failing_offset_queries: usize,
    rejected_inserts: usize,
    rejected_offset_queries: usize,
}

#[derive(Default)]
struct Channel {
    rows: Vec<String>,
    end_offsets: Vec<SequenceId>,
    /// Inserted batches not yet committed, by the instant they commit at.
    uncommitted: VecDeque<(Instant, SequenceId)>,
    committed: Option<SequenceId>,
    stale_reports: VecDeque<Option<SequenceId>>,
}

impl Channel {
    fn settle(&mut self, now: Instant) {
        while let Some((due, end_offset)) = self.uncommitted.front().copied() {
            if due > now {
                break;
            }
            self.uncommitted.pop_front();
            self.committed = Some(self.committed.map_or(end_offset, |c| c.max(end_offset)));
        }
    }
}

impl SimulatedIngest {
    /// A service that commits every batch as soon as it is inserted.
    pub fn new() -> Self {
        Self::default()
    }

    /// A service that commits a batch `commit_lag` after it was inserted.
    pub fn with_commit_lag(commit_lag: Duration) -> Self {
        Self {
            commit_lag,
            ..Self::default()
        }
    }

    /// The next `n` inserts fail as if the service could not be reached.
    pub fn fail_next_inserts(&self, n: usize) {
        self.state.lock().failing_inserts += n;
    }

    /// The next `n` committed offset queries fail as if the service could not be reached.
    pub fn fail_next_offset_queries(&self, n: usize) {
        self.state.lock().failing_offset_queries += n;
    }

    /// The next `n` inserts are refused.
    pub fn reject_next_inserts(&self, n: usize) {
        self.state.lock().rejected_inserts += n;
    }

    /// The next `n` committed offset queries are refused, as if the channel had been
    /// invalidated.
    pub fn reject_next_offset_queries(&self, n: usize) {
        self.state.lock().rejected_offset_queries += n;
    }

    /// The next offset query on `channel` answers `offset` instead of the real committed offset.
    /// Queue several to answer several queries.
    pub fn report_stale_offset(&self, channel: &str, offset: Option<SequenceId>) {
        self.state
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .stale_reports
            .push_back(offset);
    }

    /// Sets the committed offset of a channel, as if an earlier run had delivered up to it.
    pub fn set_committed(&self, channel: &str, offset: SequenceId) {
        self.state
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .committed = Some(offset);
    }

    /// Every row the channel accepted, in arrival order.
    pub fn delivered(&self, channel: &str) -> Vec<String> {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|c| c.rows.clone())
            .unwrap_or_default()
    }

    /// End offsets of the accepted batches, in arrival order.
    pub fn batches(&self, channel: &str) -> Vec<SequenceId> {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|c| c.end_offsets.clone())
            .unwrap_or_default()
    }

    /// The committed offset of a channel as of now, ignoring queued stale reports.
    pub fn committed(&self, channel: &str) -> Option<SequenceId> {
        let mut state = self.state.lock();
        let channel = state.channels.get_mut(channel)?;
        channel.settle(Instant::now());
        channel.committed
    }
}

impl Ingest for SimulatedIngest {
    async fn open_channel(&self, name: &str, routing: &RoutingInfo) -> Result<ChannelHandle> {
        self.state
            .lock()
            .channels
            .entry(name.to_string())
            .or_default();
        Ok(ChannelHandle {
            name: name.to_string(),
            routing: routing.clone(),
        })
    }

    async fn latest_committed_offset(
        &self,
        channel: &ChannelHandle,
    ) -> Result<Option<SequenceId>> {
        let mut state = self.state.lock();
        if state.failing_offset_queries > 0 {
            state.failing_offset_queries -= 1;
            return Err(Error::SinkUnavailable(format!(
                "simulated outage querying {}",
                channel.name
            )));
        }
        if state.rejected_offset_queries > 0 {
            state.rejected_offset_queries -= 1;
            return Err(Error::SinkRejected(format!(
                "simulated refusal of the offset query on {}",
                channel.name
            )));
        }

        let entry = state.channels.entry(channel.name.clone()).or_default();
        entry.settle(Instant::now());
        if let Some(stale) = entry.stale_reports.pop_front() {
            debug!(channel = %channel.name, ?stale, "Reporting a stale committed offset");
            return Ok(stale);
        }
        Ok(entry.committed)
    }

    async fn insert_rows(
        &self,
        channel: &ChannelHandle,
        rows: &[String],
        end_offset: SequenceId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(Error::SinkUnavailable(format!(
                "simulated outage inserting into {}",
                channel.name
            )));
        }
        if state.rejected_inserts > 0 {
            state.rejected_inserts -= 1;
            return Err(Error::SinkRejected(format!(
                "simulated rejection of batch ending at {end_offset} on {}",
                channel.name
            )));
        }

        let entry = state.channels.entry(channel.name.clone()).or_default();
        entry.rows.extend_from_slice(rows);
        entry.end_offsets.push(end_offset);
        entry
            .uncommitted
            .push_back((Instant::now() + self.commit_lag, end_offset));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[i64]) -> Vec<String> {
        ids.iter().map(|id| format!(r#"{{"id":{id}}}"#)).collect()
    }

    async fn open(sink: &SimulatedIngest) -> ChannelHandle {
        sink.open_channel("ski_RESORT_TICKET", &RoutingInfo::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn commits_immediately_without_lag() {
        let sink = SimulatedIngest::new();
        let channel = open(&sink).await;

        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), None);
        sink.insert_rows(&channel, &rows(&[1, 2]), 2).await.unwrap();
        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), Some(2));
        assert_eq!(sink.delivered(&channel.name), rows(&[1, 2]));
        assert_eq!(sink.batches(&channel.name), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_lag_delays_the_offset() {
        let sink = SimulatedIngest::with_commit_lag(Duration::from_secs(1));
        let channel = open(&sink).await;

        sink.insert_rows(&channel, &rows(&[1, 2, 3]), 3).await.unwrap();
        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), None);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let sink = SimulatedIngest::new();
        let channel = open(&sink).await;

        sink.fail_next_inserts(1);
        sink.reject_next_inserts(1);
        sink.fail_next_offset_queries(1);
        sink.reject_next_offset_queries(1);

        let err = sink.insert_rows(&channel, &rows(&[1]), 1).await.unwrap_err();
        assert!(err.is_transient_sink());
        let err = sink.insert_rows(&channel, &rows(&[1]), 1).await.unwrap_err();
        assert!(matches!(err, Error::SinkRejected(_)));
        sink.insert_rows(&channel, &rows(&[1]), 1).await.unwrap();

        let err = sink.latest_committed_offset(&channel).await.unwrap_err();
        assert!(err.is_transient_sink());
        let err = sink.latest_committed_offset(&channel).await.unwrap_err();
        assert!(matches!(err, Error::SinkRejected(_)));
        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), Some(1));

        // refused batches never count as delivered
        assert_eq!(sink.delivered(&channel.name), rows(&[1]));
    }

    #[tokio::test]
    async fn stale_reports_do_not_change_the_real_offset() {
        let sink = SimulatedIngest::new();
        let channel = open(&sink).await;
        sink.set_committed(&channel.name, 10);

        sink.report_stale_offset(&channel.name, Some(4));
        sink.report_stale_offset(&channel.name, None);

        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), Some(4));
        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), None);
        assert_eq!(sink.latest_committed_offset(&channel).await.unwrap(), Some(10));
        assert_eq!(sink.committed(&channel.name), Some(10));
    }

    #[tokio::test]
    async fn reopening_keeps_channel_state() {
        let sink = SimulatedIngest::new();
        let channel = open(&sink).await;
        sink.insert_rows(&channel, &rows(&[1]), 1).await.unwrap();

        let routing = RoutingInfo {
            database: "SKI".into(),
            schema: "RAW".into(),
            pipe: "TICKETS".into(),
        };
        let reopened = sink
            .open_channel("ski_RESORT_TICKET", &routing)
            .await
            .unwrap();
        assert_eq!(sink.latest_committed_offset(&reopened).await.unwrap(), Some(1));
        assert_eq!(reopened.routing, routing);
    }
}
