use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::Result;
use crate::buffer::SequenceId;
use crate::sink::{ChannelHandle, Ingest, RoutingInfo};

/// Logs every batch as newline-delimited JSON and treats it as committed immediately.
///
/// Committed offsets live in memory only, so after a restart every log is streamed from its
/// oldest remaining record.
#[derive(Clone, Default)]
pub struct LogIngest {
    committed: Arc<Mutex<HashMap<String, SequenceId>>>,
}

impl LogIngest {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ingest for LogIngest {
    async fn open_channel(&self, name: &str, routing: &RoutingInfo) -> Result<ChannelHandle> {
        info!(
            channel = name,
            database = %routing.database,
            schema = %routing.schema,
            pipe = %routing.pipe,
            "Opened channel"
        );
        Ok(ChannelHandle {
            name: name.to_string(),
            routing: routing.clone(),
        })
    }

    async fn latest_committed_offset(
        &self,
        channel: &ChannelHandle,
    ) -> Result<Option<SequenceId>> {
        Ok(self.committed.lock().get(&channel.name).copied())
    }

    async fn insert_rows(
        &self,
        channel: &ChannelHandle,
        rows: &[String],
        end_offset: SequenceId,
    ) -> Result<()> {
        let ndjson = rows.join("\n");
        info!(
            channel = %channel.name,
            offset_token = end_offset,
            rows = rows.len(),
            "Batch\n{ndjson}"
        );

        let mut committed = self.committed.lock();
        let offset = committed.entry(channel.name.clone()).or_insert(end_offset);
        *offset = (*offset).max(end_offset);
        Ok(())
    }
}
