use std::fmt;
use std::str::FromStr;

use crate::buffer::{LogType, SequenceId};
use crate::{Error, Result};

/// Writes every batch to the log and commits it on the spot.
pub mod log;

/// In-process ingestion service with delayed commits and fault injection.
pub mod simulated;

/// Where the ingestion service lands the rows of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingInfo {
    pub database: String,
    pub schema: String,
    pub pipe: String,
}

/// An open channel to the ingestion service. Each log streams through its own channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub name: String,
    pub routing: RoutingInfo,
}

/// Name of the channel a log streams through.
pub fn channel_name(prefix: &str, log: LogType) -> String {
    format!("{prefix}_{}", log.as_str())
}

/// The remote ingestion service, as far as the streaming loops need it.
///
/// The service accepts a batch tagged with the sequence id of its last row, and at some later
/// point reports that id, or a higher one, as durably committed. Transport failures must be
/// reported as [Error::SinkUnavailable] and a refused batch as [Error::SinkRejected]; the
/// loop retries the first and stalls on the second.
#[trait_variant::make(Ingest: Send)]
pub trait LocalIngest {
    /// Opens, or reopens, the named channel.
    async fn open_channel(&self, name: &str, routing: &RoutingInfo) -> Result<ChannelHandle>;

    /// Highest sequence id committed on the channel, `None` if nothing ever was.
    async fn latest_committed_offset(&self, channel: &ChannelHandle)
    -> Result<Option<SequenceId>>;

    /// Hands over `rows` in order. `end_offset` is the sequence id of the last row.
    async fn insert_rows(
        &self,
        channel: &ChannelHandle,
        rows: &[String],
        end_offset: SequenceId,
    ) -> Result<()>;
}

/// Ingestion services that ship with the crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkKind {
    #[default]
    Log,
    Simulated,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Log => f.write_str("log"),
            SinkKind::Simulated => f.write_str("simulated"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(SinkKind::Log),
            "simulated" => Ok(SinkKind::Simulated),
            other => Err(Error::Config(format!("unknown sink {other:?}"))),
        }
    }
}
