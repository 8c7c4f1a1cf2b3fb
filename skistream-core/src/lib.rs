//! Durable local buffering of ski resort events, streamed in order into a remote ingestion
//! service with at-least-once delivery.
//!
//! Producers [append](BufferStore::append) events to one of three independent logs. One
//! [Streamer] per log drains its log into the ingestion service, and records are pruned only
//! after the service reports them committed. The [pipeline] wires the three streamers, the
//! buffer store and the metrics server together.

pub use self::buffer::{BufferStore, BufferedRecord, LogType, SequenceId};
pub use self::config::{RetryConfig, Settings, StoreConfig, StreamerConfig};
pub use self::error::{Error, Result};
pub use self::sink::{ChannelHandle, Ingest, LocalIngest, RoutingInfo, SinkKind};
pub use self::streamer::{Progress, Streamer};

/// Durable storage of the three logs.
pub mod buffer;

/// Settings from the environment.
pub mod config;

mod error;

/// Prometheus metrics and the HTTP server exposing them.
pub mod metrics;

pub mod pipeline;

/// The ingestion service contract and the services that ship with the crate.
pub mod sink;

pub mod streamer;
