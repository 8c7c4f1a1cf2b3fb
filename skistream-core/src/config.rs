use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;

use crate::sink::RoutingInfo;
use crate::{Error, Result};

const ENV_DATA_DIR: &str = "SKISTREAM_DATA_DIR";
const ENV_BATCH_SIZE: &str = "SKISTREAM_BATCH_SIZE";
const ENV_IDLE_PAUSE_MS: &str = "SKISTREAM_IDLE_PAUSE_MS";
const ENV_COMMIT_WAIT_MS: &str = "SKISTREAM_COMMIT_WAIT_MS";
const ENV_COMMIT_POLL_MS: &str = "SKISTREAM_COMMIT_POLL_MS";
const ENV_REJECTED_PAUSE_MS: &str = "SKISTREAM_REJECTED_PAUSE_MS";
const ENV_LOCK_TIMEOUT_MS: &str = "SKISTREAM_LOCK_TIMEOUT_MS";
const ENV_STORE_MAX_RETRIES: &str = "SKISTREAM_STORE_MAX_RETRIES";
const ENV_STORE_PREFIX: &str = "SKISTREAM_STORE";
const ENV_SINK_PREFIX: &str = "SKISTREAM_SINK";
const ENV_METRICS_ADDR: &str = "SKISTREAM_METRICS_ADDR";

// sink routing, same names the ingestion service uses
const ENV_CHANNEL_NAME: &str = "CHANNEL_NAME";
const ENV_DATABASE_NAME: &str = "DATABASE_NAME";
const ENV_SCHEMA_NAME: &str = "SCHEMA_NAME";
const ENV_PIPE_NAME: &str = "PIPE_NAME";

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_IDLE_PAUSE_MS: u64 = 500;
const DEFAULT_COMMIT_WAIT_MS: u64 = 2_000;
const DEFAULT_COMMIT_POLL_MS: u64 = 100;
const DEFAULT_REJECTED_PAUSE_MS: u64 = 5_000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STORE_MAX_RETRIES: u16 = 5;
const DEFAULT_CHANNEL_NAME: &str = "skistream";

/// Backoff parameters for one kind of retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: f64,
    /// `None` retries until success or a fatal error.
    pub max_retries: Option<u16>,
}

impl RetryConfig {
    /// Retries against the local storage engine: 100ms doubling up to 5s.
    pub fn storage() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_secs(5),
            jitter: 0.2,
            max_retries: Some(DEFAULT_STORE_MAX_RETRIES),
        }
    }

    /// Retries against the ingestion service. Never gives up on a batch.
    pub fn sink() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_retries: None,
        }
    }

    /// A fresh strategy for one retried call.
    pub fn strategy(&self) -> Exponential {
        Exponential::new(
            self.initial,
            self.cap,
            self.factor,
            self.jitter,
            self.max_retries,
        )
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(Error::Config(format!(
                "{prefix}_BACKOFF_FACTOR must be >= 1.0, got {}",
                self.factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "{prefix}_BACKOFF_JITTER must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.initial > self.cap {
            return Err(Error::Config(format!(
                "{prefix}_BACKOFF_INITIAL_MS ({:?}) exceeds {prefix}_BACKOFF_CAP_MS ({:?})",
                self.initial, self.cap
            )));
        }
        Ok(())
    }

    fn overlay(mut self, vars: &HashMap<String, String>, prefix: &str) -> Result<Self> {
        self.initial = millis(vars, &format!("{prefix}_BACKOFF_INITIAL_MS"), self.initial)?;
        self.factor = parse(vars, &format!("{prefix}_BACKOFF_FACTOR"), self.factor)?;
        self.cap = millis(vars, &format!("{prefix}_BACKOFF_CAP_MS"), self.cap)?;
        self.jitter = parse(vars, &format!("{prefix}_BACKOFF_JITTER"), self.jitter)?;
        self.validate(prefix)?;
        Ok(self)
    }
}

/// Where and how the buffer store keeps its logs.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// How long SQLite waits on a lock held by another connection before reporting busy.
    pub lock_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            retry: RetryConfig::storage(),
        }
    }
}

/// Tuning of a single streaming loop; all three loops share one.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamerConfig {
    pub batch_size: usize,
    /// Pause after a poll found nothing to send.
    pub idle_pause: Duration,
    /// How long a confirm keeps polling for the batch's commit before giving up on it.
    pub commit_wait: Duration,
    pub commit_poll_interval: Duration,
    /// Pause before resending a batch the sink refused.
    pub rejected_pause: Duration,
    pub sink_retry: RetryConfig,
    /// Channels are named `<channel_prefix>_<LOG>`.
    pub channel_prefix: String,
    pub routing: RoutingInfo,
}

impl StreamerConfig {
    /// Both the batch size and the commit poll interval must be positive.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(format!("{ENV_BATCH_SIZE} must be positive")));
        }
        if self.commit_poll_interval.is_zero() {
            return Err(Error::Config(format!("{ENV_COMMIT_POLL_MS} must be positive")));
        }
        Ok(())
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_pause: Duration::from_millis(DEFAULT_IDLE_PAUSE_MS),
            commit_wait: Duration::from_millis(DEFAULT_COMMIT_WAIT_MS),
            commit_poll_interval: Duration::from_millis(DEFAULT_COMMIT_POLL_MS),
            rejected_pause: Duration::from_millis(DEFAULT_REJECTED_PAUSE_MS),
            sink_retry: RetryConfig::sink(),
            channel_prefix: DEFAULT_CHANNEL_NAME.to_string(),
            routing: RoutingInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub store: StoreConfig,
    pub streamer: StreamerConfig,
    /// Address of the metrics server; no server when absent.
    pub metrics_addr: Option<SocketAddr>,
}

impl Settings {
    /// Settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        vars.try_into()
    }
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(vars: HashMap<String, String>) -> Result<Self> {
        let mut store = StoreConfig::default();
        if let Some(dir) = vars.get(ENV_DATA_DIR) {
            store.data_dir = PathBuf::from(dir);
        }
        store.lock_timeout = millis(&vars, ENV_LOCK_TIMEOUT_MS, store.lock_timeout)?;
        store.retry = store.retry.overlay(&vars, ENV_STORE_PREFIX)?;
        store.retry.max_retries = Some(parse(
            &vars,
            ENV_STORE_MAX_RETRIES,
            DEFAULT_STORE_MAX_RETRIES,
        )?);

        let mut streamer = StreamerConfig::default();
        streamer.batch_size = parse(&vars, ENV_BATCH_SIZE, streamer.batch_size)?;
        streamer.idle_pause = millis(&vars, ENV_IDLE_PAUSE_MS, streamer.idle_pause)?;
        streamer.commit_wait = millis(&vars, ENV_COMMIT_WAIT_MS, streamer.commit_wait)?;
        streamer.commit_poll_interval =
            millis(&vars, ENV_COMMIT_POLL_MS, streamer.commit_poll_interval)?;
        streamer.rejected_pause = millis(&vars, ENV_REJECTED_PAUSE_MS, streamer.rejected_pause)?;
        streamer.sink_retry = streamer.sink_retry.overlay(&vars, ENV_SINK_PREFIX)?;
        if let Some(name) = vars.get(ENV_CHANNEL_NAME) {
            streamer.channel_prefix = name.clone();
        }
        streamer.routing = RoutingInfo {
            database: vars.get(ENV_DATABASE_NAME).cloned().unwrap_or_default(),
            schema: vars.get(ENV_SCHEMA_NAME).cloned().unwrap_or_default(),
            pipe: vars.get(ENV_PIPE_NAME).cloned().unwrap_or_default(),
        };
        streamer.validate()?;

        let metrics_addr = vars
            .get(ENV_METRICS_ADDR)
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::Config(format!("parsing {ENV_METRICS_ADDR}: {e}")))
            })
            .transpose()?;

        Ok(Settings {
            store,
            streamer,
            metrics_addr,
        })
    }
}

fn parse<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("parsing {key}={raw:?}: {e}"))),
    }
}

fn millis(vars: &HashMap<String, String>, key: &str, default: Duration) -> Result<Duration> {
    let ms = parse(vars, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = Settings::try_from(HashMap::new()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.store.data_dir, PathBuf::from("./data"));
        assert_eq!(settings.streamer.batch_size, 100);
        assert_eq!(settings.store.retry.max_retries, Some(5));
        assert_eq!(settings.streamer.sink_retry.max_retries, None);
        assert!(settings.metrics_addr.is_none());
    }

    #[test]
    fn overrides_from_vars() {
        let settings = Settings::try_from(vars(&[
            ("SKISTREAM_DATA_DIR", "/var/lib/skistream"),
            ("SKISTREAM_BATCH_SIZE", "20"),
            ("SKISTREAM_STORE_MAX_RETRIES", "8"),
            ("SKISTREAM_STORE_BACKOFF_INITIAL_MS", "50"),
            ("SKISTREAM_STORE_BACKOFF_CAP_MS", "800"),
            ("SKISTREAM_SINK_BACKOFF_FACTOR", "3.0"),
            ("SKISTREAM_COMMIT_WAIT_MS", "0"),
            ("SKISTREAM_METRICS_ADDR", "127.0.0.1:9090"),
            ("CHANNEL_NAME", "ski_channel"),
            ("DATABASE_NAME", "SKI"),
            ("SCHEMA_NAME", "RAW"),
            ("PIPE_NAME", "LIFT_PIPE"),
        ]))
        .unwrap();

        assert_eq!(settings.store.data_dir, PathBuf::from("/var/lib/skistream"));
        assert_eq!(settings.streamer.batch_size, 20);
        assert_eq!(settings.store.retry.max_retries, Some(8));
        assert_eq!(settings.store.retry.initial, Duration::from_millis(50));
        assert_eq!(settings.store.retry.cap, Duration::from_millis(800));
        assert_eq!(settings.streamer.sink_retry.factor, 3.0);
        assert_eq!(settings.streamer.commit_wait, Duration::ZERO);
        assert_eq!(settings.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));
        assert_eq!(settings.streamer.channel_prefix, "ski_channel");
        assert_eq!(settings.streamer.routing.database, "SKI");
        assert_eq!(settings.streamer.routing.schema, "RAW");
        assert_eq!(settings.streamer.routing.pipe, "LIFT_PIPE");
    }

    #[test]
    fn rejects_invalid_values() {
        for bad in [
            vars(&[("SKISTREAM_BATCH_SIZE", "0")]),
            vars(&[("SKISTREAM_BATCH_SIZE", "many")]),
            vars(&[("SKISTREAM_COMMIT_POLL_MS", "0")]),
            vars(&[("SKISTREAM_STORE_BACKOFF_FACTOR", "0.5")]),
            vars(&[("SKISTREAM_SINK_BACKOFF_JITTER", "1.5")]),
            vars(&[("SKISTREAM_STORE_BACKOFF_INITIAL_MS", "10000")]),
            vars(&[("SKISTREAM_METRICS_ADDR", "not-an-addr")]),
        ] {
            let result = Settings::try_from(bad.clone());
            assert!(
                matches!(result, Err(Error::Config(_))),
                "{bad:?} -> {result:?}"
            );
        }
    }

    #[test]
    fn zero_commit_wait_is_fine_but_zero_poll_is_not() {
        let settings = Settings::try_from(vars(&[("SKISTREAM_COMMIT_WAIT_MS", "0")])).unwrap();
        assert!(settings.streamer.validate().is_ok());

        let mut streamer = settings.streamer;
        streamer.commit_poll_interval = Duration::ZERO;
        assert!(matches!(streamer.validate(), Err(Error::Config(_))));

        let streamer = StreamerConfig {
            batch_size: 0,
            ..StreamerConfig::default()
        };
        assert!(matches!(streamer.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn strategy_follows_config() {
        let retry = RetryConfig {
            initial: Duration::from_millis(10),
            factor: 2.0,
            cap: Duration::from_millis(25),
            jitter: 0.0,
            max_retries: Some(4),
        };
        let delays: Vec<_> = retry.strategy().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(25),
                Duration::from_millis(25),
            ]
        );
    }
}
