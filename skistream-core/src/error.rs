use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The storage engine is locked by a concurrent writer. Transient.
    #[error("StorageBusy Error - {0}")]
    StorageBusy(String),

    /// Corruption, disk failure, or anything else the storage engine will not recover from.
    #[error("Storage Error - {0}")]
    Storage(String),

    /// The ingestion service could not be reached or did not answer. Transient.
    #[error("SinkUnavailable Error - {0}")]
    SinkUnavailable(String),

    /// The ingestion service durably refused the content of a batch.
    #[error("SinkRejected Error - {0}")]
    SinkRejected(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    /// A pipeline task panicked or was aborted.
    #[error("Task Error - {0}")]
    Task(String),
}

impl Error {
    /// Classification handed to the retry helper by the buffer store.
    pub fn is_transient_storage(&self) -> bool {
        matches!(self, Error::StorageBusy(_))
    }

    /// Classification handed to the retry helper by the streaming loop.
    pub fn is_transient_sink(&self) -> bool {
        matches!(self, Error::SinkUnavailable(_))
    }
}

/// SQLite primary result codes for a locked database. Extended codes carry the primary code in
/// their low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Error::StorageBusy(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY | SQLITE_LOCKED) => Error::StorageBusy(err.to_string()),
                    _ => Error::Storage(err.to_string()),
                }
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}
