use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found")]
    TaskNotFound,

    #[error("invalid resource id")]
    InvalidResourceId,

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("storage is closed")]
    StorageClosed,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("downloader is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("command panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Fetcher(#[from] anyhow::Error),
}

impl Error {
    /// Lookup failures are reported to the caller and never retried.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TaskNotFound | Error::InvalidResourceId | Error::UnsupportedProtocol(_)
        )
    }
}
