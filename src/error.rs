use thiserror::Error;

/// Crate-wide error type. One variant per external failure mode, plus the
/// domain-level outcomes enumerated for the execution engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),

    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("no Redis connection is open (called across the fork boundary?)")]
    NotConnected,

    #[error("unknown job class '{0}'")]
    FactoryError(String),

    #[error("job error: {0}")]
    JobError(String),

    #[error("handler process exited abnormally: {0}")]
    HandlerFault(String),

    #[error("enqueue refused by beforeEnqueue listener")]
    DoNotCreate,

    #[error("perform skipped by beforePerform listener")]
    DoNotPerform,

    #[error("Redis connection unavailable: {0}")]
    RedisUnavailable(String),

    #[error("fork() failed: {0}")]
    ForkFailed(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed envelope in queue '{queue}': {source}")]
    MalformedEnvelope {
        queue: String,
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
