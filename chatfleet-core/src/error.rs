use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The shared store could not be reached or timed out. Callers may retry.
    #[error("Shared store unavailable: {0}")]
    TransientStore(String),

    /// The shared store answered, but the reply was unusable.
    #[error("Shared store error: {0}")]
    Store(String),

    /// Session token is unknown, expired or superseded by a newer login.
    #[error("Invalid or expired session token")]
    InvalidToken,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An outgoing frame is longer than the peer accepts. Nothing was written.
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the operation may succeed if the caller tries again later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Orchestrator(_) | Self::Io(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            Self::TransientStore(err.to_string())
        } else {
            Self::Store(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
