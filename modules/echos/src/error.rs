use thiserror::Error;

#[derive(Error, Debug)]
pub enum EchoError {
    #[error("no store is installed")]
    NotInstalled,

    #[error("chain is closed: no further items can be appended")]
    ChainClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("timed out waiting for {expected} dispatched actions (saw {seen})")]
    Timeout { expected: usize, seen: usize },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for echo operations.
pub type EchoResult<T> = std::result::Result<T, EchoError>;
