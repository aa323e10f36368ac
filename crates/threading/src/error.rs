//! Threading error types

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThreadError {
    #[error("maximum number of threads reached")]
    MaxThreads,

    #[error("can't create thread: {0}")]
    Spawn(String),

    #[error("threading not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ThreadError>;
