use std::time::Duration;
use thiserror::Error;

/// Main error type for the stoker process core
#[derive(Debug, Error)]
pub enum StokerError {
    // Process-related errors
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process limit reached: {0} processes already tracked")]
    CapacityExceeded(usize),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Process restart limit exceeded for {0}")]
    RestartLimitExceeded(String),

    // Communication errors
    #[error("Input stream unavailable for process {0}")]
    StdinUnavailable(String),

    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("Process terminated before the request completed")]
    ProcessTerminated,

    #[error("Worker reported an error: {0}")]
    WorkerError(String),

    #[error("Invalid message envelope: {0}")]
    InvalidEnvelope(String),

    // Pool errors
    #[error("Pool acquire timed out after {0:?}")]
    AcquireTimeout(Duration),

    #[error("Pool is draining, no new acquisitions accepted")]
    PoolDraining,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // System errors
    #[error("Signal error: {0}")]
    SignalError(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for stoker operations
pub type Result<T> = std::result::Result<T, StokerError>;
