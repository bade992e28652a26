//! Error handling module for TimerLib.

use thiserror::Error;

/// Custom error type for Timer operations.
#[derive(Error, Debug)]
pub enum TimerError {
    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation attempted on a stopped timer.
    #[error("Operation attempted on a stopped timer.")]
    TimerStopped,

    /// `start` called on a timer whose worker is still running.
    #[error("Timer is already running.")]
    AlreadyRunning,

    /// The worker thread could not be spawned.
    #[error("Failed to spawn timer worker: {0}")]
    Spawn(#[from] std::io::Error),
}
