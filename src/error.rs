//! Custom error types for the engine.
//!
//! This module defines the primary error type, `EngineError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the orchestration
//! core distinguishes between:
//!
//! - **Protocol failures** (`FatalCommunication`): a worker round trip
//!   exceeded its bound twice (the first expiry is retried once by the
//!   caller). Fatal for the owning controller but nothing else.
//! - **Worker-reported failures** (`WorkerMethodMissing`, `WorkerFailed`):
//!   the worker ran but could not dispatch or the method raised. These leave
//!   the controller usable.
//! - **Pipeline failures** (`DeviceFailure`, `UnknownDevice`): reasons a
//!   shot is pulled out of the pipeline and requeued.
//! - **Ambient failures** (`Config`, `Io`, `Serialization`, `ShotFile`):
//!   wrapped with `#[from]` where a single source type exists so `?` works
//!   throughout.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, EngineError>;

/// Error type covering every failure mode of the orchestration core.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fatal communication error with worker '{worker}': {reason}")]
    FatalCommunication { worker: String, reason: String },

    #[error("Worker '{worker}' has no method '{method}'")]
    WorkerMethodMissing { worker: String, method: String },

    #[error("Worker '{worker}' method '{method}' failed: {message}")]
    WorkerFailed {
        worker: String,
        method: String,
        message: String,
    },

    #[error("State queue already has an active consumer")]
    QueueConsumed,

    #[error("Device '{device}' reported failure: {message}")]
    DeviceFailure { device: String, message: String },

    #[error("Shot references unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Shot file error: {0}")]
    ShotFile(String),
}
