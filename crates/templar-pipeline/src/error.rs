//! Construction-time and lifecycle errors for the pipeline orchestrator.
//!
//! These are the only errors in this crate that travel via `Result::Err`
//! and `?`. Per-build failures are data carried inside [`crate::types::BuildResult`]
//! (see [`crate::types::BuildError`]) — they are never raised here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is already started")]
    AlreadyStarted,

    #[error("pipeline has not been started")]
    NotStarted,

    #[error("shutdown did not complete within the configured timeout")]
    ShutdownTimeout,

    #[error("task queue is closed")]
    QueueClosed,
}
