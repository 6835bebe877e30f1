//! Error types for the ingestion pipeline

use thiserror::Error;
use twin_core::EventError;

/// Result type for pipeline lifecycle operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Fatal pipeline errors.
///
/// Decode and sink-write failures never show up here; they are logged and
/// the pipeline carries on.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Connect or subscribe failed during start
    #[error("failed to start ingestion: {0}")]
    Startup(#[source] EventError),

    /// Lifecycle operation called in the wrong state
    #[error("pipeline is {0}, expected {1}")]
    InvalidState(String, &'static str),

    /// The read loop ended with an error
    #[error("ingestion faulted: {0}")]
    Faulted(String),

    /// The supervisor gave up restarting
    #[error("ingestion restarts exhausted after {attempts} attempts: {last}")]
    RestartsExhausted { attempts: u32, last: String },

    /// Invalid sink or pipeline configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pipeline task panicked or was cancelled
    #[error("ingestion task failed: {0}")]
    Task(String),
}
