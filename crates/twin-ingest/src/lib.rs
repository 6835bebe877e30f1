//! twin-ingest - relays backend twin events into a time-series store
//!
//! The [`IngestionPipeline`] owns one [`EventSource`](twin_core::EventSource)
//! and reads it frame by frame. Frames go through the pure
//! [`decoder`], and the resulting samples cross a bounded channel to a writer
//! task that persists them with a [`TimeSeriesSink`](twin_core::TimeSeriesSink).
//!
//! A [`Supervisor`] wraps the pipeline with a [`RestartPolicy`].

pub mod decoder;
mod error;
pub mod influx;
mod pipeline;
mod supervisor;
pub mod testing;

pub use decoder::{decode_frame, DecodedEvent, FrameOutcome};
pub use error::{IngestError, IngestResult};
pub use influx::{InfluxConfig, InfluxSink};
pub use pipeline::{
    BackpressurePolicy, IngestionHandle, IngestionPipeline, PipelineConfig, PipelineState,
    PipelineStats, StatsSnapshot, DEFAULT_CHANNEL_CAPACITY, DEFAULT_FILTER,
};
pub use supervisor::{BackoffConfig, RestartPolicy, Supervisor};
