//! twin-core - Core traits and types for the digital-twin gateway
//!
//! This crate provides the data model shared by the gateway crates, the pure
//! path translation rules, and the two seams the ingestion pipeline is built
//! on: [`EventSource`] (where frames come from) and [`TimeSeriesSink`] (where
//! samples go).

pub mod error;
pub mod models;
pub mod routing;
pub mod sink;
pub mod source;

pub use error::{EventError, EventResult, SinkError, SinkResult, TranslateError};
pub use models::*;
pub use routing::{
    render_response, BackendCredentials, OutboundRequest, PassthroughResponse, PathTranslator,
};
pub use sink::TimeSeriesSink;
pub use source::{EventSource, Frame, SUBSCRIPTION_ACK_PREFIX};
