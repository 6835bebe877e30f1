//! Twin backend client library
//!
//! Provides a typed HTTP client for the twin backend REST API, request
//! forwarding for the gateway passthrough, and the WebSocket event
//! connection consumed by the ingestion pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use twin_client::BackendClient;
//! use twin_core::{BackendCredentials, EventSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BackendClient::new(
//!         "http://localhost:8080",
//!         BackendCredentials::new("ditto", "ditto"),
//!     )?;
//!
//!     let thing = client.get_entity("org.acme:sensor-1").await?;
//!     println!("{} has {} features", thing.thing_id, thing.features.len());
//!
//!     let mut events = client.event_connection()?;
//!     events.connect().await?;
//!     events.subscribe("exists(thingId)").await?;
//!     let frame = events.read_frame().await?;
//!     println!("{:?}", frame);
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module serves an axum router on an ephemeral port with a
//! client already pointed at it:
//!
//! ```rust,ignore
//! use twin_client::testing::TestServer;
//!
//! let server = TestServer::start(mock_backend()).await?;
//! let thing = server.client.get_entity("ns:x").await?;
//! ```

mod client;
mod error;
mod events;
pub mod policy;
pub mod testing;

pub use client::{events_url, BackendClient, BackendReply, ClientConfig, EVENTS_PATH};
pub use error::{ClientError, Result};
pub use events::{subscription_message, EventConnection};
pub use policy::{default_policy, DEFAULT_POLICY_SUBJECT};

// Re-export core types for convenience
pub use twin_core::{BackendCredentials, DeviceFilter, Entity};
