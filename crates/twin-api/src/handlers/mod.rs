//! HTTP request handlers for the gateway API
//!
//! Typed device endpoints go through [`twin_client::BackendClient`]; anything
//! else under the external prefix is relayed by [`proxy::passthrough`].

pub mod devices;
pub mod health;
pub mod proxy;

use axum::response::{IntoResponse, Response};
use twin_client::BackendReply;
use twin_core::render_response;

/// Turn a backend reply into the gateway response, status unchanged
pub(crate) fn relay(reply: BackendReply) -> Response {
    let rendered = render_response(reply.status, &reply.headers, reply.body);
    (rendered.status, rendered.headers, rendered.body).into_response()
}
