//! MCP transport implementations.
//!
//! Three transport families are supported:
//! - [`StdioTransport`]: spawn a child process and exchange newline-delimited
//!   JSON over stdin/stdout
//! - [`SseTransport`]: a long-lived GET event stream plus a POST endpoint
//!   announced by the server
//! - [`StreamableHttpTransport`]: one POST per message, answered with JSON or
//!   an event stream

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use tracing::warn;

use crate::error::TransportError;

mod http;
mod sse;
mod stdio;

pub use http::StreamableHttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Trait for MCP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the server.
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Receive a message from the server.
    async fn receive(&mut self) -> Result<String, TransportError>;

    /// Close the transport connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Build the request headers for an HTTP transport.
///
/// Descriptor headers win; `authorization` is only added when the
/// descriptor does not already set one.
pub fn build_headers(configured: &HashMap<String, String>, authorization: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (key, value) in configured {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %key, "Skipping invalid HTTP header"),
        }
    }

    if let Some(auth) = authorization {
        if !headers.contains_key(AUTHORIZATION) {
            match HeaderValue::from_str(auth) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Skipping invalid Authorization token"),
            }
        }
    }

    headers
}

/// Map a non-success HTTP status to a transport error.
pub(crate) async fn status_error(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    classify_status(status, message)
}

fn classify_status(status: u16, message: String) -> TransportError {
    match status {
        401 | 403 => TransportError::Unauthorized(message),
        _ => TransportError::Status { status, message },
    }
}
