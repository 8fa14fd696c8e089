//! Streamable HTTP transport.
//!
//! Every client message is its own POST. The server answers a request
//! either with a JSON body or with an event stream that carries the
//! response; either way the frames are queued for [`Transport::receive`].

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::{status_error, Transport};
use crate::error::TransportError;
use crate::event_stream::EventStreamParser;

/// Header carrying the server-assigned session.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    client: Client,
    endpoint: String,
    headers: HeaderMap,
    session_id: Option<String>,
    inbox: VecDeque<String>,
    connected: bool,
}

impl StreamableHttpTransport {
    pub fn new(endpoint: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            headers,
            session_id: None,
            inbox: VecDeque::new(),
            connected: true,
        }
    }

    /// Session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(id) = &self.session_id {
            if let Ok(value) = HeaderValue::from_str(id) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }

    fn enqueue_json(&mut self, body: &str) {
        let body = body.trim();
        if body.is_empty() {
            return;
        }
        // Batched replies arrive as an array; unbatch them
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(items)) => {
                self.inbox.extend(items.iter().map(Value::to_string));
            }
            _ => self.inbox.push_back(body.to_string()),
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.request_headers())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(
                ACCEPT,
                HeaderValue::from_static("application/json, text/event-stream"),
            )
            .body(message.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(id) {
                debug!(session = id, "Streamable HTTP session assigned");
                self.session_id = Some(id.to_string());
            }
        }

        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            let mut parser = EventStreamParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                for event in parser.feed(&chunk?) {
                    if event.name() == "message" {
                        self.enqueue_json(&event.data);
                    }
                }
            }
            if let Some(event) = parser.finish() {
                if event.name() == "message" {
                    self.enqueue_json(&event.data);
                }
            }
        } else {
            let body = response.text().await?;
            self.enqueue_json(&body);
        }

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        // Replies only ever arrive on the back of a POST
        self.inbox.pop_front().ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.inbox.clear();

        if self.session_id.is_some() {
            // Best effort: servers may not support explicit termination
            let _ = self
                .client
                .delete(&self.endpoint)
                .headers(self.request_headers())
                .send()
                .await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
