//! Legacy HTTP+SSE transport.
//!
//! The client holds a GET event stream open. The server's first `endpoint`
//! event names the URL that client messages are POSTed to; responses come
//! back as `message` events on the stream.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{status_error, Transport};
use crate::error::TransportError;
use crate::event_stream::EventStreamParser;

const INBOX_CAPACITY: usize = 64;

/// HTTP+SSE transport.
pub struct SseTransport {
    client: Client,
    headers: HeaderMap,
    post_url: Url,
    inbox: mpsc::Receiver<Result<String, TransportError>>,
    reader: JoinHandle<()>,
    connected: bool,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its
    /// message endpoint.
    pub async fn connect(url: &str, headers: HeaderMap) -> Result<Self, TransportError> {
        let base = Url::parse(url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", url, e)))?;
        let client = Client::new();

        debug!(url = %base, "Opening SSE stream");
        let response = client
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(response, base, tx, endpoint_tx));

        let post_url = match endpoint_rx.await {
            Ok(url) => url,
            Err(_) => {
                reader.abort();
                return Err(TransportError::ConnectionClosed);
            }
        };
        debug!(endpoint = %post_url, "SSE endpoint announced");

        Ok(Self {
            client,
            headers,
            post_url,
            inbox,
            reader,
            connected: true,
        })
    }
}

async fn read_stream(
    response: reqwest::Response,
    base: Url,
    tx: mpsc::Sender<Result<String, TransportError>>,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = EventStreamParser::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(TransportError::Http(e))).await;
                return;
            }
        };

        for event in parser.feed(&chunk) {
            match event.name() {
                "endpoint" => match base.join(event.data.trim()) {
                    Ok(url) => {
                        if let Some(sender) = endpoint_tx.take() {
                            let _ = sender.send(url);
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed SSE endpoint"),
                },
                "message" => {
                    if tx.send(Ok(event.data)).await.is_err() {
                        return;
                    }
                }
                other => debug!(event = other, "Ignoring SSE event"),
            }
        }
    }

    let _ = tx.send(Err(TransportError::ConnectionClosed)).await;
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let response = self
            .client
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(message.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        match self.inbox.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => {
                self.connected = false;
                Err(e)
            }
            None => {
                self.connected = false;
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.reader.abort();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
