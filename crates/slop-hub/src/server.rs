//! Upstream MCP server over standard I/O.
//!
//! Frames are newline-delimited JSON-RPC. Standard output carries nothing
//! but frames; every diagnostic goes through `tracing` to standard error.
//! Each `tools/call` runs on its own task and all responses funnel through a
//! single writer task, so frames never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use slop_mcp::protocol::{
    CallToolParams, CallToolResult, CancelledParams, Implementation, InitializeResult,
    JsonRpcError, JsonRpcMessage, JsonRpcResponse, ListToolsResult, MessageKind, RequestId,
    ServerCapabilities, ToolsCapability, MCP_PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::dispatcher::{definitions, DispatchError, Dispatcher};

const INSTRUCTIONS: &str = "slop-mcp fronts several MCP servers. Use search_tools to find a \
tool, get_metadata for its parameters and execute_tool to call it.";

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type InFlight = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

/// Serves the meta-tools to one agent.
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serve on this process's stdin and stdout until stdin closes.
    pub async fn serve_stdio(&self) -> Result<(), ServeError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve frames read from `reader`, answering on `writer`, until EOF.
    /// In-flight calls are cancelled when the input ends.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), ServeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_frames(writer, rx));

        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let tracker = TaskTracker::new();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        info!("Serving MCP on stdio");
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            let message: JsonRpcMessage = match serde_json::from_str(text) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "Unparseable frame");
                    send(
                        &tx,
                        &json!({
                            "jsonrpc": "2.0",
                            "id": null,
                            "error": {"code": JsonRpcError::PARSE_ERROR, "message": format!("parse error: {}", e)},
                        }),
                    );
                    continue;
                }
            };

            match message.kind() {
                MessageKind::Request => self.handle_request(message, &tx, &in_flight, &tracker),
                MessageKind::Notification => handle_notification(message, &in_flight),
                MessageKind::Response => debug!("Ignoring response frame from client"),
                MessageKind::Invalid => {
                    if let Some(id) = message.id {
                        send(
                            &tx,
                            &JsonRpcResponse::<Value>::failure(
                                id,
                                JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "invalid request"),
                            ),
                        );
                    }
                }
            }
        }

        info!("Client closed input, shutting down");
        for token in in_flight.lock().values() {
            token.cancel();
        }
        tracker.close();
        tracker.wait().await;

        drop(tx);
        match writer_task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Writer task failed"),
        }
        Ok(())
    }

    fn handle_request(
        &self,
        message: JsonRpcMessage,
        tx: &mpsc::UnboundedSender<String>,
        in_flight: &InFlight,
        tracker: &TaskTracker,
    ) {
        let (Some(id), Some(method)) = (message.id, message.method) else {
            return;
        };
        debug!(id = %id, method = %method, "Request");

        match method.as_str() {
            "initialize" => {
                let requested = message
                    .params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .unwrap_or(MCP_PROTOCOL_VERSION)
                    .to_string();
                let result = InitializeResult {
                    protocol_version: requested,
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability { list_changed: false }),
                        ..Default::default()
                    },
                    server_info: Implementation::slop_mcp(),
                    instructions: Some(INSTRUCTIONS.to_string()),
                };
                send(tx, &JsonRpcResponse::success(id, result));
            }
            "ping" => send(tx, &JsonRpcResponse::success(id, json!({}))),
            "tools/list" => {
                let result = ListToolsResult {
                    tools: definitions(),
                    next_cursor: None,
                };
                send(tx, &JsonRpcResponse::success(id, result));
            }
            "tools/call" => {
                let params: CallToolParams =
                    match serde_json::from_value(message.params.unwrap_or(Value::Null)) {
                        Ok(params) => params,
                        Err(e) => {
                            send(
                                tx,
                                &JsonRpcResponse::<Value>::failure(
                                    id,
                                    JsonRpcError::new(
                                        JsonRpcError::INVALID_PARAMS,
                                        format!("invalid tools/call params: {}", e),
                                    ),
                                ),
                            );
                            return;
                        }
                    };

                let cancel = CancellationToken::new();
                in_flight.lock().insert(id.clone(), cancel.clone());

                let dispatcher = Arc::clone(&self.dispatcher);
                let in_flight = Arc::clone(in_flight);
                let tx = tx.clone();
                tracker.spawn(async move {
                    let arguments = params.arguments.unwrap_or(Value::Null);
                    let outcome = dispatcher.dispatch(&params.name, arguments, cancel).await;
                    in_flight.lock().remove(&id);

                    match outcome {
                        Ok(result) => send(&tx, &JsonRpcResponse::success(id, result)),
                        Err(DispatchError::UnknownTool(name)) => send(
                            &tx,
                            &JsonRpcResponse::<Value>::failure(
                                id,
                                JsonRpcError::new(
                                    JsonRpcError::INVALID_PARAMS,
                                    format!("unknown tool: {}", name),
                                ),
                            ),
                        ),
                        Err(DispatchError::Registry(e)) => {
                            debug!(tool = %params.name, code = e.code(), error = %e, "Meta-tool failed");
                            let body = serde_json::to_string_pretty(&e.to_json())
                                .unwrap_or_else(|_| e.to_string());
                            send(&tx, &JsonRpcResponse::success(id, CallToolResult::error_text(body)));
                        }
                    }
                });
            }
            other => send(
                tx,
                &JsonRpcResponse::<Value>::failure(
                    id,
                    JsonRpcError::new(
                        JsonRpcError::METHOD_NOT_FOUND,
                        format!("method not found: {}", other),
                    ),
                ),
            ),
        }
    }
}

fn handle_notification(message: JsonRpcMessage, in_flight: &InFlight) {
    let method = message.method.unwrap_or_default();
    match method.as_str() {
        "notifications/initialized" => debug!("Client initialized"),
        "notifications/cancelled" => {
            let params = message
                .params
                .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
            if let Some(params) = params {
                if let Some(token) = in_flight.lock().get(&params.request_id) {
                    debug!(id = %params.request_id, "Cancelling request");
                    token.cancel();
                }
            }
        }
        other => debug!(method = %other, "Ignoring notification"),
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

fn send<T: Serialize>(tx: &mpsc::UnboundedSender<String>, response: &T) {
    match serde_json::to_string(response) {
        Ok(frame) => {
            if tx.send(frame).is_err() {
                warn!("Response dropped, writer has stopped");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode response"),
    }
}
