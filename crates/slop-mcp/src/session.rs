//! Downstream MCP sessions.
//!
//! [`McpSession`] drives one initialized connection over any [`Transport`].
//! The [`Session`] and [`Connector`] traits are the seams the registry is
//! written against, so it never touches transports directly.

use async_trait::async_trait;
use serde_json::Value;
use slop_core::{ServerDescriptor, TransportKind};
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsParams, ListToolsResult, McpToolDefinition, MessageKind, RequestId,
    ServerCapabilities,
};
use crate::transport::{
    build_headers, SseTransport, StdioTransport, StreamableHttpTransport, Transport,
};

/// Upper bound on `tools/list` pages, against servers that loop cursors.
const MAX_TOOL_PAGES: usize = 100;

/// A live, initialized connection to one downstream server.
#[async_trait]
pub trait Session: Send {
    /// Identity the server reported during the handshake.
    fn server_info(&self) -> &Implementation;

    /// Fetch the full tool list, following pagination.
    async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Invoke a tool.
    async fn call_tool(&mut self, name: &str, arguments: Value)
        -> Result<CallToolResult, McpError>;

    /// Round-trip a `ping`.
    async fn ping(&mut self) -> Result<(), McpError>;

    /// Tear the connection down. Idempotent.
    async fn close(&mut self) -> Result<(), McpError>;
}

/// Opens sessions from descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport and complete the handshake.
    ///
    /// `authorization` is a ready-made `Authorization` header value; HTTP
    /// transports add it unless the descriptor sets its own.
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        authorization: Option<&str>,
    ) -> Result<Box<dyn Session>, McpError>;
}

/// The production connector: real processes and real HTTP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        authorization: Option<&str>,
    ) -> Result<Box<dyn Session>, McpError> {
        let transport: Box<dyn Transport> = match descriptor.kind() {
            TransportKind::Stdio => {
                if descriptor.command.is_empty() {
                    return Err(McpError::init_failed("stdio server has no command"));
                }
                Box::new(
                    StdioTransport::spawn(&descriptor.command, &descriptor.args, &descriptor.env)
                        .await?,
                )
            }
            TransportKind::Sse => {
                let headers = build_headers(&descriptor.headers, authorization);
                Box::new(SseTransport::connect(&descriptor.url, headers).await?)
            }
            TransportKind::StreamableHttp => {
                let headers = build_headers(&descriptor.headers, authorization);
                Box::new(StreamableHttpTransport::new(descriptor.url.clone(), headers))
            }
        };

        let session = McpSession::initialize(descriptor.name.clone(), transport).await?;
        Ok(Box::new(session))
    }
}

/// A connection to a single MCP server.
pub struct McpSession {
    name: String,
    transport: Box<dyn Transport>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    next_id: u64,
}

impl McpSession {
    /// Run the `initialize` handshake over `transport`.
    ///
    /// The transport is closed again if the handshake fails.
    pub async fn initialize(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, McpError> {
        let mut session = Self {
            name: name.into(),
            transport,
            server_info: Implementation {
                name: String::new(),
                version: String::new(),
            },
            capabilities: ServerCapabilities::default(),
            next_id: 1,
        };

        debug!(server = %session.name, "Initializing MCP session");

        let result: InitializeResult = match session
            .request("initialize", Some(InitializeParams::default()))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let _ = session.transport.close().await;
                return Err(match e {
                    McpError::ServerError { message, .. } => McpError::init_failed(message),
                    other => other,
                });
            }
        };

        session
            .notify::<()>("notifications/initialized", None)
            .await?;

        info!(
            server = %session.name,
            server_name = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol_version = %result.protocol_version,
            "MCP session initialized"
        );

        session.server_info = result.server_info;
        session.capabilities = result.capabilities;
        Ok(session)
    }

    /// Name of the descriptor this session was opened for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities the server advertised.
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a request and wait for the matching response.
    ///
    /// Notifications and stale responses from abandoned requests are
    /// skipped. Server `ping` requests are answered inline.
    async fn request<P, R>(&mut self, method: &str, params: Option<P>) -> Result<R, McpError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(id, method, params);
        self.transport.send(&serde_json::to_string(&request)?).await?;

        let expected = RequestId::from(id);
        loop {
            let frame = self.transport.receive().await?;
            let message: JsonRpcMessage = match serde_json::from_str(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(server = %self.name, error = %e, "Skipping unparseable frame");
                    continue;
                }
            };

            match message.kind() {
                MessageKind::Response if message.id.as_ref() == Some(&expected) => {
                    if let Some(error) = message.error {
                        return Err(McpError::server_error(error.code, error.message));
                    }
                    let result = message
                        .result
                        .ok_or_else(|| McpError::protocol("Response missing result"))?;
                    return serde_json::from_value(result).map_err(|e| {
                        McpError::protocol(format!("Failed to parse {} result: {}", method, e))
                    });
                }
                MessageKind::Request => {
                    self.answer_server_request(message).await?;
                }
                MessageKind::Response => {
                    debug!(server = %self.name, id = ?message.id, "Dropping stale response");
                }
                MessageKind::Notification | MessageKind::Invalid => {}
            }
        }
    }

    async fn answer_server_request(&mut self, message: JsonRpcMessage) -> Result<(), McpError> {
        let Some(id) = message.id else {
            return Ok(());
        };

        let reply = if message.method.as_deref() == Some("ping") {
            serde_json::to_string(&JsonRpcResponse::success(id, serde_json::json!({})))?
        } else {
            let error =
                JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, "method not supported by client");
            serde_json::to_string(&JsonRpcResponse::<Value>::failure(id, error))?
        };
        self.transport.send(&reply).await?;
        Ok(())
    }

    /// Send a notification (no response expected).
    async fn notify<P>(&mut self, method: &str, params: Option<P>) -> Result<(), McpError>
    where
        P: serde::Serialize,
    {
        let notification = JsonRpcNotification::new(method, params);
        self.transport
            .send(&serde_json::to_string(&notification)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Session for McpSession {
    fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor = None;

        for _ in 0..MAX_TOOL_PAGES {
            let result: ListToolsResult = self
                .request("tools/list", Some(ListToolsParams { cursor }))
                .await?;
            tools.extend(result.tools);

            match result.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(server = %self.name, tool_count = tools.len(), "Listed tools");
        Ok(tools)
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        debug!(server = %self.name, tool = name, "Calling tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let result: CallToolResult = self.request("tools/call", Some(params)).await?;

        if result.is_error {
            warn!(server = %self.name, tool = name, "Tool returned error");
        }
        Ok(result)
    }

    async fn ping(&mut self) -> Result<(), McpError> {
        let _: Value = self.request::<(), _>("ping", None).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        if !self.transport.is_connected() {
            return Ok(());
        }
        debug!(server = %self.name, "Closing MCP session");
        self.transport.close().await?;
        Ok(())
    }
}
