//! What a successful downstream tool call hands back.

use serde_json::{json, Value};
use slop_mcp::protocol::{CallToolResult, ToolContent};

/// Result of a tool call: the raw MCP result, passed through to the agent,
/// plus a plain JSON rendering for callers that want values.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub raw: CallToolResult,
    pub value: Value,
}

impl ToolOutcome {
    pub fn new(raw: CallToolResult) -> Self {
        let value = result_value(&raw);
        Self { raw, value }
    }
}

/// Plain JSON for a tool result.
///
/// Structured content wins. Otherwise a lone item becomes its own value and
/// several items become an array.
pub fn result_value(result: &CallToolResult) -> Value {
    if let Some(structured) = &result.structured_content {
        return structured.clone();
    }

    match result.content.as_slice() {
        [] => Value::Null,
        [single] => content_value(single),
        items => Value::Array(items.iter().map(content_value).collect()),
    }
}

fn content_value(content: &ToolContent) -> Value {
    match content {
        ToolContent::Text { text } => Value::String(text.clone()),
        ToolContent::Image { data, mime_type } => json!({
            "type": "image",
            "mimeType": mime_type,
            "data": data,
        }),
        ToolContent::Audio { data, mime_type } => json!({
            "type": "audio",
            "mimeType": mime_type,
            "data": data,
        }),
        ToolContent::Resource { resource } => json!({
            "type": "resource",
            "resource": resource,
        }),
        ToolContent::Unsupported => Value::Null,
    }
}
