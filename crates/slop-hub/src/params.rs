//! Explaining bad tool arguments against the tool's input schema.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::error::{InvalidParameter, ParamInfo, RegistryError};
use crate::suggest::{normalize, suggest_param};

/// Words that mark a downstream error as a complaint about arguments.
const PARAMETER_MARKERS: &[&str] = &[
    "parameter",
    "argument",
    "property",
    "required",
    "missing",
    "invalid",
    "unknown",
    "unexpected",
    "schema",
    "validation",
    "type",
];

/// Whether an error text looks like an argument problem.
pub fn looks_like_parameter_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    PARAMETER_MARKERS.iter().any(|m| lower.contains(m))
}

/// Parameters declared by a JSON schema's `properties`, in name order.
pub fn expected_params(schema: &Value) -> Vec<ParamInfo> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    let required: HashSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut params: Vec<ParamInfo> = properties
        .iter()
        .filter(|(_, prop)| prop.is_object())
        .map(|(name, prop)| ParamInfo {
            name: name.clone(),
            kind: prop
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            required: required.contains(name.as_str()),
            description: prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
        .collect();
    params.sort_by(|a, b| a.name.cmp(&b.name));
    params
}

/// Build an invalid-parameter error comparing `arguments` with `schema`.
pub fn invalid_parameter(
    server: &str,
    tool: &str,
    message: &str,
    schema: &Value,
    arguments: &Value,
) -> RegistryError {
    let mut provided: Vec<String> = arguments
        .as_object()
        .map(|args| args.keys().cloned().collect())
        .unwrap_or_default();
    provided.sort();

    let expected = expected_params(schema);
    let expected_norm: HashSet<String> = expected.iter().map(|p| normalize(&p.name)).collect();
    let provided_norm: HashSet<String> = provided.iter().map(|p| normalize(p)).collect();

    let unknown: Vec<String> = provided
        .iter()
        .filter(|p| !expected_norm.contains(&normalize(p)))
        .cloned()
        .collect();

    let missing_required = expected
        .iter()
        .filter(|p| p.required && !provided_norm.contains(&normalize(&p.name)))
        .map(|p| p.name.clone())
        .collect();

    let suggestions: BTreeMap<String, String> = unknown
        .iter()
        .filter_map(|name| {
            suggest_param(name, expected.iter().map(|p| p.name.as_str()))
                .map(|best| (name.clone(), best))
        })
        .collect();

    RegistryError::InvalidParameter(Box::new(InvalidParameter {
        server: server.to_string(),
        tool: tool.to_string(),
        message: message.to_string(),
        input_schema: schema.clone(),
        provided,
        expected,
        missing_required,
        unknown,
        suggestions,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File to read"},
                "encoding": {"type": "string"},
                "max_bytes": {"type": "integer"}
            },
            "required": ["path"]
        })
    }

    #[test]
    fn test_marker_detection() {
        assert!(looks_like_parameter_error("Missing required field 'path'"));
        assert!(looks_like_parameter_error("Invalid TYPE for x"));
        assert!(!looks_like_parameter_error("disk full"));
    }

    #[test]
    fn test_expected_params() {
        let params = expected_params(&schema());
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["encoding", "max_bytes", "path"]);
        assert!(params[2].required);
        assert_eq!(params[2].kind, "string");
        assert_eq!(params[2].description, "File to read");
        assert!(expected_params(&json!({"type": "object"})).is_empty());
    }

    #[test]
    fn test_invalid_parameter_detail() {
        let err = invalid_parameter(
            "fs",
            "read_file",
            "missing required parameter",
            &schema(),
            &json!({"file_path": "/tmp/x", "MaxBytes": 10}),
        );

        let RegistryError::InvalidParameter(detail) = err else {
            panic!("expected invalid parameter");
        };
        assert_eq!(detail.missing_required, vec!["path"]);
        assert_eq!(detail.unknown, vec!["file_path"]);
        assert_eq!(detail.suggestions.get("file_path").map(String::as_str), Some("path"));
        assert_eq!(detail.input_schema, schema());
    }
}
