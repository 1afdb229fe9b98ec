//! The response envelope shared by the HTTP facade and the tool surface.
//!
//! Every tool result, whatever its shape, goes through
//! [`Envelope::from_tool_output`] before it leaves the process. The HTTP
//! facade serializes the envelope as the response body and the MCP bridge
//! sends the same serialization as the tool's text content, so both
//! surfaces always agree byte for byte.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RagError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_results: Option<usize>,
    pub data: Value,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok(data: Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            query: None,
            total_results: None,
            data,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn search(query: &str, results: Value, total_results: usize, message: impl Into<String>) -> Self {
        Self {
            query: Some(query.to_string()),
            total_results: Some(total_results),
            ..Self::ok(results, message)
        }
    }

    pub fn failure(err: &RagError) -> Self {
        Self {
            success: false,
            query: None,
            total_results: None,
            data: Value::Null,
            message: None,
            error: Some(err.to_string()),
        }
    }

    /// Normalizes a handler's raw output.
    ///
    /// - A string holding JSON is parsed and normalized again; any other
    ///   string becomes `data`.
    /// - An object with a boolean `success` is read field by field. Fields
    ///   outside the envelope are folded into `data` when `data` is absent.
    /// - Anything else (arrays, plain objects, scalars) becomes `data` of a
    ///   successful envelope.
    pub fn from_tool_output(output: Value) -> Self {
        match output {
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) if parsed.is_object() || parsed.is_array() => Self::from_tool_output(parsed),
                _ => Self::bare(Value::String(text)),
            },
            Value::Object(map) if map.get("success").map(Value::is_boolean).unwrap_or(false) => {
                Self::from_object(map)
            }
            other => Self::bare(other),
        }
    }

    fn bare(data: Value) -> Self {
        Self {
            success: true,
            query: None,
            total_results: None,
            data,
            message: None,
            error: None,
        }
    }

    fn from_object(mut map: Map<String, Value>) -> Self {
        let success = map
            .remove("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let take_string = |map: &mut Map<String, Value>, key: &str| match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let query = take_string(&mut map, "query");
        let message = take_string(&mut map, "message");
        let error = take_string(&mut map, "error");
        let total_results = map
            .remove("total_results")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        let data = match map.remove("data") {
            Some(data) => data,
            None if map.is_empty() => Value::Null,
            None => Value::Object(map),
        };

        Self {
            success,
            query,
            total_results,
            data,
            message,
            error,
        }
    }

    /// Compact JSON text; the exact body both surfaces send.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"success":false,"data":null,"message":null,"error":"INTERNAL_ERROR: {}"}}"#,
                e
            )
        })
    }
}
