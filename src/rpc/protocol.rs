//! JSON-RPC 2.0 message types and the daemon's error codes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CrawlError;

/// A call from a client, one per line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version; anything other than "2.0" is rejected
    pub jsonrpc: String,
    /// Dotted method name, e.g. `crawl.start`
    pub method: String,
    /// Named arguments for the method, as a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Correlates the response. Absent for notifications, which get none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// Reply to a `Request`. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Method output when the call succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details when it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// The request's id, or null when the request could not be parsed
    pub id: Value,
}

/// Error member of a failed `Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// A standard JSON-RPC code or one of the application codes below
    pub code: i32,
    /// Human-readable description
    pub message: String,
    /// Structured context, e.g. the target id the error refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Codes reserved by JSON-RPC 2.0.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Application codes, one per `CrawlError` variant.
pub const TARGET_NOT_FOUND: i32 = -32001;
pub const ALREADY_ACTIVE: i32 = -32002;
pub const OVERLOADED: i32 = -32003;
pub const NOT_STARTABLE: i32 = -32004;
pub const INVALID_TARGET: i32 = -32005;
pub const INVALID_TRANSITION: i32 = -32006;

impl Request {
    /// Build a call with a numeric id.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: Some(Value::from(id)),
        }
    }

    /// True when the client expects no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Structural checks a parsed request must pass before dispatch.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

impl Response {
    /// Wrap a method result. A result that fails to encode becomes an
    /// internal error instead.
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                jsonrpc: "2.0".to_string(),
                result: Some(value),
                error: None,
                id,
            },
            Err(e) => Self::internal_error(id, format!("failed to encode result: {}", e)),
        }
    }

    /// Error reply without `data`.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    /// Error reply carrying structured `data`.
    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Reply to a line that is not valid JSON. The id is unknown, so it is null.
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    /// Reply to valid JSON that is not a well-formed request.
    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    /// Reply to a call naming no known method.
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Reply when `params` do not deserialize into the method's arguments.
    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details.into())
    }

    /// Reply for failures inside the daemon that the caller cannot fix.
    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details.into())
    }

    /// Map an engine failure to its application error code. Errors that
    /// carry a target id or status repeat them in `data`.
    pub fn crawl_error(id: Value, err: &CrawlError) -> Self {
        let message = err.to_string();
        match err {
            CrawlError::TargetNotFound(target_id) => Self::error_with_data(
                id,
                TARGET_NOT_FOUND,
                message,
                Some(serde_json::json!({ "target_id": target_id })),
            ),
            CrawlError::AlreadyActive(target_id) => Self::error_with_data(
                id,
                ALREADY_ACTIVE,
                message,
                Some(serde_json::json!({ "target_id": target_id })),
            ),
            CrawlError::Overloaded { waiting } => Self::error_with_data(
                id,
                OVERLOADED,
                message,
                Some(serde_json::json!({ "waiting": waiting })),
            ),
            CrawlError::NotStartable {
                id: target_id,
                status,
            } => Self::error_with_data(
                id,
                NOT_STARTABLE,
                message,
                Some(serde_json::json!({ "target_id": target_id, "status": status })),
            ),
            CrawlError::InvalidTarget(_) => Self::error(id, INVALID_TARGET, message),
            CrawlError::InvalidTransition(_) => Self::error(id, INVALID_TRANSITION, message),
            CrawlError::Store(_) => Self::internal_error(id, message),
        }
    }
}
