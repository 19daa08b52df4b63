use std::collections::HashMap;

use serde_json::Value;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Option<Value>,
    /// Request metadata supplied by the host (caller identity etc.)
    pub headers: HashMap<String, String>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: Option<String>) -> Self {
        Self::new(PARSE_ERROR, message.unwrap_or_else(|| "Parse error".to_string()), None)
    }

    pub fn invalid_request(message: Option<String>) -> Self {
        Self::new(
            INVALID_REQUEST,
            message.unwrap_or_else(|| "Invalid Request".to_string()),
            None,
        )
    }

    pub fn method_not_found(message: Option<String>, data: Option<Value>) -> Self {
        Self::new(
            METHOD_NOT_FOUND,
            message.unwrap_or_else(|| "Method not found".to_string()),
            data,
        )
    }

    pub fn invalid_params(message: Option<String>, data: Option<Value>) -> Self {
        Self::new(
            INVALID_PARAMS,
            message.unwrap_or_else(|| "Invalid params".to_string()),
            data,
        )
    }

    pub fn internal_error(message: Option<String>, data: Option<Value>) -> Self {
        Self::new(
            INTERNAL_ERROR,
            message.unwrap_or_else(|| "Internal error".to_string()),
            data,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonRpcSendError {
    #[error("channel closed")]
    ChannelClosed,
}

/// Failure of an outgoing request issued through the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonRpcRequestError {
    #[error("failed to send request: {0}")]
    Send(#[from] JsonRpcSendError),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("engine stopped before a response arrived")]
    EngineStopped,
}
