use serde_json::json;

use crate::bridge::BridgeError;
use crate::jsonrpc::message::JsonRpcError;

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Failures that abort a request before or around the backend call.
///
/// Backend outcomes are never reported through this type; they are
/// translated into typed result values instead.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request carries no caller identity")]
    MissingIdentity,

    #[error("received request from unlinked source: {source_id}")]
    UnlinkedSource { source_id: String },

    #[error("invalid link config: {0}")]
    ConfigInvalid(String),

    #[error("async result {0} not found")]
    HandleNotFound(String),

    #[error("async result {0} is not ready")]
    HandleNotReady(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("task failed: {0}")]
    Task(String),
}

impl ProviderError {
    pub fn code(&self) -> i32 {
        match self {
            ProviderError::MissingIdentity => -32001,
            ProviderError::UnlinkedSource { .. } => -32002,
            ProviderError::ConfigInvalid(_) => -32003,
            ProviderError::HandleNotFound(_) => -32004,
            ProviderError::HandleNotReady(_) => -32005,
            ProviderError::InvalidParams(_) => -32602,
            ProviderError::MethodNotFound(_) => -32601,
            ProviderError::Task(_) => -32603,
        }
    }

    /// Stable machine-readable name carried in the error's `data.kind`
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::MissingIdentity => "missing-identity",
            ProviderError::UnlinkedSource { .. } => "unlinked-source",
            ProviderError::ConfigInvalid(_) => "config-invalid",
            ProviderError::HandleNotFound(_) => "not-found",
            ProviderError::HandleNotReady(_) => "not-ready",
            ProviderError::InvalidParams(_) => "invalid-params",
            ProviderError::MethodNotFound(_) => "method-not-found",
            ProviderError::Task(_) => "internal",
        }
    }
}

impl From<BridgeError> for ProviderError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotFound(handle) => ProviderError::HandleNotFound(handle),
            BridgeError::NotReady(handle) => ProviderError::HandleNotReady(handle),
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::InvalidParams(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ProviderError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProviderError::Task(err.to_string())
    }
}

impl From<ProviderError> for JsonRpcError {
    fn from(err: ProviderError) -> Self {
        JsonRpcError {
            code: err.code(),
            message: err.to_string(),
            data: Some(json!({ "kind": err.kind() })),
        }
    }
}
