use async_trait::async_trait;

use super::message::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Receiving side of a JSON-RPC connection.
///
/// Requests may be handled concurrently, so implementations take `&self`.
#[async_trait]
pub trait JsonRpcHandler: Send + Sync + 'static {
    async fn on_request(&self, request: JsonRpcRequest) -> JsonRpcResponse;

    async fn on_notification(&self, notification: JsonRpcNotification);
}
