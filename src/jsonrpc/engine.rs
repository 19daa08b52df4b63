use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::handler::JsonRpcHandler;
use super::message::{
    JsonRpcPayload, JsonRpcRequest, JsonRpcRequestError, JsonRpcResponse, JsonRpcSendError,
};

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct JsonRpcEngine<H: JsonRpcHandler> {
    // リクエスト・通知を受信するためのチャンネル
    receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<JsonRpcPayload>>>,
    // レスポンス・リクエストを送信するためのチャンネル
    sender: mpsc::UnboundedSender<JsonRpcPayload>,
    // 受信時の処理を担当するハンドラー
    handler: Arc<H>,
    // 応答待ちの送信済みリクエスト
    pending: PendingRequests,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl<H: JsonRpcHandler> JsonRpcEngine<H> {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<JsonRpcPayload>,
        sender: mpsc::UnboundedSender<JsonRpcPayload>,
        handler: H,
    ) -> Self {
        Self::with_shared_handler(receiver, sender, Arc::new(handler))
    }

    pub fn with_shared_handler(
        receiver: mpsc::UnboundedReceiver<JsonRpcPayload>,
        sender: mpsc::UnboundedSender<JsonRpcPayload>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            sender,
            handler,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub async fn send(&self, payload: JsonRpcPayload) -> Result<(), JsonRpcSendError> {
        self.sender.send(payload).map_err(|_| JsonRpcSendError::ChannelClosed)
    }

    /// Send a request to the peer and wait for its response
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        headers: HashMap<String, String>,
        timeout_ms: u64,
    ) -> Result<JsonRpcResponse, JsonRpcRequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = JsonRpcRequest {
            id,
            method: method.to_string(),
            params,
            headers,
        };
        if let Err(e) = self.send(JsonRpcPayload::Request(request)).await {
            self.forget(id);
            return Err(e.into());
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(JsonRpcRequestError::EngineStopped),
            Err(_) => {
                self.forget(id);
                Err(JsonRpcRequestError::Timeout(timeout_ms))
            }
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Stop the main loop. Requests already being handled still complete.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Dispatch incoming payloads until shutdown or until the inbound channel closes.
    ///
    /// Each request is handled on its own task so a slow request never
    /// delays the ones behind it.
    pub async fn run_main_loop(&self) {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            log::warn!("JSON-RPC main loop already running");
            return;
        };

        loop {
            tokio::select! {
                // シャットダウン通知を受信
                _ = self.shutdown.cancelled() => {
                    log::debug!("JSON-RPC engine shutdown requested");
                    break;
                }
                // メッセージ受信処理
                payload = receiver.recv() => {
                    match payload {
                        Some(payload) => self.handle_received_payload(payload),
                        None => {
                            // チャンネルが閉じられた場合はループを終了
                            log::debug!("JSON-RPC inbound channel closed");
                            break;
                        }
                    }
                }
            }
        }

        // 応答が来なくなったリクエストを解放
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn handle_received_payload(&self, payload: JsonRpcPayload) {
        match payload {
            JsonRpcPayload::Request(request) => {
                let handler = self.handler.clone();
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let response = handler.on_request(request).await;
                    // レスポンスを送信（エラーは無視）
                    let _ = sender.send(JsonRpcPayload::Response(response));
                });
            }
            JsonRpcPayload::Notification(notification) => {
                let handler = self.handler.clone();
                tokio::spawn(async move {
                    handler.on_notification(notification).await;
                });
            }
            JsonRpcPayload::Response(response) => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => log::debug!("Dropping response for unknown request {}", response.id),
                }
            }
        }
    }
}
