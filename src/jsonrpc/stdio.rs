use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::engine::JsonRpcEngine;
use super::handler::JsonRpcHandler;
use super::message::{JsonRpcError, JsonRpcNotification, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse};

/// LSPスタイルのContent-Lengthヘッダーを使ったメッセージフレーミング
pub struct StdioTransport;

impl StdioTransport {
    /// Read one framed message body. `Ok(None)` means the stream ended cleanly.
    pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line_buffer = String::new();
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        // ヘッダー部を空行まで読み取り
        loop {
            line_buffer.clear();
            let bytes_read = reader.read_line(&mut line_buffer).await?;
            if bytes_read == 0 {
                if saw_header {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Stream closed inside message headers",
                    ));
                }
                return Ok(None);
            }

            let header_line = line_buffer.trim();
            if header_line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;

            let Some((name, value)) = header_line.split_once(':') else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Malformed header line: {}", header_line),
                ));
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let length = value.trim().parse::<usize>().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "Invalid Content-Length")
                })?;
                content_length = Some(length);
            }
        }

        let content_length = content_length.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Missing Content-Length header")
        })?;

        // JSONペイロードを読み取り
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(body).await?;
        writer.flush().await
    }

    /// Decode a message body into a payload
    pub fn decode(body: &[u8]) -> io::Result<JsonRpcPayload> {
        let json_value: Value = serde_json::from_slice(body).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON parse error: {}", e))
        })?;
        Self::parse_json_to_payload(json_value)
    }

    pub fn encode(payload: JsonRpcPayload) -> io::Result<Vec<u8>> {
        serde_json::to_vec(&Self::payload_to_json(payload)).map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("JSON serialization error: {}", e))
        })
    }

    /// 読み取りループ: フレームを読み取り、JsonRpcPayloadに変換してチャンネルに送信
    ///
    /// Malformed requests whose numeric id is readable are answered on
    /// `replies` with an Invalid Request error; other undecodable messages are
    /// logged and skipped. Broken framing ends the loop.
    pub async fn read_loop<R>(
        mut reader: R,
        sender: mpsc::UnboundedSender<JsonRpcPayload>,
        replies: mpsc::UnboundedSender<JsonRpcPayload>,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        while let Some(body) = Self::read_frame(&mut reader).await? {
            let payload = match Self::decode(&body) {
                Ok(payload) => payload,
                Err(e) => {
                    match Self::rejection(&body, &e) {
                        Some(response) => {
                            log::warn!("Rejecting malformed request {}: {}", response.id, e);
                            let _ = replies.send(JsonRpcPayload::Response(response));
                        }
                        None => log::warn!("Discarding undecodable message: {}", e),
                    }
                    continue;
                }
            };

            if sender.send(payload).is_err() {
                log::debug!("Receiver dropped, terminating read loop");
                break;
            }
        }
        log::debug!("EOF reached, terminating read loop");
        Ok(())
    }

    /// 書き込みループ: チャンネルからJsonRpcPayloadを受信して出力
    pub async fn write_loop<W>(
        mut writer: W,
        mut receiver: mpsc::UnboundedReceiver<JsonRpcPayload>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(payload) = receiver.recv().await {
            let body = Self::encode(payload)?;
            Self::write_frame(&mut writer, &body).await?;
        }
        log::debug!("Write loop terminated (receiver closed)");
        Ok(())
    }

    /// JSONをJsonRpcPayloadに変換
    pub fn parse_json_to_payload(json: Value) -> io::Result<JsonRpcPayload> {
        let obj = json
            .as_object()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "JSON must be an object"))?;

        // リクエストの場合 (idがあり、methodがある)
        if let (Some(id), Some(method)) = (obj.get("id"), obj.get("method")) {
            let id = id.as_u64().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "Request id must be a number")
            })?;
            let method = Self::method_name(method)?;
            let headers = match obj.get("headers") {
                Some(headers) => Self::parse_headers(headers),
                None => HashMap::new(),
            };

            return Ok(JsonRpcPayload::Request(JsonRpcRequest {
                id,
                method,
                params: obj.get("params").cloned(),
                headers,
            }));
        }

        // 通知の場合 (idがなく、methodがある)
        if let Some(method) = obj.get("method") {
            return Ok(JsonRpcPayload::Notification(JsonRpcNotification {
                method: Self::method_name(method)?,
                params: obj.get("params").cloned(),
            }));
        }

        // レスポンスの場合 (idがあり、resultかerrorがある)
        if let Some(id) = obj.get("id") {
            let id = id.as_u64().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "Response id must be a number")
            })?;
            let error = obj.get("error").and_then(|e| {
                let error_obj = e.as_object()?;
                let code = error_obj.get("code")?.as_i64()? as i32;
                let message = error_obj.get("message")?.as_str()?.to_string();
                let data = error_obj.get("data").cloned();
                Some(JsonRpcError { code, message, data })
            });

            return Ok(JsonRpcPayload::Response(JsonRpcResponse {
                id,
                result: obj.get("result").cloned(),
                error,
            }));
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Invalid JSON-RPC payload structure",
        ))
    }

    fn method_name(method: &Value) -> io::Result<String> {
        method
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Method must be a string"))
    }

    /// String-valued headers only; other values are dropped and count as absent
    fn parse_headers(headers: &Value) -> HashMap<String, String> {
        let Some(obj) = headers.as_object() else {
            log::warn!("Ignoring headers that are not an object: {}", headers);
            return HashMap::new();
        };
        obj.iter()
            .filter_map(|(name, value)| match value.as_str() {
                Some(value) => Some((name.clone(), value.to_string())),
                None => {
                    log::warn!("Ignoring non-string header {}: {}", name, value);
                    None
                }
            })
            .collect()
    }

    /// Error reply for a request-shaped body that failed to decode
    fn rejection(body: &[u8], error: &io::Error) -> Option<JsonRpcResponse> {
        let json: Value = serde_json::from_slice(body).ok()?;
        let obj = json.as_object()?;
        obj.get("method")?;
        let id = obj.get("id")?.as_u64()?;
        Some(JsonRpcResponse::failure(
            id,
            JsonRpcError::invalid_request(Some(error.to_string())),
        ))
    }

    /// JsonRpcPayloadをJSONに変換
    pub fn payload_to_json(payload: JsonRpcPayload) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));

        match payload {
            JsonRpcPayload::Request(req) => {
                obj.insert("id".to_string(), Value::Number(req.id.into()));
                obj.insert("method".to_string(), Value::String(req.method));
                if let Some(params) = req.params {
                    obj.insert("params".to_string(), params);
                }
                if !req.headers.is_empty() {
                    let headers = req
                        .headers
                        .into_iter()
                        .map(|(name, value)| (name, Value::String(value)))
                        .collect();
                    obj.insert("headers".to_string(), Value::Object(headers));
                }
            }
            JsonRpcPayload::Notification(notif) => {
                obj.insert("method".to_string(), Value::String(notif.method));
                if let Some(params) = notif.params {
                    obj.insert("params".to_string(), params);
                }
            }
            JsonRpcPayload::Response(resp) => {
                obj.insert("id".to_string(), Value::Number(resp.id.into()));
                if let Some(error) = resp.error {
                    let mut error_obj = Map::new();
                    error_obj.insert("code".to_string(), Value::Number(error.code.into()));
                    error_obj.insert("message".to_string(), Value::String(error.message));
                    if let Some(data) = error.data {
                        error_obj.insert("data".to_string(), data);
                    }
                    obj.insert("error".to_string(), Value::Object(error_obj));
                } else {
                    obj.insert("result".to_string(), resp.result.unwrap_or(Value::Null));
                }
            }
        }

        Value::Object(obj)
    }
}

/// stdioシャットダウンの理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioShutdownReason {
    /// stdinが閉じられた（EOF）
    StdinClosed,
    /// 読み取りエラー
    ReadError(String),
    /// stdoutの書き込みエラー
    StdoutError(String),
}

/// JsonRpcEngineとStdioTransportを接続する高レベルアダプター
pub struct JsonRpcStdioAdapter<H: JsonRpcHandler> {
    engine: Arc<JsonRpcEngine<H>>,
    tasks: Vec<JoinHandle<()>>,
    // stdio終了検知用チャンネル
    stdio_shutdown_rx: Option<oneshot::Receiver<StdioShutdownReason>>,
}

impl<H: JsonRpcHandler> JsonRpcStdioAdapter<H> {
    /// 新しいアダプターを作成し、自動的にstdio通信を開始
    pub fn new(handler: impl Into<Arc<H>>) -> Self {
        Self::with_streams(handler, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }

    /// Serve over arbitrary streams instead of stdin/stdout
    pub fn with_streams<R, W>(handler: impl Into<Arc<H>>, reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // エンジンとトランスポート間の双方向チャンネル
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stdio_shutdown_tx, stdio_shutdown_rx) = oneshot::channel();

        let reply_tx = outbound_tx.clone();
        let engine = Arc::new(JsonRpcEngine::with_shared_handler(
            inbound_rx,
            outbound_tx,
            handler.into(),
        ));

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_main_loop().await })
        };

        let (write_error_tx, write_error_rx) = oneshot::channel::<String>();
        let write_handle = tokio::spawn(async move {
            if let Err(e) = StdioTransport::write_loop(writer, outbound_rx).await {
                log::error!("Stdio write loop error: {}", e);
                let _ = write_error_tx.send(e.to_string());
            }
        });

        let read_handle = tokio::spawn(async move {
            tokio::select! {
                result = StdioTransport::read_loop(reader, inbound_tx, reply_tx) => {
                    let reason = match result {
                        Ok(()) => {
                            log::info!("stdin EOF reached, triggering automatic shutdown");
                            StdioShutdownReason::StdinClosed
                        }
                        Err(e) => {
                            log::error!("Stdio read loop error: {}", e);
                            StdioShutdownReason::ReadError(e.to_string())
                        }
                    };
                    let _ = stdio_shutdown_tx.send(reason);
                }
                Ok(message) = write_error_rx => {
                    let _ = stdio_shutdown_tx.send(StdioShutdownReason::StdoutError(message));
                }
            }
        });

        Self {
            engine,
            tasks: vec![engine_handle, read_handle, write_handle],
            stdio_shutdown_rx: Some(stdio_shutdown_rx),
        }
    }

    /// エンジンへの参照を取得
    pub fn engine(&self) -> &Arc<JsonRpcEngine<H>> {
        &self.engine
    }

    /// Serve until the input stream ends or the engine is shut down
    pub async fn run(mut self) -> io::Result<StdioShutdownReason> {
        let shutdown = self.engine.shutdown_token();
        let reason = match self.stdio_shutdown_rx.take() {
            Some(stdio_shutdown_rx) => {
                tokio::select! {
                    // stdioが終了した場合の自動シャットダウン
                    reason = stdio_shutdown_rx => {
                        reason.unwrap_or(StdioShutdownReason::StdinClosed)
                    }
                    _ = shutdown.cancelled() => {
                        log::debug!("Engine shut down, leaving stdio loop");
                        StdioShutdownReason::StdinClosed
                    }
                }
            }
            None => StdioShutdownReason::StdinClosed,
        };

        log::info!("stdio terminated, shutting down engine: {:?}", reason);
        self.engine.shutdown();
        Ok(reason)
    }

    /// グレースフルシャットダウン
    pub async fn shutdown(self) -> io::Result<()> {
        log::info!("Manual shutdown requested for JsonRpcStdioAdapter");
        self.engine.shutdown();
        Ok(())
    }
}

impl<H: JsonRpcHandler> Drop for JsonRpcStdioAdapter<H> {
    fn drop(&mut self) {
        log::debug!("JsonRpcStdioAdapter dropped, cleaning up tasks");
        // 実行中のタスクを中止
        for handle in &self.tasks {
            handle.abort();
        }
    }
}
