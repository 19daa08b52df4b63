//! JSON-RPC method table for the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::Dispatcher;
use crate::error::{ProviderError, ProviderResult};
use crate::jsonrpc::{JsonRpcHandler, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::link::LinkDefinition;
use crate::router::CallerIdentity;
use crate::types::{
    Document, DocumentGetAndLockOptions, DocumentGetAndTouchOptions, DocumentGetOptions,
    DocumentInsertOptions, DocumentRemoveOptions, DocumentReplaceOptions, DocumentReplicaOptions,
    DocumentTouchOptions, DocumentUnlockOptions, DocumentUpsertOptions, Outcome,
};

#[derive(Deserialize)]
#[serde(bound(deserialize = "O: Deserialize<'de> + Default"))]
struct IdParams<O> {
    id: String,
    #[serde(default)]
    options: O,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "O: Deserialize<'de> + Default"))]
struct DocumentParams<O> {
    id: String,
    document: Document,
    #[serde(default)]
    options: O,
}

#[derive(Deserialize)]
struct HandleParams {
    handle: String,
}

#[derive(Deserialize)]
struct LinkDelParams {
    source_id: String,
    link_name: String,
}

#[derive(Deserialize)]
struct KeyParams {
    bucket: String,
    key: String,
}

#[derive(Deserialize)]
struct SetParams {
    bucket: String,
    key: String,
    value: Vec<u8>,
}

#[derive(Deserialize)]
struct ListKeysParams {
    bucket: String,
    #[serde(default)]
    cursor: Option<u64>,
}

#[derive(Deserialize)]
struct IncrementParams {
    bucket: String,
    key: String,
    delta: u64,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> ProviderResult<T> {
    Ok(serde_json::from_value(params.unwrap_or(Value::Null))?)
}

fn to_value<T: Serialize>(value: T) -> ProviderResult<Value> {
    serde_json::to_value(value).map_err(|e| ProviderError::Task(e.to_string()))
}

fn outcome<T: Serialize, E: Serialize>(result: Result<T, E>) -> ProviderResult<Value> {
    to_value(Outcome::from(result))
}

/// Serves the provider's JSON-RPC methods
pub struct ProviderHandler {
    dispatcher: Arc<Dispatcher>,
}

impl ProviderHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run a backend-bound operation on the blocking pool
    async fn blocking<T, F>(&self, work: F) -> ProviderResult<T>
    where
        F: FnOnce(&Dispatcher) -> ProviderResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        tokio::task::spawn_blocking(move || work(&dispatcher)).await?
    }

    /// Identity check, then a blocking document call with `{id, options}` params
    async fn by_id<O, T, E, F>(&self, headers: &HashMap<String, String>, params: Option<Value>, op: F) -> ProviderResult<Value>
    where
        O: DeserializeOwned + Default + Send + 'static,
        T: Serialize + Send + 'static,
        E: Serialize + Send + 'static,
        F: FnOnce(&Dispatcher, &CallerIdentity, &str, &O) -> ProviderResult<Result<T, E>> + Send + 'static,
    {
        let identity = self.dispatcher.identify(headers)?;
        let IdParams::<O> { id, options } = parse(params)?;
        let result = self
            .blocking(move |dispatcher| op(dispatcher, &identity, &id, &options))
            .await?;
        outcome(result)
    }

    /// Identity check, then a blocking document call with `{id, document, options}` params
    async fn with_document<O, T, E, F>(
        &self,
        headers: &HashMap<String, String>,
        params: Option<Value>,
        op: F,
    ) -> ProviderResult<Value>
    where
        O: DeserializeOwned + Default + Send + 'static,
        T: Serialize + Send + 'static,
        E: Serialize + Send + 'static,
        F: FnOnce(&Dispatcher, &CallerIdentity, &str, &Document, &O) -> ProviderResult<Result<T, E>>
            + Send
            + 'static,
    {
        let identity = self.dispatcher.identify(headers)?;
        let DocumentParams::<O> { id, document, options } = parse(params)?;
        let result = self
            .blocking(move |dispatcher| op(dispatcher, &identity, &id, &document, &options))
            .await?;
        outcome(result)
    }

    async fn handle(&self, request: JsonRpcRequest) -> ProviderResult<Value> {
        let JsonRpcRequest {
            method,
            params,
            headers,
            ..
        } = request;
        let dispatcher = &self.dispatcher;

        match method.as_str() {
            // ライフサイクル（ホストからの呼び出し、識別子不要）
            "provider.link_put" => {
                let link: LinkDefinition = parse(params)?;
                self.blocking(move |dispatcher| dispatcher.link_put(&link)).await?;
                Ok(Value::Null)
            }
            "provider.link_del" => {
                let LinkDelParams { source_id, link_name } = parse(params)?;
                dispatcher.link_del(&source_id, &link_name);
                Ok(Value::Null)
            }
            "provider.health" => Ok(json!(dispatcher.health())),
            "provider.shutdown" => Ok(json!(dispatcher.shutdown())),

            // ドキュメント操作
            "document.get" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentGetOptions| d.get(who, id, o))
                    .await
            }
            "document.insert" => {
                self.with_document(&headers, params, |d, who, id, doc, o: &DocumentInsertOptions| {
                    d.insert(who, id, doc, o)
                })
                .await
            }
            "document.upsert" => {
                self.with_document(&headers, params, |d, who, id, doc, o: &DocumentUpsertOptions| {
                    d.upsert(who, id, doc, o)
                })
                .await
            }
            "document.replace" => {
                self.with_document(&headers, params, |d, who, id, doc, o: &DocumentReplaceOptions| {
                    d.replace(who, id, doc, o)
                })
                .await
            }
            "document.remove" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentRemoveOptions| d.remove(who, id, o))
                    .await
            }
            "document.touch" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentTouchOptions| d.touch(who, id, o))
                    .await
            }
            "document.unlock" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentUnlockOptions| d.unlock(who, id, o))
                    .await
            }
            "document.get_and_lock" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentGetAndLockOptions| {
                    d.get_and_lock(who, id, o)
                })
                .await
            }
            "document.get_and_touch" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentGetAndTouchOptions| {
                    d.get_and_touch(who, id, o)
                })
                .await
            }
            "document.get_all_replicas" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentReplicaOptions| {
                    d.get_all_replicas(who, id, o)
                })
                .await
            }
            "document.get_any_replica" => {
                self.by_id(&headers, params, |d, who, id, o: &DocumentReplicaOptions| {
                    d.get_any_replica(who, id, o)
                })
                .await
            }

            // 非同期版: ハンドルを即座に返す
            "document.get_async" => {
                let identity = dispatcher.identify(&headers)?;
                let IdParams::<DocumentGetOptions> { id, options } = parse(params)?;
                Ok(json!(dispatcher.get_async(&identity, id, options)?))
            }
            "document.insert_async" => {
                let identity = dispatcher.identify(&headers)?;
                let DocumentParams::<DocumentInsertOptions> { id, document, options } = parse(params)?;
                Ok(json!(dispatcher.insert_async(&identity, id, document, options)?))
            }
            "document.upsert_async" => {
                let identity = dispatcher.identify(&headers)?;
                let DocumentParams::<DocumentUpsertOptions> { id, document, options } = parse(params)?;
                Ok(json!(dispatcher.upsert_async(&identity, id, document, options)?))
            }
            "document.replace_async" => {
                let identity = dispatcher.identify(&headers)?;
                let DocumentParams::<DocumentReplaceOptions> { id, document, options } = parse(params)?;
                Ok(json!(dispatcher.replace_async(&identity, id, document, options)?))
            }
            "document.remove_async" => {
                let identity = dispatcher.identify(&headers)?;
                let IdParams::<DocumentRemoveOptions> { id, options } = parse(params)?;
                Ok(json!(dispatcher.remove_async(&identity, id, options)?))
            }
            "document.get_result.ready" => {
                let HandleParams { handle } = parse(params)?;
                Ok(json!(dispatcher.get_result_ready(&handle)?))
            }
            "document.get_result.get" => {
                let HandleParams { handle } = parse(params)?;
                outcome(dispatcher.get_result(&handle)?)
            }
            "document.mutation_result.ready" => {
                let HandleParams { handle } = parse(params)?;
                Ok(json!(dispatcher.mutation_result_ready(&handle)?))
            }
            "document.mutation_result.get" => {
                let HandleParams { handle } = parse(params)?;
                outcome(dispatcher.mutation_result(&handle)?)
            }

            // キーバリュー
            "keyvalue.store.get" => {
                let identity = dispatcher.identify(&headers)?;
                let KeyParams { bucket, key } = parse(params)?;
                outcome(
                    self.blocking(move |d| d.store_get(&identity, &bucket, &key))
                        .await?,
                )
            }
            "keyvalue.store.set" => {
                let identity = dispatcher.identify(&headers)?;
                let SetParams { bucket, key, value } = parse(params)?;
                outcome(
                    self.blocking(move |d| d.store_set(&identity, &bucket, &key, &value))
                        .await?,
                )
            }
            "keyvalue.store.delete" => {
                let identity = dispatcher.identify(&headers)?;
                let KeyParams { bucket, key } = parse(params)?;
                outcome(
                    self.blocking(move |d| d.store_delete(&identity, &bucket, &key))
                        .await?,
                )
            }
            "keyvalue.store.exists" => {
                let identity = dispatcher.identify(&headers)?;
                let KeyParams { bucket, key } = parse(params)?;
                outcome(
                    self.blocking(move |d| d.store_exists(&identity, &bucket, &key))
                        .await?,
                )
            }
            "keyvalue.store.list_keys" => {
                let identity = dispatcher.identify(&headers)?;
                let ListKeysParams { bucket, cursor } = parse(params)?;
                outcome(dispatcher.store_list_keys(&identity, &bucket, cursor)?)
            }
            "keyvalue.atomics.increment" => {
                let identity = dispatcher.identify(&headers)?;
                let IncrementParams { bucket, key, delta } = parse(params)?;
                outcome(
                    self.blocking(move |d| d.increment(&identity, &bucket, &key, delta))
                        .await?,
                )
            }

            other => Err(ProviderError::MethodNotFound(other.to_string())),
        }
    }
}

#[async_trait]
impl JsonRpcHandler for ProviderHandler {
    async fn on_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        debug!("Handling request {} ({})", id, request.method);

        match self.handle(request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                debug!("Request {} failed: {}", id, e);
                JsonRpcResponse::failure(id, e.into())
            }
        }
    }

    async fn on_notification(&self, notification: JsonRpcNotification) {
        warn!("Ignoring notification {}", notification.method);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::linked_dispatcher;
    use super::*;
    use std::time::Duration;

    fn handler() -> ProviderHandler {
        ProviderHandler::new(Arc::new(linked_dispatcher()))
    }

    async fn call(handler: &ProviderHandler, method: &str, params: Value, source: Option<&str>) -> JsonRpcResponse {
        let mut request = JsonRpcRequest::new(1, method, Some(params));
        if let Some(source) = source {
            request = request.with_header("source-id", source);
        }
        handler.on_request(request).await
    }

    #[tokio::test]
    async fn test_document_methods_return_outcomes() {
        let handler = handler();

        let missing = call(&handler, "document.get", json!({"id": "doc1"}), Some("compA")).await;
        assert_eq!(missing.result, Some(json!({"err": "not-found"})));

        let inserted = call(
            &handler,
            "document.insert",
            json!({"id": "doc1", "document": {"json": {"k": "v"}}}),
            Some("compA"),
        )
        .await;
        let cas = inserted.result.as_ref().unwrap()["ok"]["cas"].as_u64().unwrap();
        assert_ne!(cas, 0);

        let conflict = call(
            &handler,
            "document.insert",
            json!({"id": "doc1", "document": {"raw": "{}"}}),
            Some("compA"),
        )
        .await;
        assert_eq!(conflict.result, Some(json!({"err": "already-exists"})));

        let fetched = call(
            &handler,
            "document.get",
            json!({"id": "doc1", "options": {"project": ["k"]}}),
            Some("compA"),
        )
        .await;
        assert_eq!(fetched.result.unwrap()["ok"]["document"], json!({"raw": r#"{"k":"v"}"#}));
    }

    #[tokio::test]
    async fn test_identity_failures_are_rpc_errors() {
        let handler = handler();

        let missing = call(&handler, "document.get", json!({"id": "doc1"}), None).await;
        let error = missing.error.unwrap();
        assert_eq!(error.code, -32001);
        assert_eq!(error.data, Some(json!({"kind": "missing-identity"})));

        let unlinked = call(&handler, "keyvalue.store.get", json!({"bucket": "b", "key": "k"}), Some("compB")).await;
        assert_eq!(unlinked.error.unwrap().code, -32002);
    }

    #[tokio::test]
    async fn test_bad_params_and_unknown_methods() {
        let handler = handler();

        let bad = call(&handler, "document.insert", json!({"id": "doc1"}), Some("compA")).await;
        assert_eq!(bad.error.unwrap().code, -32602);

        let unknown = call(&handler, "document.explode", json!({}), Some("compA")).await;
        let error = unknown.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.data, Some(json!({"kind": "method-not-found"})));
    }

    #[tokio::test]
    async fn test_lifecycle_methods() {
        let handler = handler();

        let link = json!({
            "source_id": "compB",
            "link_name": "default",
            "target_config": {"username": "u", "bucketName": "b", "connectionString": "cb://host"},
            "target_secrets": {"password": {"kind": "String", "value": "p"}}
        });
        let attached = call(&handler, "provider.link_put", link, None).await;
        assert_eq!(attached.result, Some(Value::Null));
        assert!(handler.dispatcher().router().is_linked("compB"));

        let invalid = call(
            &handler,
            "provider.link_put",
            json!({"source_id": "compC", "link_name": "default"}),
            None,
        )
        .await;
        assert_eq!(invalid.error.unwrap().code, -32003);

        for _ in 0..2 {
            let detached = call(
                &handler,
                "provider.link_del",
                json!({"source_id": "compB", "link_name": "default"}),
                None,
            )
            .await;
            assert_eq!(detached.result, Some(Value::Null));
        }

        let health = call(&handler, "provider.health", Value::Null, None).await;
        assert_eq!(health.result, Some(json!("provider healthy")));

        let ack = call(&handler, "provider.shutdown", Value::Null, None).await;
        assert_eq!(ack.result, Some(json!("ack")));
        assert!(handler.dispatcher().shutdown_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_handle_methods() {
        let handler = handler();

        let submitted = call(
            &handler,
            "document.upsert_async",
            json!({"id": "doc1", "document": {"raw": "{}"}}),
            Some("compA"),
        )
        .await;
        let handle = submitted.result.unwrap().as_str().unwrap().to_string();

        let ready = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ready = call(&handler, "document.mutation_result.ready", json!({"handle": handle}), None).await;
                if ready.result == Some(json!(true)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(ready.is_ok());

        let fetched = call(&handler, "document.mutation_result.get", json!({"handle": handle}), None).await;
        assert!(fetched.result.unwrap()["ok"]["cas"].as_u64().unwrap() > 0);

        let again = call(&handler, "document.mutation_result.get", json!({"handle": handle}), None).await;
        let error = again.error.unwrap();
        assert_eq!(error.code, -32004);
        assert_eq!(error.data, Some(json!({"kind": "not-found"})));
    }

    #[tokio::test]
    async fn test_keyvalue_methods() {
        let handler = handler();

        let set = call(
            &handler,
            "keyvalue.store.set",
            json!({"bucket": "b", "key": "k", "value": [104, 105]}),
            Some("compA"),
        )
        .await;
        assert_eq!(set.result, Some(json!({"ok": null})));

        let get = call(&handler, "keyvalue.store.get", json!({"bucket": "b", "key": "k"}), Some("compA")).await;
        assert_eq!(get.result, Some(json!({"ok": [104, 105]})));

        let list = call(&handler, "keyvalue.store.list_keys", json!({"bucket": "b"}), Some("compA")).await;
        assert_eq!(
            list.result,
            Some(json!({"err": {"other": "list-keys operation not supported"}}))
        );

        let counter = call(
            &handler,
            "keyvalue.atomics.increment",
            json!({"bucket": "b", "key": "hits", "delta": 3}),
            Some("compA"),
        )
        .await;
        assert_eq!(counter.result, Some(json!({"ok": 3})));
    }
}
