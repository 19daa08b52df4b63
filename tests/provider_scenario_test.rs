// プロバイダー全体のシナリオテスト
// クライアント用エンジンとプロバイダー用エンジンをチャンネルで直結して検証

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docbridge::jsonrpc::{
    JsonRpcEngine, JsonRpcHandler, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use docbridge::{Dispatcher, MemoryConnector, ProviderConfig, ProviderHandler};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const TIMEOUT_MS: u64 = 2000;

// クライアント側はリクエストを受けない
struct ClientHandler;

#[async_trait]
impl JsonRpcHandler for ClientHandler {
    async fn on_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        JsonRpcResponse::failure(
            request.id,
            docbridge::jsonrpc::JsonRpcError::method_not_found(None, None),
        )
    }

    async fn on_notification(&self, _notification: JsonRpcNotification) {}
}

struct Harness {
    client: Arc<JsonRpcEngine<ClientHandler>>,
    provider: Arc<JsonRpcEngine<ProviderHandler>>,
}

impl Harness {
    fn start() -> Self {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();

        let config = ProviderConfig {
            readiness_timeout_ms: 50,
            ..Default::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(MemoryConnector::new().with_unreachable_host("down")),
            config,
            Handle::current(),
        ));

        let (client_tx, provider_rx) = mpsc::unbounded_channel();
        let (provider_tx, client_rx) = mpsc::unbounded_channel();
        let client = Arc::new(JsonRpcEngine::new(client_rx, client_tx, ClientHandler));
        let provider = Arc::new(JsonRpcEngine::new(
            provider_rx,
            provider_tx,
            ProviderHandler::new(dispatcher),
        ));

        {
            let client = client.clone();
            tokio::spawn(async move { client.run_main_loop().await });
        }
        {
            let provider = provider.clone();
            tokio::spawn(async move { provider.run_main_loop().await });
        }

        Self { client, provider }
    }

    async fn host(&self, method: &str, params: Value) -> JsonRpcResponse {
        self.client
            .request(method, Some(params), HashMap::new(), TIMEOUT_MS)
            .await
            .expect("provider did not answer")
    }

    async fn call(&self, source: &str, method: &str, params: Value) -> JsonRpcResponse {
        let mut headers = HashMap::new();
        headers.insert("source-id".to_string(), source.to_string());
        self.client
            .request(method, Some(params), headers, TIMEOUT_MS)
            .await
            .expect("provider did not answer")
    }

    async fn attach(&self, source: &str, bucket: &str, connection_string: &str) {
        let response = self
            .host(
                "provider.link_put",
                json!({
                    "source_id": source,
                    "link_name": "default",
                    "target_config": {
                        "username": "u",
                        "bucketName": bucket,
                        "connectionString": connection_string
                    },
                    "target_secrets": {"password": {"kind": "String", "value": "p"}}
                }),
            )
            .await;
        assert_eq!(response.result, Some(Value::Null), "attach failed: {:?}", response.error);
    }

    async fn wait_ready(&self, method: &str, handle: &str) {
        let polled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ready = self.host(method, json!({"handle": handle})).await;
                if ready.result == Some(json!(true)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "{} never became ready", handle);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attach_get_upsert_async_fetch_get() {
    let harness = Harness::start();
    harness.attach("compA", "b", "cb://host").await;

    let missing = harness.call("compA", "document.get", json!({"id": "doc1"})).await;
    assert_eq!(missing.result, Some(json!({"err": "not-found"})));

    let submitted = harness
        .call(
            "compA",
            "document.upsert_async",
            json!({"id": "doc1", "document": {"json": {"k": "v"}}}),
        )
        .await;
    let handle = submitted.result.unwrap().as_str().unwrap().to_string();
    assert!(handle.starts_with("upsert.doc1."));

    harness.wait_ready("document.mutation_result.ready", &handle).await;
    let fetched = harness
        .host("document.mutation_result.get", json!({"handle": handle}))
        .await;
    let meta = &fetched.result.unwrap()["ok"];
    let cas = meta["cas"].as_u64().unwrap();
    assert_ne!(cas, 0);
    assert_eq!(meta["bucket"], "b");

    let stored = harness.call("compA", "document.get", json!({"id": "doc1"})).await;
    let stored = stored.result.unwrap();
    assert_eq!(stored["ok"]["document"], json!({"raw": r#"{"k":"v"}"#}));
    assert_eq!(stored["ok"]["cas"].as_u64(), Some(cas));

    harness.provider.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetched_handle_is_consumed() {
    let harness = Harness::start();
    harness.attach("compA", "b", "cb://host").await;

    let submitted = harness
        .call("compA", "document.get_async", json!({"id": "doc1"}))
        .await;
    let handle = submitted.result.unwrap().as_str().unwrap().to_string();
    assert!(handle.starts_with("get.doc1."));

    harness.wait_ready("document.get_result.ready", &handle).await;
    let fetched = harness.host("document.get_result.get", json!({"handle": handle})).await;
    assert_eq!(fetched.result, Some(json!({"err": "not-found"})));

    let gone = harness.host("document.get_result.ready", json!({"handle": handle})).await;
    assert_eq!(gone.error.unwrap().code, -32004);
    let refetch = harness.host("document.get_result.get", json!({"handle": handle})).await;
    assert_eq!(refetch.error.unwrap().code, -32004);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callers_are_isolated_by_identity() {
    let harness = Harness::start();
    harness.attach("compA", "orders", "cb://host").await;
    harness.attach("compB", "users", "cb://host").await;

    let written = harness
        .call("compA", "document.insert", json!({"id": "doc1", "document": {"raw": "1"}}))
        .await;
    assert!(written.result.unwrap().get("ok").is_some());

    let other_bucket = harness.call("compB", "document.get", json!({"id": "doc1"})).await;
    assert_eq!(other_bucket.result, Some(json!({"err": "not-found"})));

    let stranger = harness.call("compC", "document.get", json!({"id": "doc1"})).await;
    let error = stranger.error.unwrap();
    assert_eq!(error.code, -32002);
    assert_eq!(error.data, Some(json!({"kind": "unlinked-source"})));

    let anonymous = harness.host("document.get", json!({"id": "doc1"})).await;
    assert_eq!(anonymous.error.unwrap().code, -32001);

    let detached = harness
        .host("provider.link_del", json!({"source_id": "compA", "link_name": "default"}))
        .await;
    assert_eq!(detached.result, Some(Value::Null));
    let after_detach = harness.call("compA", "document.get", json!({"id": "doc1"})).await;
    assert_eq!(after_detach.error.unwrap().code, -32002);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_cluster_soft_fails() {
    let harness = Harness::start();
    harness.attach("compA", "b", "cb://down").await;

    let get = harness.call("compA", "document.get", json!({"id": "doc1"})).await;
    assert_eq!(get.result, Some(json!({"err": "other"})));

    let kv = harness
        .call("compA", "keyvalue.store.get", json!({"bucket": "b", "key": "k"}))
        .await;
    assert_eq!(kv.result, Some(json!({"err": {"other": "unavailable"}})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keyvalue_store_and_counter() {
    let harness = Harness::start();
    harness.attach("compA", "b", "cb://host").await;

    let set = harness
        .call(
            "compA",
            "keyvalue.store.set",
            json!({"bucket": "ignored", "key": "greeting", "value": [104, 105]}),
        )
        .await;
    assert_eq!(set.result, Some(json!({"ok": null})));

    let exists = harness
        .call("compA", "keyvalue.store.exists", json!({"bucket": "ignored", "key": "greeting"}))
        .await;
    assert_eq!(exists.result, Some(json!({"ok": true})));

    let deleted = harness
        .call("compA", "keyvalue.store.delete", json!({"bucket": "ignored", "key": "greeting"}))
        .await;
    assert_eq!(deleted.result, Some(json!({"ok": null})));

    let missing = harness
        .call("compA", "keyvalue.store.get", json!({"bucket": "ignored", "key": "greeting"}))
        .await;
    assert_eq!(missing.result, Some(json!({"ok": null})));

    for expected in [4, 8, 12] {
        let counter = harness
            .call(
                "compA",
                "keyvalue.atomics.increment",
                json!({"bucket": "ignored", "key": "hits", "delta": 4}),
            )
            .await;
        assert_eq!(counter.result, Some(json!({"ok": expected})));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_clears_links() {
    let harness = Harness::start();
    harness.attach("compA", "b", "cb://host").await;

    let health = harness.host("provider.health", Value::Null).await;
    assert_eq!(health.result, Some(json!("provider healthy")));

    let ack = harness.host("provider.shutdown", Value::Null).await;
    assert_eq!(ack.result, Some(json!("ack")));

    let after = harness.call("compA", "document.get", json!({"id": "doc1"})).await;
    assert_eq!(after.error.unwrap().code, -32002);
}
