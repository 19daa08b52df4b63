//! Document operations and their async duals.

use std::time::Duration;

use log::{debug, error};

use super::Dispatcher;
use crate::backend::{BackendResult, Collection};
use crate::error::ProviderResult;
use crate::router::CallerIdentity;
use crate::types::{
    Document, DocumentError, DocumentGetAndLockOptions, DocumentGetAndTouchOptions,
    DocumentGetOptions, DocumentGetReplicaResult, DocumentGetResult, DocumentInsertOptions,
    DocumentRemoveOptions, DocumentReplaceOptions, DocumentReplicaOptions, DocumentResult,
    DocumentTouchOptions, DocumentUnlockOptions, DocumentUpsertOptions, MutationMetadata,
    TimeoutOption,
};

/// Normalise a backend outcome. The raw backend message is logged here and
/// goes no further.
fn translate<T>(op: &str, id: &str, result: BackendResult<T>) -> DocumentResult<T> {
    result.map_err(|e| {
        error!("Unable to {} document {}: {}", op, id, e);
        DocumentError::from(&e)
    })
}

fn get(collection: &dyn Collection, id: &str, options: &DocumentGetOptions) -> DocumentResult<DocumentGetResult> {
    let result = translate("get", id, collection.get(id, &options.into()))?;
    DocumentGetResult::try_from(result)
}

fn insert(
    collection: &dyn Collection,
    id: &str,
    document: &Document,
    options: &DocumentInsertOptions,
) -> DocumentResult<MutationMetadata> {
    let content = document.to_bytes()?;
    translate("insert", id, collection.insert(id, &content, &options.into())).map(Into::into)
}

fn upsert(
    collection: &dyn Collection,
    id: &str,
    document: &Document,
    options: &DocumentUpsertOptions,
) -> DocumentResult<MutationMetadata> {
    let content = document.to_bytes()?;
    translate("upsert", id, collection.upsert(id, &content, &options.into())).map(Into::into)
}

fn replace(
    collection: &dyn Collection,
    id: &str,
    document: &Document,
    options: &DocumentReplaceOptions,
) -> DocumentResult<MutationMetadata> {
    let content = document.to_bytes()?;
    translate("replace", id, collection.replace(id, &content, &options.into())).map(Into::into)
}

fn remove(collection: &dyn Collection, id: &str, options: &DocumentRemoveOptions) -> DocumentResult<MutationMetadata> {
    translate("remove", id, collection.remove(id, &options.into())).map(Into::into)
}

impl Dispatcher {
    pub fn get(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentGetOptions,
    ) -> ProviderResult<DocumentResult<DocumentGetResult>> {
        let collection = self.connection(identity)?;
        Ok(get(collection.as_ref(), id, options))
    }

    pub fn insert(
        &self,
        identity: &CallerIdentity,
        id: &str,
        document: &Document,
        options: &DocumentInsertOptions,
    ) -> ProviderResult<DocumentResult<MutationMetadata>> {
        let collection = self.connection(identity)?;
        Ok(insert(collection.as_ref(), id, document, options))
    }

    pub fn upsert(
        &self,
        identity: &CallerIdentity,
        id: &str,
        document: &Document,
        options: &DocumentUpsertOptions,
    ) -> ProviderResult<DocumentResult<MutationMetadata>> {
        let collection = self.connection(identity)?;
        Ok(upsert(collection.as_ref(), id, document, options))
    }

    pub fn replace(
        &self,
        identity: &CallerIdentity,
        id: &str,
        document: &Document,
        options: &DocumentReplaceOptions,
    ) -> ProviderResult<DocumentResult<MutationMetadata>> {
        let collection = self.connection(identity)?;
        Ok(replace(collection.as_ref(), id, document, options))
    }

    pub fn remove(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentRemoveOptions,
    ) -> ProviderResult<DocumentResult<MutationMetadata>> {
        let collection = self.connection(identity)?;
        Ok(remove(collection.as_ref(), id, options))
    }

    pub fn touch(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentTouchOptions,
    ) -> ProviderResult<DocumentResult<MutationMetadata>> {
        let collection = self.connection(identity)?;
        let expiry = Duration::from_nanos(options.expires_in_ns);
        Ok(translate("touch", id, collection.touch(id, expiry, &options.timeout_options())).map(Into::into))
    }

    pub fn unlock(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentUnlockOptions,
    ) -> ProviderResult<DocumentResult<()>> {
        let collection = self.connection(identity)?;
        Ok(translate("unlock", id, collection.unlock(id, options.cas, &options.timeout_options())))
    }

    pub fn get_and_lock(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentGetAndLockOptions,
    ) -> ProviderResult<DocumentResult<DocumentGetResult>> {
        let collection = self.connection(identity)?;
        let lock_time = Duration::from_nanos(options.lock_time_ns);
        Ok(
            translate("lock", id, collection.get_and_lock(id, lock_time, &options.timeout_options()))
                .and_then(DocumentGetResult::try_from),
        )
    }

    pub fn get_and_touch(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentGetAndTouchOptions,
    ) -> ProviderResult<DocumentResult<DocumentGetResult>> {
        let collection = self.connection(identity)?;
        let expiry = Duration::from_nanos(options.expires_in_ns);
        Ok(
            translate("touch", id, collection.get_and_touch(id, expiry, &options.timeout_options()))
                .and_then(DocumentGetResult::try_from),
        )
    }

    pub fn get_all_replicas(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentReplicaOptions,
    ) -> ProviderResult<DocumentResult<Vec<DocumentGetReplicaResult>>> {
        let collection = self.connection(identity)?;
        Ok(
            translate("read replicas of", id, collection.get_all_replicas(id, &options.timeout_options()))
                .and_then(|replicas| {
                    replicas
                        .into_iter()
                        .map(DocumentGetReplicaResult::try_from)
                        .collect()
                }),
        )
    }

    pub fn get_any_replica(
        &self,
        identity: &CallerIdentity,
        id: &str,
        options: &DocumentReplicaOptions,
    ) -> ProviderResult<DocumentResult<DocumentGetReplicaResult>> {
        let collection = self.connection(identity)?;
        Ok(
            translate("read replica of", id, collection.get_any_replica(id, &options.timeout_options()))
                .and_then(DocumentGetReplicaResult::try_from),
        )
    }

    /// Start a get in the background and return its handle.
    ///
    /// The caller is authorised now; the work keeps the connection it
    /// resolved even if the link is detached before it runs.
    pub fn get_async(
        &self,
        identity: &CallerIdentity,
        id: String,
        options: DocumentGetOptions,
    ) -> ProviderResult<String> {
        let collection = self.connection(identity)?;
        let label = format!("get.{}", id);
        let handle = self
            .get_results
            .submit(&label, move || get(collection.as_ref(), &id, &options));
        debug!("Submitted {}", handle);
        Ok(handle)
    }

    pub fn insert_async(
        &self,
        identity: &CallerIdentity,
        id: String,
        document: Document,
        options: DocumentInsertOptions,
    ) -> ProviderResult<String> {
        let collection = self.connection(identity)?;
        let label = format!("insert.{}", id);
        Ok(self.mutation_results.submit(&label, move || {
            insert(collection.as_ref(), &id, &document, &options)
        }))
    }

    pub fn upsert_async(
        &self,
        identity: &CallerIdentity,
        id: String,
        document: Document,
        options: DocumentUpsertOptions,
    ) -> ProviderResult<String> {
        let collection = self.connection(identity)?;
        let label = format!("upsert.{}", id);
        Ok(self.mutation_results.submit(&label, move || {
            upsert(collection.as_ref(), &id, &document, &options)
        }))
    }

    pub fn replace_async(
        &self,
        identity: &CallerIdentity,
        id: String,
        document: Document,
        options: DocumentReplaceOptions,
    ) -> ProviderResult<String> {
        let collection = self.connection(identity)?;
        let label = format!("replace.{}", id);
        Ok(self.mutation_results.submit(&label, move || {
            replace(collection.as_ref(), &id, &document, &options)
        }))
    }

    pub fn remove_async(
        &self,
        identity: &CallerIdentity,
        id: String,
        options: DocumentRemoveOptions,
    ) -> ProviderResult<String> {
        let collection = self.connection(identity)?;
        let label = format!("remove.{}", id);
        Ok(self
            .mutation_results
            .submit(&label, move || remove(collection.as_ref(), &id, &options)))
    }

    pub fn get_result_ready(&self, handle: &str) -> ProviderResult<bool> {
        Ok(self.get_results.is_ready(handle)?)
    }

    /// Take a finished get result; the handle is gone afterwards
    pub fn get_result(&self, handle: &str) -> ProviderResult<DocumentResult<DocumentGetResult>> {
        Ok(self.get_results.fetch(handle)?)
    }

    pub fn mutation_result_ready(&self, handle: &str) -> ProviderResult<bool> {
        Ok(self.mutation_results.is_ready(handle)?)
    }

    /// Take a finished mutation result; the handle is gone afterwards
    pub fn mutation_result(&self, handle: &str) -> ProviderResult<DocumentResult<MutationMetadata>> {
        Ok(self.mutation_results.fetch(handle)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::linked_dispatcher;
    use super::*;
    use crate::error::ProviderError;
    use serde_json::json;
    use std::collections::HashSet;

    fn caller() -> CallerIdentity {
        CallerIdentity::new("compA")
    }

    fn raw(content: &str) -> Document {
        Document::Raw(content.to_string())
    }

    async fn wait_for<F: Fn() -> bool>(ready: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ready() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("async result never became ready");
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let dispatcher = linked_dispatcher();

        assert_eq!(
            dispatcher.get(&caller(), "doc1", &DocumentGetOptions::default()).unwrap(),
            Err(DocumentError::NotFound)
        );

        let meta = dispatcher
            .insert(&caller(), "doc1", &Document::Json(json!({"k": "v"})), &DocumentInsertOptions::default())
            .unwrap()
            .unwrap();
        assert_ne!(meta.cas, 0);
        assert_eq!(meta.bucket, "b");

        let fetched = dispatcher
            .get(&caller(), "doc1", &DocumentGetOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(fetched.document, raw(r#"{"k":"v"}"#));
        assert_eq!(fetched.cas, meta.cas);
        assert_eq!(fetched.expires_in_ns, None);

        assert_eq!(
            dispatcher
                .insert(&caller(), "doc1", &raw("{}"), &DocumentInsertOptions::default())
                .unwrap(),
            Err(DocumentError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_replace_and_remove_honour_cas() {
        let dispatcher = linked_dispatcher();
        let first = dispatcher
            .upsert(&caller(), "doc1", &raw("1"), &DocumentUpsertOptions::default())
            .unwrap()
            .unwrap();

        let stale = DocumentReplaceOptions {
            cas: Some(first.cas + 1),
            ..Default::default()
        };
        assert_eq!(
            dispatcher.replace(&caller(), "doc1", &raw("2"), &stale).unwrap(),
            Err(DocumentError::Other)
        );

        let current = DocumentReplaceOptions {
            cas: Some(first.cas),
            ..Default::default()
        };
        let second = dispatcher
            .replace(&caller(), "doc1", &raw("2"), &current)
            .unwrap()
            .unwrap();
        assert_ne!(second.cas, first.cas);

        dispatcher
            .remove(&caller(), "doc1", &DocumentRemoveOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(
            dispatcher
                .remove(&caller(), "doc1", &DocumentRemoveOptions::default())
                .unwrap(),
            Err(DocumentError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_lock_unlock_and_expiry() {
        let dispatcher = linked_dispatcher();
        dispatcher
            .upsert(&caller(), "doc1", &raw("{}"), &DocumentUpsertOptions::default())
            .unwrap()
            .unwrap();

        let locked = dispatcher
            .get_and_lock(
                &caller(),
                "doc1",
                &DocumentGetAndLockOptions {
                    lock_time_ns: Duration::from_secs(10).as_nanos() as u64,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            dispatcher
                .upsert(&caller(), "doc1", &raw("[]"), &DocumentUpsertOptions::default())
                .unwrap(),
            Err(DocumentError::Other)
        );

        let unlock = DocumentUnlockOptions {
            cas: locked.cas,
            ..Default::default()
        };
        assert_eq!(dispatcher.unlock(&caller(), "doc1", &unlock).unwrap(), Ok(()));

        let touched = dispatcher
            .get_and_touch(
                &caller(),
                "doc1",
                &DocumentGetAndTouchOptions {
                    expires_in_ns: Duration::from_secs(60).as_nanos() as u64,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(touched.document, raw("{}"));

        let with_expiry = dispatcher
            .get(
                &caller(),
                "doc1",
                &DocumentGetOptions {
                    with_expiry: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        let remaining = with_expiry.expires_in_ns.expect("expiry was requested");
        assert!(remaining > 0 && remaining <= Duration::from_secs(60).as_nanos() as u64);

        dispatcher
            .touch(&caller(), "doc1", &DocumentTouchOptions::default())
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_replica_reads() {
        let dispatcher = linked_dispatcher();
        dispatcher
            .upsert(&caller(), "doc1", &raw("{}"), &DocumentUpsertOptions::default())
            .unwrap()
            .unwrap();

        let replicas = dispatcher
            .get_all_replicas(&caller(), "doc1", &DocumentReplicaOptions::default())
            .unwrap()
            .unwrap();
        assert!(!replicas.is_empty());
        assert!(!replicas[0].is_replica);

        let any = dispatcher
            .get_any_replica(&caller(), "doc1", &DocumentReplicaOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(any.document, raw("{}"));

        assert_eq!(
            dispatcher
                .get_any_replica(&caller(), "missing", &DocumentReplicaOptions::default())
                .unwrap(),
            Err(DocumentError::NotFound)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upsert_async_then_get_async() {
        let dispatcher = linked_dispatcher();

        let handle = dispatcher
            .upsert_async(
                &caller(),
                "doc1".to_string(),
                Document::Json(json!({"k": "v"})),
                DocumentUpsertOptions::default(),
            )
            .unwrap();
        assert!(handle.starts_with("upsert.doc1."));

        wait_for(|| dispatcher.mutation_result_ready(&handle).unwrap()).await;
        let meta = dispatcher.mutation_result(&handle).unwrap().unwrap();
        assert_ne!(meta.cas, 0);
        assert!(matches!(
            dispatcher.mutation_result(&handle),
            Err(ProviderError::HandleNotFound(_))
        ));

        let handle = dispatcher
            .get_async(&caller(), "doc1".to_string(), DocumentGetOptions::default())
            .unwrap();
        wait_for(|| dispatcher.get_result_ready(&handle).unwrap()).await;
        let fetched = dispatcher.get_result(&handle).unwrap().unwrap();
        assert_eq!(fetched.cas, meta.cas);
        assert_eq!(fetched.document, raw(r#"{"k":"v"}"#));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_failures_are_typed_results() {
        let dispatcher = linked_dispatcher();

        let handle = dispatcher
            .remove_async(&caller(), "missing".to_string(), DocumentRemoveOptions::default())
            .unwrap();
        wait_for(|| dispatcher.mutation_result_ready(&handle).unwrap()).await;
        assert_eq!(dispatcher.mutation_result(&handle).unwrap(), Err(DocumentError::NotFound));

        let handle = dispatcher
            .replace_async(
                &caller(),
                "missing".to_string(),
                raw("{}"),
                DocumentReplaceOptions::default(),
            )
            .unwrap();
        wait_for(|| dispatcher.mutation_result_ready(&handle).unwrap()).await;
        assert_eq!(dispatcher.mutation_result(&handle).unwrap(), Err(DocumentError::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_async_inserts_stay_separate() {
        let dispatcher = linked_dispatcher();

        let handles: Vec<(usize, String)> = (0..32)
            .map(|i| {
                let handle = dispatcher
                    .insert_async(
                        &caller(),
                        format!("doc{}", i),
                        raw(&i.to_string()),
                        DocumentInsertOptions::default(),
                    )
                    .unwrap();
                (i, handle)
            })
            .collect();
        let distinct: HashSet<&String> = handles.iter().map(|(_, h)| h).collect();
        assert_eq!(distinct.len(), handles.len());

        for (_, handle) in &handles {
            wait_for(|| dispatcher.mutation_result_ready(handle).unwrap()).await;
            assert!(dispatcher.mutation_result(handle).unwrap().is_ok());
        }
        for (i, _) in &handles {
            let fetched = dispatcher
                .get(&caller(), &format!("doc{}", i), &DocumentGetOptions::default())
                .unwrap()
                .unwrap();
            assert_eq!(fetched.document, raw(&i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_handles_are_scoped_to_their_result_kind() {
        let dispatcher = linked_dispatcher();
        assert!(matches!(
            dispatcher.get_result_ready("no-such-handle"),
            Err(ProviderError::HandleNotFound(_))
        ));

        let handle = dispatcher
            .get_async(&caller(), "doc1".to_string(), DocumentGetOptions::default())
            .unwrap();
        assert!(matches!(
            dispatcher.mutation_result_ready(&handle),
            Err(ProviderError::HandleNotFound(_))
        ));
    }
}
