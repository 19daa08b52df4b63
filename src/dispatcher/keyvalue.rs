//! Key-value store and atomics over the caller's linked collection.
//!
//! The `bucket` argument callers pass is informational only; the store is
//! whatever collection the link was configured with.

use log::{debug, error, warn};

use super::Dispatcher;
use crate::backend::{BackendError, GetOptions, IncrementOptions, MutateOptions, TimeoutOptions};
use crate::error::ProviderResult;
use crate::router::CallerIdentity;
use crate::types::{AtomicsError, KeyResponse, StoreError};

fn store_error(op: &str, key: &str, err: BackendError) -> StoreError {
    error!("Unable to {} key {}: {}", op, key, err);
    StoreError::from(&err)
}

impl Dispatcher {
    /// Raw stored bytes, or `None` if the key is absent
    pub fn store_get(
        &self,
        identity: &CallerIdentity,
        bucket: &str,
        key: &str,
    ) -> ProviderResult<Result<Option<Vec<u8>>, StoreError>> {
        let collection = self.connection(identity)?;
        debug!("Reading key {} from store {}", key, bucket);
        Ok(match collection.get(key, &GetOptions::default()) {
            Ok(result) => Ok(Some(result.content)),
            Err(BackendError::DocumentNotFound) => Ok(None),
            Err(e) => Err(store_error("get", key, e)),
        })
    }

    pub fn store_set(
        &self,
        identity: &CallerIdentity,
        bucket: &str,
        key: &str,
        value: &[u8],
    ) -> ProviderResult<Result<(), StoreError>> {
        let collection = self.connection(identity)?;
        debug!("Writing key {} to store {}", key, bucket);
        Ok(collection
            .upsert(key, value, &MutateOptions::default())
            .map(|_| ())
            .map_err(|e| store_error("set", key, e)))
    }

    /// Deleting an absent key succeeds
    pub fn store_delete(
        &self,
        identity: &CallerIdentity,
        bucket: &str,
        key: &str,
    ) -> ProviderResult<Result<(), StoreError>> {
        let collection = self.connection(identity)?;
        debug!("Deleting key {} from store {}", key, bucket);
        Ok(match collection.remove(key, &MutateOptions::default()) {
            Ok(_) | Err(BackendError::DocumentNotFound) => Ok(()),
            Err(e) => Err(store_error("delete", key, e)),
        })
    }

    pub fn store_exists(
        &self,
        identity: &CallerIdentity,
        bucket: &str,
        key: &str,
    ) -> ProviderResult<Result<bool, StoreError>> {
        let collection = self.connection(identity)?;
        debug!("Checking key {} in store {}", key, bucket);
        Ok(collection
            .exists(key, &TimeoutOptions::default())
            .map_err(|e| store_error("check", key, e)))
    }

    /// Key listing is not offered by the backend
    pub fn store_list_keys(
        &self,
        identity: &CallerIdentity,
        bucket: &str,
        _cursor: Option<u64>,
    ) -> ProviderResult<Result<KeyResponse, StoreError>> {
        self.connection(identity)?;
        warn!("Received request to list keys of store {}", bucket);
        Ok(Err(StoreError::Other("list-keys operation not supported".to_string())))
    }

    /// Add `delta` to a counter; a missing counter starts at `delta`
    pub fn increment(
        &self,
        identity: &CallerIdentity,
        bucket: &str,
        key: &str,
        delta: u64,
    ) -> ProviderResult<Result<u64, AtomicsError>> {
        let collection = self.connection(identity)?;
        debug!("Incrementing key {} in store {} by {}", key, bucket, delta);
        let options = IncrementOptions {
            delta,
            initial: Some(delta),
            ..Default::default()
        };
        Ok(collection
            .increment(key, &options)
            .map(|counter| counter.content)
            .map_err(|e| store_error("increment", key, e)))
    }
}
