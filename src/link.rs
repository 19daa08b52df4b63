//! Link definitions delivered by the host and the connection config they carry.

use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};

/// A secret delivered alongside link config
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum SecretValue {
    String(String),
    Bytes(Vec<u8>),
}

impl SecretValue {
    /// The secret as text, if it is representable as such
    pub fn reveal(&self) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s.as_str()),
            SecretValue::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Association between a calling component and this provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDefinition {
    pub source_id: String,
    pub link_name: String,
    #[serde(default)]
    pub target_config: HashMap<String, String>,
    #[serde(default)]
    pub target_secrets: HashMap<String, SecretValue>,
}

/// Validated parameters for connecting a link to its bucket
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub username: String,
    pub password: String,
    pub bucket_name: String,
    pub connection_string: String,
    pub scope_name: Option<String>,
    pub collection_name: Option<String>,
}

impl fmt::Debug for ConnectionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionArgs")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("connection_string", &self.connection_string)
            .field("scope_name", &self.scope_name)
            .field("collection_name", &self.collection_name)
            .finish()
    }
}

impl ConnectionArgs {
    /// Build connection args from link config and secrets.
    ///
    /// `username`, `password`, `bucketName` and `connectionString` are
    /// required; `scopeName` and `collectionName` are optional.
    pub fn from_link(
        config: &HashMap<String, String>,
        secrets: &HashMap<String, SecretValue>,
    ) -> ProviderResult<Self> {
        let required = |key: &str, what: &str| {
            get_config_value(config, secrets, key)
                .ok_or_else(|| ProviderError::ConfigInvalid(format!("{} {} is required", key, what)))
        };

        Ok(Self {
            username: required("username", "config")?,
            password: required("password", "secret")?,
            bucket_name: required("bucketName", "config")?,
            connection_string: required("connectionString", "config")?,
            scope_name: get_config_value(config, secrets, "scopeName"),
            collection_name: get_config_value(config, secrets, "collectionName"),
        })
    }

    /// The (scope, collection) pair to open, or `None` for the default collection.
    ///
    /// Providing only one of the two falls back to the default collection.
    pub fn keyspace(&self) -> Option<(&str, &str)> {
        match (&self.scope_name, &self.collection_name) {
            (Some(scope), Some(collection)) => Some((scope.as_str(), collection.as_str())),
            (None, None) => None,
            _ => {
                warn!("scopeName and collectionName must be provided together, using default collection");
                None
            }
        }
    }
}

/// Look up `key` in secrets first, then config. Empty values count as missing.
pub fn get_config_value(
    config: &HashMap<String, String>,
    secrets: &HashMap<String, SecretValue>,
    key: &str,
) -> Option<String> {
    if let Some(secret) = secrets.get(key).and_then(SecretValue::reveal) {
        if !secret.is_empty() {
            return Some(secret.to_string());
        }
    }
    config
        .get(key)
        .filter(|value| !value.is_empty())
        .cloned()
}
