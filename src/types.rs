use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{self, BackendError};

/// Wire shape of a typed operation outcome: `{"ok": ...}` or `{"err": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome<T, E> {
    Ok(T),
    Err(E),
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => Outcome::Err(err),
        }
    }
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Document body exchanged with callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Document {
    /// Stored verbatim
    Raw(String),
    /// Serialized to JSON before storing
    Json(Value),
}

impl Document {
    pub fn to_bytes(&self) -> DocumentResult<Vec<u8>> {
        match self {
            Document::Raw(raw) => Ok(raw.as_bytes().to_vec()),
            Document::Json(value) => serde_json::to_vec(value).map_err(|_| DocumentError::NotJson),
        }
    }

    /// Stored content is handed back raw; it must be valid UTF-8
    pub fn from_bytes(bytes: Vec<u8>) -> DocumentResult<Self> {
        String::from_utf8(bytes)
            .map(Document::Raw)
            .map_err(|_| DocumentError::NotJson)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentError {
    #[error("document not found")]
    NotFound,
    #[error("document already exists")]
    AlreadyExists,
    #[error("document is not valid content")]
    NotJson,
    #[error("invalid value")]
    InvalidValue,
    #[error("backend failure")]
    Other,
}

impl From<&BackendError> for DocumentError {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::DocumentNotFound => DocumentError::NotFound,
            BackendError::DocumentExists => DocumentError::AlreadyExists,
            BackendError::Decoding(_) => DocumentError::NotJson,
            BackendError::InvalidArgument(_) => DocumentError::InvalidValue,
            _ => DocumentError::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationMetadata {
    pub cas: u64,
    pub bucket: String,
    pub partition_id: u16,
    pub partition_uuid: u64,
    pub seq: u64,
}

impl From<backend::MutationResult> for MutationMetadata {
    fn from(result: backend::MutationResult) -> Self {
        Self {
            cas: result.cas,
            bucket: result.token.bucket_name,
            partition_id: result.token.partition_id,
            partition_uuid: result.token.partition_uuid,
            seq: result.token.sequence_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGetResult {
    pub document: Document,
    pub cas: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_ns: Option<u64>,
}

impl TryFrom<backend::GetResult> for DocumentGetResult {
    type Error = DocumentError;

    fn try_from(result: backend::GetResult) -> DocumentResult<Self> {
        Ok(Self {
            document: Document::from_bytes(result.content)?,
            cas: result.cas,
            expires_in_ns: result.expires_in.map(|d| d.as_nanos() as u64),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGetReplicaResult {
    pub document: Document,
    pub cas: u64,
    pub is_replica: bool,
}

impl TryFrom<backend::GetReplicaResult> for DocumentGetReplicaResult {
    type Error = DocumentError;

    fn try_from(result: backend::GetReplicaResult) -> DocumentResult<Self> {
        Ok(Self {
            document: Document::from_bytes(result.content)?,
            cas: result.cas,
            is_replica: result.is_replica,
        })
    }
}

fn nanos(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_nanos)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentGetOptions {
    pub timeout_ns: Option<u64>,
    pub with_expiry: bool,
    pub project: Vec<String>,
}

impl From<&DocumentGetOptions> for backend::GetOptions {
    fn from(o: &DocumentGetOptions) -> Self {
        Self {
            timeout: nanos(o.timeout_ns),
            with_expiry: o.with_expiry,
            project: o.project.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentInsertOptions {
    pub timeout_ns: Option<u64>,
    pub expires_in_ns: Option<u64>,
}

impl From<&DocumentInsertOptions> for backend::MutateOptions {
    fn from(o: &DocumentInsertOptions) -> Self {
        Self {
            timeout: nanos(o.timeout_ns),
            expiry: nanos(o.expires_in_ns),
            cas: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentUpsertOptions {
    pub timeout_ns: Option<u64>,
    pub expires_in_ns: Option<u64>,
}

impl From<&DocumentUpsertOptions> for backend::MutateOptions {
    fn from(o: &DocumentUpsertOptions) -> Self {
        Self {
            timeout: nanos(o.timeout_ns),
            expiry: nanos(o.expires_in_ns),
            cas: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentReplaceOptions {
    pub timeout_ns: Option<u64>,
    pub expires_in_ns: Option<u64>,
    pub cas: Option<u64>,
}

impl From<&DocumentReplaceOptions> for backend::MutateOptions {
    fn from(o: &DocumentReplaceOptions) -> Self {
        Self {
            timeout: nanos(o.timeout_ns),
            expiry: nanos(o.expires_in_ns),
            cas: o.cas,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentRemoveOptions {
    pub timeout_ns: Option<u64>,
    pub cas: Option<u64>,
}

impl From<&DocumentRemoveOptions> for backend::MutateOptions {
    fn from(o: &DocumentRemoveOptions) -> Self {
        Self {
            timeout: nanos(o.timeout_ns),
            expiry: None,
            cas: o.cas,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentTouchOptions {
    pub timeout_ns: Option<u64>,
    pub expires_in_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentGetAndTouchOptions {
    pub timeout_ns: Option<u64>,
    pub expires_in_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentGetAndLockOptions {
    pub timeout_ns: Option<u64>,
    pub lock_time_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentUnlockOptions {
    pub timeout_ns: Option<u64>,
    pub cas: u64,
}

/// Options for get-all-replicas and get-any-replica
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentReplicaOptions {
    pub timeout_ns: Option<u64>,
}

/// Anything whose only translated option is a timeout
pub trait TimeoutOption {
    fn timeout_ns(&self) -> Option<u64>;

    fn timeout_options(&self) -> backend::TimeoutOptions {
        backend::TimeoutOptions {
            timeout: nanos(self.timeout_ns()),
        }
    }
}

macro_rules! impl_timeout_option {
    ($($ty:ty),*) => {
        $(impl TimeoutOption for $ty {
            fn timeout_ns(&self) -> Option<u64> {
                self.timeout_ns
            }
        })*
    };
}

impl_timeout_option!(
    DocumentTouchOptions,
    DocumentGetAndTouchOptions,
    DocumentGetAndLockOptions,
    DocumentUnlockOptions,
    DocumentReplicaOptions
);

/// Errors of the key-value store and atomics interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "kebab-case")]
pub enum StoreError {
    #[error("no such store")]
    NoSuchStore,
    #[error("access denied")]
    AccessDenied,
    #[error("{0}")]
    Other(String),
}

pub type AtomicsError = StoreError;

impl From<&BackendError> for StoreError {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::AuthenticationFailure => StoreError::AccessDenied,
            other => StoreError::Other(other.kind().to_string()),
        }
    }
}

/// A page of keys from list-keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResponse {
    pub keys: Vec<String>,
    pub cursor: Option<u64>,
}
