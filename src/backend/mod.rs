//! Backend client facade
//!
//! Synchronous document/key-value operations against a bucket collection.
//! Every call blocks the calling thread until the backend answers or its own
//! timeout elapses; callers on an async runtime must move calls onto the
//! blocking pool.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryConnector;

use crate::link::ConnectionArgs;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Typed failures reported by the backend client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("document not found")]
    DocumentNotFound,

    #[error("document already exists")]
    DocumentExists,

    #[error("document is locked")]
    DocumentLocked,

    #[error("document is not locked")]
    DocumentNotLocked,

    #[error("cas mismatch")]
    CasMismatch,

    #[error("decoding failure: {0}")]
    Decoding(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authentication failure")]
    AuthenticationFailure,

    #[error("operation timed out")]
    Timeout,

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Short stable name, free of backend-specific detail
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::DocumentNotFound => "document-not-found",
            BackendError::DocumentExists => "document-exists",
            BackendError::DocumentLocked => "document-locked",
            BackendError::DocumentNotLocked => "document-not-locked",
            BackendError::CasMismatch => "cas-mismatch",
            BackendError::Decoding(_) => "decoding-failure",
            BackendError::InvalidArgument(_) => "invalid-argument",
            BackendError::AuthenticationFailure => "authentication-failure",
            BackendError::Timeout => "timeout",
            BackendError::Unavailable(_) => "unavailable",
        }
    }
}

/// Options for plain reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    pub timeout: Option<Duration>,
    pub with_expiry: bool,
    /// Dotted paths to project; empty means the full document
    pub project: Vec<String>,
}

/// Options shared by insert/upsert/replace/remove
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutateOptions {
    pub timeout: Option<Duration>,
    pub expiry: Option<Duration>,
    /// Optimistic concurrency token; `None` or `Some(0)` skips the check
    pub cas: Option<u64>,
}

/// Options for operations that only take a timeout
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeoutOptions {
    pub timeout: Option<Duration>,
}

/// Options for counter increments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncrementOptions {
    pub timeout: Option<Duration>,
    pub delta: u64,
    /// Value stored when the counter does not exist yet
    pub initial: Option<u64>,
    pub expiry: Option<Duration>,
}

/// Identifies a single mutation for consistency tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationToken {
    pub bucket_name: String,
    pub partition_id: u16,
    pub partition_uuid: u64,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub token: MutationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub content: Vec<u8>,
    pub cas: u64,
    /// Remaining lifetime; only populated when requested
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReplicaResult {
    pub content: Vec<u8>,
    pub cas: u64,
    pub is_replica: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterResult {
    pub content: u64,
    pub cas: u64,
    pub token: MutationToken,
}

/// A connection to one bucket/scope/collection
#[cfg_attr(test, mockall::automock)]
pub trait Collection: Send + Sync {
    fn get(&self, id: &str, options: &GetOptions) -> BackendResult<GetResult>;
    fn exists(&self, id: &str, options: &TimeoutOptions) -> BackendResult<bool>;
    fn insert(&self, id: &str, content: &[u8], options: &MutateOptions) -> BackendResult<MutationResult>;
    fn upsert(&self, id: &str, content: &[u8], options: &MutateOptions) -> BackendResult<MutationResult>;
    fn replace(&self, id: &str, content: &[u8], options: &MutateOptions) -> BackendResult<MutationResult>;
    fn remove(&self, id: &str, options: &MutateOptions) -> BackendResult<MutationResult>;
    fn touch(&self, id: &str, expiry: Duration, options: &TimeoutOptions) -> BackendResult<MutationResult>;
    /// A zero `lock_time` locks for the backend default duration
    fn get_and_lock(&self, id: &str, lock_time: Duration, options: &TimeoutOptions) -> BackendResult<GetResult>;
    fn get_and_touch(&self, id: &str, expiry: Duration, options: &TimeoutOptions) -> BackendResult<GetResult>;
    fn unlock(&self, id: &str, cas: u64, options: &TimeoutOptions) -> BackendResult<()>;
    fn get_all_replicas(&self, id: &str, options: &TimeoutOptions) -> BackendResult<Vec<GetReplicaResult>>;
    fn get_any_replica(&self, id: &str, options: &TimeoutOptions) -> BackendResult<GetReplicaResult>;
    fn increment(&self, id: &str, options: &IncrementOptions) -> BackendResult<CounterResult>;
}

/// An opened bucket
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Block until the bucket can serve requests or `timeout` elapses
    fn wait_until_ready(&self, timeout: Duration) -> BackendResult<()>;

    fn default_collection(&self) -> Arc<dyn Collection>;

    fn collection(&self, scope: &str, collection: &str) -> Arc<dyn Collection>;
}

/// Establishes bucket connections from validated link config
pub trait Connector: Send + Sync {
    fn connect(&self, args: &ConnectionArgs) -> BackendResult<Arc<dyn Bucket>>;
}

/// Stand-in for a connection that could not be established.
///
/// Every operation fails with [`BackendError::Unavailable`] carrying the
/// underlying connect failure.
#[derive(Debug, Clone)]
pub struct UnavailableCollection {
    reason: String,
}

impl UnavailableCollection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    fn fail<T>(&self) -> BackendResult<T> {
        Err(BackendError::Unavailable(self.reason.clone()))
    }
}

impl Collection for UnavailableCollection {
    fn get(&self, _id: &str, _options: &GetOptions) -> BackendResult<GetResult> {
        self.fail()
    }

    fn exists(&self, _id: &str, _options: &TimeoutOptions) -> BackendResult<bool> {
        self.fail()
    }

    fn insert(&self, _id: &str, _content: &[u8], _options: &MutateOptions) -> BackendResult<MutationResult> {
        self.fail()
    }

    fn upsert(&self, _id: &str, _content: &[u8], _options: &MutateOptions) -> BackendResult<MutationResult> {
        self.fail()
    }

    fn replace(&self, _id: &str, _content: &[u8], _options: &MutateOptions) -> BackendResult<MutationResult> {
        self.fail()
    }

    fn remove(&self, _id: &str, _options: &MutateOptions) -> BackendResult<MutationResult> {
        self.fail()
    }

    fn touch(&self, _id: &str, _expiry: Duration, _options: &TimeoutOptions) -> BackendResult<MutationResult> {
        self.fail()
    }

    fn get_and_lock(&self, _id: &str, _lock_time: Duration, _options: &TimeoutOptions) -> BackendResult<GetResult> {
        self.fail()
    }

    fn get_and_touch(&self, _id: &str, _expiry: Duration, _options: &TimeoutOptions) -> BackendResult<GetResult> {
        self.fail()
    }

    fn unlock(&self, _id: &str, _cas: u64, _options: &TimeoutOptions) -> BackendResult<()> {
        self.fail()
    }

    fn get_all_replicas(&self, _id: &str, _options: &TimeoutOptions) -> BackendResult<Vec<GetReplicaResult>> {
        self.fail()
    }

    fn get_any_replica(&self, _id: &str, _options: &TimeoutOptions) -> BackendResult<GetReplicaResult> {
        self.fail()
    }

    fn increment(&self, _id: &str, _options: &IncrementOptions) -> BackendResult<CounterResult> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_collection_fails_every_call() {
        let collection = UnavailableCollection::new("connection refused");
        let expected = BackendError::Unavailable("connection refused".to_string());

        assert_eq!(collection.get("a", &GetOptions::default()), Err(expected.clone()));
        assert_eq!(collection.exists("a", &TimeoutOptions::default()), Err(expected.clone()));
        assert_eq!(
            collection.upsert("a", b"{}", &MutateOptions::default()),
            Err(expected.clone())
        );
        assert_eq!(
            collection.increment("a", &IncrementOptions::default()),
            Err(expected)
        );
    }
}
