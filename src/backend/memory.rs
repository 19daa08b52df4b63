//! In-process document store implementing the backend traits.
//!
//! Clusters are keyed by the host part of the connection string, so two links
//! pointing at the same address and bucket observe the same documents. Calls
//! answer immediately; operation timeouts never elapse.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::debug;
use regex::Regex;
use serde_json::{Map, Value};

use super::{
    BackendError, BackendResult, Bucket, Collection, Connector, CounterResult, GetOptions,
    GetReplicaResult, GetResult, IncrementOptions, MutateOptions, MutationResult, MutationToken,
    TimeoutOptions, UnavailableCollection,
};
use crate::link::ConnectionArgs;

const NUM_PARTITIONS: u16 = 1024;
const DEFAULT_SCOPE: &str = "_default";
const DEFAULT_COLLECTION: &str = "_default";
/// Lock duration used when a caller asks for a zero lock time
const DEFAULT_LOCK_TIME: Duration = Duration::from_secs(15);

/// Connection strings look like `couchbase://host[,host2][?params]`
const CONNECTION_STRING_PATTERN: &str = r"^(couchbases?|cb|mem)://([^/?]+)";

/// Connector for the in-process store
pub struct MemoryConnector {
    clusters: Mutex<HashMap<String, Arc<MemoryCluster>>>,
    connection_pattern: Regex,
    credentials: Option<(String, String)>,
    unreachable_hosts: HashSet<String>,
    replicas: usize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            connection_pattern: Regex::new(CONNECTION_STRING_PATTERN)
                .expect("connection string pattern is a valid regex"),
            credentials: None,
            unreachable_hosts: HashSet::new(),
            replicas: 1,
        }
    }

    /// Only accept connections authenticating with these credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Buckets on `host` never become ready and reject every operation
    pub fn with_unreachable_host(mut self, host: impl Into<String>) -> Self {
        self.unreachable_hosts.insert(host.into());
        self
    }

    /// Number of replica copies reported by replica reads
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    fn parse_host<'a>(&self, connection_string: &'a str) -> BackendResult<&'a str> {
        self.connection_pattern
            .captures(connection_string)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str())
            .ok_or_else(|| {
                BackendError::InvalidArgument(format!(
                    "unsupported connection string: {}",
                    connection_string
                ))
            })
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, args: &ConnectionArgs) -> BackendResult<Arc<dyn Bucket>> {
        let host = self.parse_host(&args.connection_string)?;

        if let Some((username, password)) = &self.credentials {
            if *username != args.username || *password != args.password {
                return Err(BackendError::AuthenticationFailure);
            }
        }

        let cluster = {
            let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
            clusters
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(MemoryCluster::default()))
                .clone()
        };

        debug!("Connected to in-process cluster {} bucket {}", host, args.bucket_name);
        Ok(Arc::new(MemoryBucket {
            state: cluster.bucket(&args.bucket_name, self.replicas),
            reachable: !self.unreachable_hosts.contains(host),
        }))
    }
}

#[derive(Default)]
struct MemoryCluster {
    buckets: Mutex<HashMap<String, Arc<BucketState>>>,
}

impl MemoryCluster {
    fn bucket(&self, name: &str, replicas: usize) -> Arc<BucketState> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BucketState::new(name, replicas)))
            .clone()
    }
}

struct BucketState {
    name: String,
    partition_uuid: u64,
    replicas: usize,
    cas_clock: AtomicU64,
    seqnos: Mutex<Vec<u64>>,
    collections: Mutex<HashMap<(String, String), Arc<RwLock<HashMap<String, StoredDoc>>>>>,
}

impl BucketState {
    fn new(name: &str, replicas: usize) -> Self {
        Self {
            name: name.to_string(),
            partition_uuid: rand::random::<u64>(),
            replicas,
            cas_clock: AtomicU64::new(u64::from(rand::random::<u32>()) + 1),
            seqnos: Mutex::new(vec![0; NUM_PARTITIONS as usize]),
            collections: Mutex::new(HashMap::new()),
        }
    }

    fn next_cas(&self) -> u64 {
        self.cas_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn mutation_token(&self, id: &str) -> MutationToken {
        let partition_id = partition_for(id);
        let mut seqnos = self.seqnos.lock().unwrap_or_else(|e| e.into_inner());
        let seqno = &mut seqnos[partition_id as usize];
        *seqno += 1;
        MutationToken {
            bucket_name: self.name.clone(),
            partition_id,
            partition_uuid: self.partition_uuid,
            sequence_number: *seqno,
        }
    }

    fn documents(&self, scope: &str, collection: &str) -> Arc<RwLock<HashMap<String, StoredDoc>>> {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections
            .entry((scope.to_string(), collection.to_string()))
            .or_default()
            .clone()
    }
}

fn partition_for(id: &str) -> u16 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % u64::from(NUM_PARTITIONS)) as u16
}

struct MemoryBucket {
    state: Arc<BucketState>,
    reachable: bool,
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn wait_until_ready(&self, timeout: Duration) -> BackendResult<()> {
        if self.reachable {
            return Ok(());
        }
        std::thread::sleep(timeout);
        Err(BackendError::Timeout)
    }

    fn default_collection(&self) -> Arc<dyn Collection> {
        self.collection(DEFAULT_SCOPE, DEFAULT_COLLECTION)
    }

    fn collection(&self, scope: &str, collection: &str) -> Arc<dyn Collection> {
        if !self.reachable {
            return Arc::new(UnavailableCollection::new(format!(
                "bucket {} is unreachable",
                self.state.name
            )));
        }
        Arc::new(MemoryCollection {
            bucket: self.state.clone(),
            docs: self.state.documents(scope, collection),
        })
    }
}

#[derive(Debug, Clone)]
struct StoredDoc {
    content: Vec<u8>,
    cas: u64,
    expires_at: Option<Instant>,
    locked_until: Option<Instant>,
}

impl StoredDoc {
    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.map_or(false, |until| until > now)
    }

    fn expires_in(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// A locked document only accepts mutations carrying its lock CAS
    fn check_mutable(&self, cas: Option<u64>, now: Instant) -> BackendResult<()> {
        let cas = cas.filter(|cas| *cas != 0);
        if self.is_locked(now) {
            return match cas {
                Some(cas) if cas == self.cas => Ok(()),
                _ => Err(BackendError::DocumentLocked),
            };
        }
        match cas {
            Some(cas) if cas != self.cas => Err(BackendError::CasMismatch),
            _ => Ok(()),
        }
    }
}

fn expiry_deadline(expiry: Option<Duration>, now: Instant) -> Option<Instant> {
    expiry.filter(|d| !d.is_zero()).map(|d| now + d)
}

/// Drop the document if it has expired, then return the live entry
fn live<'a>(docs: &'a mut HashMap<String, StoredDoc>, id: &str, now: Instant) -> Option<&'a mut StoredDoc> {
    let expired = docs
        .get(id)
        .and_then(|doc| doc.expires_at)
        .map_or(false, |at| at <= now);
    if expired {
        docs.remove(id);
    }
    docs.get_mut(id)
}

struct MemoryCollection {
    bucket: Arc<BucketState>,
    docs: Arc<RwLock<HashMap<String, StoredDoc>>>,
}

impl MemoryCollection {
    fn write_docs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StoredDoc>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn store(
        &self,
        docs: &mut HashMap<String, StoredDoc>,
        id: &str,
        content: &[u8],
        expiry: Option<Duration>,
        now: Instant,
    ) -> MutationResult {
        let cas = self.bucket.next_cas();
        docs.insert(
            id.to_string(),
            StoredDoc {
                content: content.to_vec(),
                cas,
                expires_at: expiry_deadline(expiry, now),
                locked_until: None,
            },
        );
        MutationResult {
            cas,
            token: self.bucket.mutation_token(id),
        }
    }

    fn replica_results(&self, doc: &StoredDoc) -> Vec<GetReplicaResult> {
        (0..=self.bucket.replicas)
            .map(|i| GetReplicaResult {
                content: doc.content.clone(),
                cas: doc.cas,
                is_replica: i > 0,
            })
            .collect()
    }
}

impl Collection for MemoryCollection {
    fn get(&self, id: &str, options: &GetOptions) -> BackendResult<GetResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;

        let content = if options.project.is_empty() {
            doc.content.clone()
        } else {
            project(&doc.content, &options.project)?
        };
        Ok(GetResult {
            content,
            cas: doc.cas,
            expires_in: if options.with_expiry { doc.expires_in(now) } else { None },
        })
    }

    fn exists(&self, id: &str, _options: &TimeoutOptions) -> BackendResult<bool> {
        let mut docs = self.write_docs();
        Ok(live(&mut docs, id, Instant::now()).is_some())
    }

    fn insert(&self, id: &str, content: &[u8], options: &MutateOptions) -> BackendResult<MutationResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        if live(&mut docs, id, now).is_some() {
            return Err(BackendError::DocumentExists);
        }
        Ok(self.store(&mut docs, id, content, options.expiry, now))
    }

    fn upsert(&self, id: &str, content: &[u8], options: &MutateOptions) -> BackendResult<MutationResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        if let Some(doc) = live(&mut docs, id, now) {
            if doc.is_locked(now) {
                return Err(BackendError::DocumentLocked);
            }
        }
        Ok(self.store(&mut docs, id, content, options.expiry, now))
    }

    fn replace(&self, id: &str, content: &[u8], options: &MutateOptions) -> BackendResult<MutationResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;
        doc.check_mutable(options.cas, now)?;
        Ok(self.store(&mut docs, id, content, options.expiry, now))
    }

    fn remove(&self, id: &str, options: &MutateOptions) -> BackendResult<MutationResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;
        doc.check_mutable(options.cas, now)?;
        docs.remove(id);
        Ok(MutationResult {
            cas: self.bucket.next_cas(),
            token: self.bucket.mutation_token(id),
        })
    }

    fn touch(&self, id: &str, expiry: Duration, _options: &TimeoutOptions) -> BackendResult<MutationResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;
        if doc.is_locked(now) {
            return Err(BackendError::DocumentLocked);
        }
        doc.expires_at = expiry_deadline(Some(expiry), now);
        doc.cas = self.bucket.next_cas();
        Ok(MutationResult {
            cas: doc.cas,
            token: self.bucket.mutation_token(id),
        })
    }

    fn get_and_lock(&self, id: &str, lock_time: Duration, _options: &TimeoutOptions) -> BackendResult<GetResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;
        if doc.is_locked(now) {
            return Err(BackendError::DocumentLocked);
        }
        let lock_time = if lock_time.is_zero() { DEFAULT_LOCK_TIME } else { lock_time };
        doc.locked_until = Some(now + lock_time);
        doc.cas = self.bucket.next_cas();
        Ok(GetResult {
            content: doc.content.clone(),
            cas: doc.cas,
            expires_in: None,
        })
    }

    fn get_and_touch(&self, id: &str, expiry: Duration, _options: &TimeoutOptions) -> BackendResult<GetResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;
        if doc.is_locked(now) {
            return Err(BackendError::DocumentLocked);
        }
        doc.expires_at = expiry_deadline(Some(expiry), now);
        doc.cas = self.bucket.next_cas();
        Ok(GetResult {
            content: doc.content.clone(),
            cas: doc.cas,
            expires_in: doc.expires_in(now),
        })
    }

    fn unlock(&self, id: &str, cas: u64, _options: &TimeoutOptions) -> BackendResult<()> {
        let now = Instant::now();
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, now).ok_or(BackendError::DocumentNotFound)?;
        if !doc.is_locked(now) {
            return Err(BackendError::DocumentNotLocked);
        }
        if doc.cas != cas {
            return Err(BackendError::CasMismatch);
        }
        doc.locked_until = None;
        Ok(())
    }

    fn get_all_replicas(&self, id: &str, _options: &TimeoutOptions) -> BackendResult<Vec<GetReplicaResult>> {
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, Instant::now()).ok_or(BackendError::DocumentNotFound)?;
        Ok(self.replica_results(doc))
    }

    fn get_any_replica(&self, id: &str, _options: &TimeoutOptions) -> BackendResult<GetReplicaResult> {
        let mut docs = self.write_docs();
        let doc = live(&mut docs, id, Instant::now()).ok_or(BackendError::DocumentNotFound)?;
        Ok(GetReplicaResult {
            content: doc.content.clone(),
            cas: doc.cas,
            is_replica: false,
        })
    }

    fn increment(&self, id: &str, options: &IncrementOptions) -> BackendResult<CounterResult> {
        let now = Instant::now();
        let mut docs = self.write_docs();

        let value = match live(&mut docs, id, now) {
            Some(doc) => {
                if doc.is_locked(now) {
                    return Err(BackendError::DocumentLocked);
                }
                let current = std::str::from_utf8(&doc.content)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        BackendError::InvalidArgument("document value is not a counter".to_string())
                    })?;
                current.wrapping_add(options.delta)
            }
            None => options.initial.ok_or(BackendError::DocumentNotFound)?,
        };

        let result = self.store(&mut docs, id, value.to_string().as_bytes(), options.expiry, now);
        Ok(CounterResult {
            content: value,
            cas: result.cas,
            token: result.token,
        })
    }
}

/// Keep only the dotted `paths` of a JSON document
fn project(content: &[u8], paths: &[String]) -> BackendResult<Vec<u8>> {
    let source: Value = serde_json::from_slice(content)
        .map_err(|e| BackendError::Decoding(format!("projection requires a JSON document: {}", e)))?;

    let mut projected = Map::new();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        let mut cursor = &source;
        let mut found = true;
        for segment in &segments {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            insert_path(&mut projected, &segments, cursor.clone());
        }
    }

    serde_json::to_vec(&Value::Object(projected))
        .map_err(|e| BackendError::Decoding(e.to_string()))
}

fn insert_path(target: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            target.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let child = target
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}
