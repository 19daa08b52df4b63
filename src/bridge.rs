//! Async result bridge
//!
//! Runs a synchronous unit of work on the blocking pool and exposes its
//! outcome through an opaque string handle. Each task has exactly one writer
//! (the worker that runs it); `is_ready`/`fetch` only read. The worker stores
//! the result before publishing `ready` with release ordering, and readers
//! load `ready` with acquire ordering before touching the result.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("async result {0} not found")]
    NotFound(String),

    #[error("async result {0} is not ready")]
    NotReady(String),
}

struct AsyncTask<T> {
    ready: AtomicBool,
    result: Mutex<Option<T>>,
    completed_at: OnceLock<Instant>,
}

impl<T> AsyncTask<T> {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            result: Mutex::new(None),
            completed_at: OnceLock::new(),
        }
    }

    fn complete(&self, value: T) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        let _ = self.completed_at.set(Instant::now());
        self.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Registry of in-flight and completed tasks producing `T`
pub struct AsyncBridge<T> {
    runtime: Handle,
    tasks: Arc<RwLock<HashMap<String, Arc<AsyncTask<T>>>>>,
}

impl<T> Clone for AsyncBridge<T> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<T: Send + 'static> AsyncBridge<T> {
    /// Create a bridge whose work runs on `runtime`'s blocking pool
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `work` and start it in the background.
    ///
    /// Returns immediately with a fresh handle of the form `<label>.<uuid>`.
    /// If `work` panics the handle is dropped, so later lookups see `NotFound`.
    pub fn submit<F>(&self, label: &str, work: F) -> String
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = format!("{}.{}", label, Uuid::new_v4());
        let task = Arc::new(AsyncTask::new());

        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone(), task.clone());

        let key = handle.clone();
        let tasks = self.tasks.clone();
        self.runtime.spawn_blocking(move || match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => {
                task.complete(value);
                debug!("Async result {} ready", key);
            }
            Err(_) => {
                error!("Async work {} panicked, dropping its handle", key);
                tasks.write().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
        });

        handle
    }

    /// Whether the task behind `handle` has finished
    pub fn is_ready(&self, handle: &str) -> Result<bool, BridgeError> {
        self.task(handle).map(|task| task.is_ready())
    }

    /// Take the result of a finished task and drop its handle.
    ///
    /// Never blocks: a task that has not finished yet yields
    /// [`BridgeError::NotReady`] and stays registered.
    pub fn fetch(&self, handle: &str) -> Result<T, BridgeError> {
        if !self.task(handle)?.is_ready() {
            return Err(BridgeError::NotReady(handle.to_string()));
        }

        let task = self
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle)
            .ok_or_else(|| BridgeError::NotFound(handle.to_string()))?;

        let value = task.result.lock().unwrap_or_else(|e| e.into_inner()).take();
        value.ok_or_else(|| BridgeError::NotFound(handle.to_string()))
    }

    /// Number of registered handles, finished or not
    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop finished tasks whose result has waited longer than `ttl`
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, task| match task.completed_at.get() {
            Some(completed_at) if task.is_ready() => completed_at.elapsed() < ttl,
            _ => true,
        });
        before - tasks.len()
    }

    /// Periodically evict unfetched results until `cancel` fires
    pub fn spawn_eviction(&self, ttl: Duration, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = bridge.evict_expired(ttl);
                        if evicted > 0 {
                            info!("Evicted {} unfetched async results", evicted);
                        }
                    }
                }
            }
        })
    }

    fn task(&self, handle: &str) -> Result<Arc<AsyncTask<T>>, BridgeError> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(handle.to_string()))
    }
}
