//! Request dispatcher
//!
//! Ties the router and the async bridge together. Every operation first
//! resolves the caller's connection, so an unknown caller never reaches the
//! backend. Backend outcomes come back as typed values; only failures around
//! the call (identity, params, handles) are [`ProviderError`]s.
//!
//! Operations here block on the backend. The JSON-RPC handler in [`rpc`]
//! moves them onto the blocking pool.

mod document;
mod keyvalue;
pub mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Collection, Connector};
use crate::bridge::AsyncBridge;
use crate::config::ProviderConfig;
use crate::error::ProviderResult;
use crate::link::LinkDefinition;
use crate::router::{CallerIdentity, ConnectionRouter};
use crate::types::{DocumentGetResult, DocumentResult, MutationMetadata};

pub use rpc::ProviderHandler;

pub const HEALTHY: &str = "provider healthy";
pub const SHUTDOWN_ACK: &str = "ack";

pub struct Dispatcher {
    router: Arc<ConnectionRouter>,
    config: ProviderConfig,
    get_results: AsyncBridge<DocumentResult<DocumentGetResult>>,
    mutation_results: AsyncBridge<DocumentResult<MutationMetadata>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Build a dispatcher whose async work runs on `runtime`
    pub fn new(connector: Arc<dyn Connector>, config: ProviderConfig, runtime: Handle) -> Self {
        let router = Arc::new(ConnectionRouter::new(connector, &config));
        let dispatcher = Self {
            router,
            get_results: AsyncBridge::new(runtime.clone()),
            mutation_results: AsyncBridge::new(runtime),
            config,
            shutdown: CancellationToken::new(),
        };

        if let Some(ttl) = dispatcher.config.async_result_ttl() {
            let interval = dispatcher.config.eviction_interval();
            info!("Evicting unfetched async results after {:?}", ttl);
            dispatcher
                .get_results
                .spawn_eviction(ttl, interval, dispatcher.shutdown.child_token());
            dispatcher
                .mutation_results
                .spawn_eviction(ttl, interval, dispatcher.shutdown.child_token());
        }

        dispatcher
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Fires once the host has asked the provider to shut down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Extract the caller identity from request headers
    pub fn identify(&self, headers: &HashMap<String, String>) -> ProviderResult<CallerIdentity> {
        CallerIdentity::from_headers(headers, &self.config)
    }

    fn connection(&self, identity: &CallerIdentity) -> ProviderResult<Arc<dyn Collection>> {
        self.router.resolve(identity)
    }

    /// Host attached a component to this provider
    pub fn link_put(&self, link: &LinkDefinition) -> ProviderResult<()> {
        self.router.attach(link)
    }

    /// Host detached a component. Unknown links are ignored.
    pub fn link_del(&self, source_id: &str, link_name: &str) {
        self.router.detach(source_id, link_name)
    }

    pub fn health(&self) -> &'static str {
        HEALTHY
    }

    /// Drop every link, stop background eviction and signal the server loop to stop
    pub fn shutdown(&self) -> &'static str {
        info!("Handling shutdown request");
        self.router.shutdown();
        self.shutdown.cancel();
        SHUTDOWN_ACK
    }
}
