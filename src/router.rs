//! Connection router
//!
//! Maps each attached (source id, link name) pair to its backend collection.
//! Attach and detach are rare host-driven events; resolves happen on every
//! request, so the table sits behind a read-write lock. Connections are
//! established outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};

use crate::backend::{Collection, Connector, UnavailableCollection};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::link::{ConnectionArgs, LinkDefinition};

/// Who issued a request, as extracted from its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub source_id: String,
    pub link_name: Option<String>,
}

impl CallerIdentity {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            link_name: None,
        }
    }

    pub fn with_link(mut self, link_name: impl Into<String>) -> Self {
        self.link_name = Some(link_name.into());
        self
    }

    /// Read the caller identity from request headers
    pub fn from_headers(headers: &HashMap<String, String>, config: &ProviderConfig) -> ProviderResult<Self> {
        let source_id = headers
            .get(&config.source_id_header)
            .filter(|id| !id.is_empty())
            .ok_or(ProviderError::MissingIdentity)?;
        Ok(Self {
            source_id: source_id.clone(),
            link_name: headers
                .get(&config.link_name_header)
                .filter(|name| !name.is_empty())
                .cloned(),
        })
    }
}

struct Link {
    args: ConnectionArgs,
    collection: Arc<dyn Collection>,
}

pub struct ConnectionRouter {
    connector: Arc<dyn Connector>,
    readiness_timeout: Duration,
    default_link_name: String,
    links: RwLock<HashMap<String, HashMap<String, Link>>>,
}

impl ConnectionRouter {
    pub fn new(connector: Arc<dyn Connector>, config: &ProviderConfig) -> Self {
        Self {
            connector,
            readiness_timeout: config.readiness_timeout(),
            default_link_name: config.default_link_name.clone(),
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Validate the link's config, connect, and store the connection.
    ///
    /// Only validation failures are returned. Connection failures are
    /// logged and the link is stored anyway, so its requests fail at first use.
    pub fn attach(&self, link: &LinkDefinition) -> ProviderResult<()> {
        info!("Handling new target link {} from {}", link.link_name, link.source_id);

        let args = ConnectionArgs::from_link(&link.target_config, &link.target_secrets)
            .map_err(|e| {
                warn!("Invalid target config for {}: {}", link.source_id, e);
                e
            })?;
        let collection = self.establish(&args);

        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        let replaced = links
            .entry(link.source_id.clone())
            .or_default()
            .insert(link.link_name.clone(), Link { args, collection });
        if replaced.is_some() {
            debug!("Replaced existing link {} for {}", link.link_name, link.source_id);
        }
        Ok(())
    }

    fn establish(&self, args: &ConnectionArgs) -> Arc<dyn Collection> {
        let bucket = match self.connector.connect(args) {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!("Unable to connect to cluster {}: {}", args.connection_string, e);
                return Arc::new(UnavailableCollection::new(e.to_string()));
            }
        };

        if let Err(e) = bucket.wait_until_ready(self.readiness_timeout) {
            warn!("Bucket {} not ready after {:?}: {}", bucket.name(), self.readiness_timeout, e);
        }

        match args.keyspace() {
            Some((scope, collection)) => bucket.collection(scope, collection),
            None => bucket.default_collection(),
        }
    }

    /// Forget a link. Unknown links are ignored.
    pub fn detach(&self, source_id: &str, link_name: &str) {
        info!("Handling del target link {} from {}", link_name, source_id);

        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        if let Some(source_links) = links.get_mut(source_id) {
            source_links.remove(link_name);
            if source_links.is_empty() {
                links.remove(source_id);
            }
        }
    }

    /// Find the connection serving `identity`.
    ///
    /// An explicit link name must match exactly. Otherwise the default link
    /// is used, or the caller's only link if it has exactly one.
    pub fn resolve(&self, identity: &CallerIdentity) -> ProviderResult<Arc<dyn Collection>> {
        let unlinked = || {
            warn!("Received request from unlinked source {}", identity.source_id);
            ProviderError::UnlinkedSource {
                source_id: identity.source_id.clone(),
            }
        };

        let links = self.links.read().unwrap_or_else(|e| e.into_inner());
        let source_links = links.get(&identity.source_id).ok_or_else(unlinked)?;

        let link = match &identity.link_name {
            Some(name) => source_links.get(name),
            None => source_links.get(&self.default_link_name).or_else(|| {
                if source_links.len() == 1 {
                    source_links.values().next()
                } else {
                    None
                }
            }),
        };
        link.map(|link| link.collection.clone()).ok_or_else(unlinked)
    }

    /// The connection args currently stored for a link
    pub fn connection_args(&self, source_id: &str, link_name: &str) -> Option<ConnectionArgs> {
        let links = self.links.read().unwrap_or_else(|e| e.into_inner());
        links
            .get(source_id)
            .and_then(|source_links| source_links.get(link_name))
            .map(|link| link.args.clone())
    }

    pub fn is_linked(&self, source_id: &str) -> bool {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(source_id)
    }

    /// Total number of links across all sources
    pub fn link_count(&self) -> usize {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Drop every link. Connections close when their last user releases them.
    pub fn shutdown(&self) {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        info!("Clearing {} linked sources", links.len());
        links.clear();
    }
}
