//! docbridge - routes document and key-value requests from linked callers to
//! their backend collections, with handle-based async results.

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod jsonrpc;
pub mod link;
pub mod router;
pub mod types;

// 公開API
pub use backend::{BackendError, Bucket, Collection, Connector, MemoryConnector};
pub use bridge::{AsyncBridge, BridgeError};
pub use config::ProviderConfig;
pub use dispatcher::{Dispatcher, ProviderHandler};
pub use error::{ProviderError, ProviderResult};
pub use link::{ConnectionArgs, LinkDefinition, SecretValue};
pub use router::{CallerIdentity, ConnectionRouter};
pub use types::*;
