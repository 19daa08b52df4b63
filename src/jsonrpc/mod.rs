//! JSON-RPC 2.0 over Content-Length framed streams
//!
//! The host drives the provider through this transport. Requests may carry a
//! `headers` object next to `params`; it holds caller metadata such as the
//! source id and link name.
//!
//! - [`message`]: payload types and error helpers
//! - [`handler`]: the receiving side's trait
//! - [`engine`]: dispatch loop and outgoing request tracking
//! - [`stdio`]: framing and the stream adapter

pub mod engine;
pub mod handler;
pub mod message;
pub mod stdio;

pub use engine::JsonRpcEngine;
pub use handler::JsonRpcHandler;
pub use message::{
    JsonRpcError, JsonRpcNotification, JsonRpcPayload, JsonRpcRequest, JsonRpcRequestError,
    JsonRpcResponse, JsonRpcSendError,
};
pub use stdio::{JsonRpcStdioAdapter, StdioShutdownReason, StdioTransport};
