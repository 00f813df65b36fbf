//! Node-side runtime
//!
//! Everything a node program needs to speak the protocol: implement
//! [`NodeHandler`] and hand it to a [`NodeServer`]. The server answers the
//! reserved methods, adds runtime counters to health responses and removes
//! its socket when it stops.

mod server;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

pub use server::{NodeServer, ServerHandle};

use crate::protocol::{HEALTHY, Params, RpcError};

/// Identity a node reports from `node.info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Methods the node answers to
    pub methods: Vec<String>,
}

/// Behaviour of a node program
#[async_trait]
pub trait NodeHandler: Send + Sync + 'static {
    /// Result of `node.info`
    fn info(&self) -> NodeInfo;

    /// Perform the node's work for `node.execute`
    async fn execute(&self, params: Params) -> Result<Value, RpcError>;

    /// Check parameters without executing
    async fn validate(&self, _params: Params) -> Result<Value, RpcError> {
        Ok(json!({ "valid": true, "errors": [] }))
    }

    /// Node-specific health body; the server adds its own counters
    async fn health(&self) -> Result<Value, RpcError> {
        Ok(json!({ "status": HEALTHY }))
    }

    /// Any method outside the reserved set
    async fn call(&self, method: &str, _params: Params) -> Result<Value, RpcError> {
        Err(RpcError::method_not_found(method))
    }

    /// Whether `node.shutdown` should actually stop the server
    fn accepts_shutdown(&self) -> bool {
        true
    }
}
