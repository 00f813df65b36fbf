//! Request dispatch to running nodes
//!
//! Every call opens its own connection, sends one request, and reads until
//! the response with the matching correlation id arrives or the timeout
//! passes. Connections are never shared or reused, so concurrent callers
//! can't see each other's responses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::protocol::{self, CodecError, Outcome, Params, ReservedMethod, RpcRequest, RpcResponse};
use crate::supervisor::{NodeState, Supervisor};
use crate::transport::{self, TransportError};

/// Errors returned to callers of [`Dispatcher::call`]
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No node with this id is registered
    #[error("node '{0}' is not registered")]
    NodeNotFound(String),

    /// Node exists but can't take requests
    #[error(
        "node '{node_id}' is not running (state: {})",
        .state.map_or_else(|| "not launched".to_string(), |s| s.to_string())
    )]
    NodeNotRunning {
        node_id: String,
        state: Option<NodeState>,
    },

    /// Connection or framing failure
    #[error("node '{node_id}': {source}")]
    Transport {
        node_id: String,
        #[source]
        source: TransportError,
    },

    /// Node sent bytes that aren't a valid response
    #[error("node '{node_id}' sent an invalid response: {source}")]
    Codec {
        node_id: String,
        #[source]
        source: CodecError,
    },

    /// No matching response within the timeout
    #[error("node '{node_id}' did not answer '{method}' within {timeout:?}")]
    Timeout {
        node_id: String,
        method: String,
        timeout: Duration,
    },

    /// Node answered with an error object
    #[error("node '{node_id}' returned {code}: {message}")]
    Application {
        node_id: String,
        code: String,
        message: String,
    },
}

impl DispatchError {
    /// Short stable name of the error class
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "node_not_found",
            Self::NodeNotRunning { .. } => "node_not_running",
            Self::Transport { .. } => "transport",
            Self::Codec { .. } => "codec",
            Self::Timeout { .. } => "timeout",
            Self::Application { .. } => "application",
        }
    }

    /// Node the failed call was addressed to
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::NodeNotFound(node_id)
            | Self::NodeNotRunning { node_id, .. }
            | Self::Transport { node_id, .. }
            | Self::Codec { node_id, .. }
            | Self::Timeout { node_id, .. }
            | Self::Application { node_id, .. } => node_id,
        }
    }

    /// Error code reported by the node, for application errors
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Application { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Orchestrator-facing call API
#[derive(Debug, Clone)]
pub struct Dispatcher {
    supervisor: Supervisor,
    default_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(supervisor: Supervisor, default_timeout: Duration) -> Self {
        Self {
            supervisor,
            default_timeout,
        }
    }

    /// Create a dispatcher using the request timeout from `config`
    #[must_use]
    pub const fn from_config(supervisor: Supervisor, config: &Config) -> Self {
        Self::new(supervisor, config.dispatch.request_timeout)
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Call `method` on a running node
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` or `NodeNotRunning` before any I/O, `Timeout`
    /// if no matching response arrives in time (the connection is closed),
    /// `Transport` or `Codec` on wire failures, and `Application` when the
    /// node answers with an error object
    pub async fn call(
        &self,
        node_id: &str,
        method: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let socket_path = self.resolve(node_id)?;
        call_socket(node_id, &socket_path, method, params, timeout)
            .await
    }

    /// Call `method` with the default timeout
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`]
    pub async fn call_default(
        &self,
        node_id: &str,
        method: &str,
        params: Params,
    ) -> Result<Value, DispatchError> {
        self.call(node_id, method, params, self.default_timeout).await
    }

    /// `node.info`
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`]
    pub async fn info(&self, node_id: &str) -> Result<Value, DispatchError> {
        self.call_default(node_id, ReservedMethod::Info.as_str(), Params::new())
            .await
    }

    /// `node.health`, on an application connection
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`]
    pub async fn health(&self, node_id: &str) -> Result<Value, DispatchError> {
        self.call_default(node_id, ReservedMethod::Health.as_str(), Params::new())
            .await
    }

    /// `node.execute`
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`]
    pub async fn execute(&self, node_id: &str, params: Params) -> Result<Value, DispatchError> {
        self.call_default(node_id, ReservedMethod::Execute.as_str(), params)
            .await
    }

    /// `node.validate`
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call`]
    pub async fn validate(&self, node_id: &str, params: Params) -> Result<Value, DispatchError> {
        self.call_default(node_id, ReservedMethod::Validate.as_str(), params)
            .await
    }

    fn resolve(&self, node_id: &str) -> Result<PathBuf, DispatchError> {
        match self.supervisor.get(node_id) {
            Some(node) if node.state.accepts_requests() => Ok(node.socket_path),
            Some(node) => Err(DispatchError::NodeNotRunning {
                node_id: node_id.to_string(),
                state: Some(node.state),
            }),
            None if self.supervisor.registry().lookup(node_id).is_some() => {
                Err(DispatchError::NodeNotRunning {
                    node_id: node_id.to_string(),
                    state: None,
                })
            }
            None => Err(DispatchError::NodeNotFound(node_id.to_string())),
        }
    }
}

/// One request/response exchange against a socket path
///
/// Used by the dispatcher and by internal callers (health checks,
/// cooperative shutdown) that must not depend on the node's state.
///
/// # Errors
///
/// Same as [`Dispatcher::call`] minus the state checks
pub async fn call_socket(
    node_id: &str,
    socket_path: &Path,
    method: &str,
    params: Params,
    timeout: Duration,
) -> Result<Value, DispatchError> {
    let request = RpcRequest::new(method, params);
    let payload = protocol::encode(&request);

    tracing::debug!(
        node_id = %node_id,
        method = %method,
        correlation_id = %request.correlation_id,
        "dispatching request"
    );

    // Dropping the exchange on timeout closes the connection
    let call = exchange(node_id, socket_path, &request, &payload, timeout);
    let response = tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| DispatchError::Timeout {
            node_id: node_id.to_string(),
            method: method.to_string(),
            timeout,
        })??;

    match response.outcome {
        Outcome::Result(result) => Ok(result),
        Outcome::Error(error) => Err(DispatchError::Application {
            node_id: node_id.to_string(),
            code: error.code,
            message: error.message,
        }),
    }
}

/// Connect, send, and read until the matching response arrives
async fn exchange(
    node_id: &str,
    socket_path: &Path,
    request: &RpcRequest,
    payload: &[u8],
    connect_timeout: Duration,
) -> Result<RpcResponse, DispatchError> {
    let transport_error = |source: TransportError| DispatchError::Transport {
        node_id: node_id.to_string(),
        source,
    };

    let mut connection = transport::connect(socket_path, connect_timeout)
        .await
        .map_err(transport_error)?;
    connection.send(payload).await.map_err(transport_error)?;

    loop {
        let bytes = connection.receive().await.map_err(transport_error)?;
        let response = protocol::decode(&bytes).map_err(|source| DispatchError::Codec {
            node_id: node_id.to_string(),
            source,
        })?;

        if response.correlation_id == request.correlation_id {
            return Ok(response);
        }
        tracing::warn!(
            node_id = %node_id,
            expected = %request.correlation_id,
            received = %response.correlation_id,
            "discarding response with unexpected correlation id"
        );
    }
}
