//! Nodehub - orchestration engine for external node processes
//!
//! This library launches node programs, talks to them over Unix domain
//! sockets, and keeps track of whether they are alive:
//! - Manifest discovery and the node registry
//! - Process supervision with a graceful shutdown ladder
//! - Framed request/response dispatch with timeouts
//! - Periodic health checks driving node state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 CLI / embedding host                 │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   Registry  │  Supervisor  │  Dispatcher  │ Health  │
//! └────────────────────┬────────────────────────────────┘
//!                      │  length-prefixed JSON frames
//! ┌────────────────────▼────────────────────────────────┐
//! │          Node processes (one socket each)            │
//! │   echo  │  ...   (built on `runtime::NodeServer`)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod manifest;
pub mod protocol;
pub mod runtime;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use dispatch::{DispatchError, Dispatcher};
pub use error::{Error, Result};
pub use health::{HealthMonitor, HealthOutcome, HealthReport};
pub use manifest::{ManifestError, NodeDescriptor, Registry, ResourceLimits};
pub use protocol::{PROTOCOL_VERSION, Params, ReservedMethod};
pub use runtime::{NodeHandler, NodeInfo, NodeServer};
pub use supervisor::{NodeProcess, NodeState, Supervisor, SupervisorError, SupervisorStats};
pub use transport::{Connection, TransportError};
