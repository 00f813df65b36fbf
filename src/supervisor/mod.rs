//! Process supervision for nodes
//!
//! The [`Supervisor`] owns every launched node process. It spawns nodes,
//! waits for their sockets, records exits, and runs the shutdown ladder:
//! cooperative `node.shutdown`, then SIGTERM, then SIGKILL. Other components
//! only read [`NodeProcess`] snapshots and request transitions through the
//! `mark_*` methods.
//!
//! ```text
//! Starting --(socket connectable)--> Running
//! Starting --(timeout or exit)--> Crashed
//! Running <--(health)--> Unhealthy --(more failures or exit)--> Crashed
//! Running/Unhealthy --(shutdown)--> Stopping --(exit or kill)--> Stopped
//! ```
//!
//! Nothing is restarted automatically; see [`Supervisor::restart`].

pub mod process;
pub mod state;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{Config, SupervisorConfig};
use crate::dispatch::call_socket;
use crate::manifest::{NodeDescriptor, Registry};
use crate::protocol::{Params, ReservedMethod};
use crate::transport::{self, TransportError};

pub use process::{ChildProcess, ExitInfo, LaunchSpec, NODE_ID_ENV, Signal};
pub use state::NodeState;

/// Longest usable `sun_path` (108 bytes including the terminating NUL)
pub const SOCKET_PATH_MAX: usize = 107;

/// How long to wait for a process to die after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Errors raised by supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No descriptor with this id
    #[error("node '{0}' is not registered")]
    UnknownNode(String),

    /// Descriptor exists but no process was launched
    #[error("node '{0}' has not been launched")]
    NotLaunched(String),

    /// A live process already exists for this id
    #[error("node '{node_id}' is already {state}")]
    AlreadyRunning { node_id: String, state: NodeState },

    /// The previous process for this id has not exited yet
    #[error("node '{node_id}' previous process {pid} is still running")]
    PreviousStillRunning { node_id: String, pid: u32 },

    /// Another node's process owns the rendered socket path
    #[error("node '{node_id}' socket {} is in use by node '{owner}'", .path.display())]
    SocketPathInUse {
        node_id: String,
        owner: String,
        path: PathBuf,
    },

    /// Another shutdown of this node is in progress
    #[error("node '{0}' is already stopping")]
    ShutdownInProgress(String),

    /// Bare program name not found on `PATH`
    #[error("node '{node_id}' executable not found: {reason}")]
    ExecutableNotFound { node_id: String, reason: String },

    /// Rendered socket path can't be bound
    #[error("node '{node_id}' socket path {} exceeds {max} bytes", .path.display())]
    SocketPathTooLong {
        node_id: String,
        path: PathBuf,
        max: usize,
    },

    /// Socket directory could not be created
    #[error("failed to create socket directory {}: {source}", .path.display())]
    RuntimeDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Program could not be spawned
    #[error("failed to spawn node '{node_id}': {source}")]
    Spawn {
        node_id: String,
        #[source]
        source: io::Error,
    },

    /// Socket never became connectable
    #[error("node '{node_id}' did not accept connections within {timeout:?}")]
    StartupTimeout { node_id: String, timeout: Duration },

    /// Socket probe failed for a reason other than "not ready yet"
    #[error("node '{node_id}' failed during startup: {source}")]
    Startup {
        node_id: String,
        #[source]
        source: TransportError,
    },

    /// Process exited before its socket became connectable
    #[error("node '{node_id}' exited during startup ({exit})")]
    ExitedDuringStartup { node_id: String, exit: ExitInfo },

    /// Node left `Starting` for another reason (e.g. a concurrent shutdown)
    #[error("node '{node_id}' left startup in state {state}")]
    StartupInterrupted { node_id: String, state: NodeState },
}

/// Snapshot of one supervised node process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeProcess {
    pub descriptor_id: String,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub state: NodeState,
    pub started_at: DateTime<Utc>,
    /// Last recorded exit, if the process has exited
    pub exit: Option<ExitInfo>,
    /// Why the node was declared crashed
    pub last_error: Option<String>,
    /// Earlier launches of this id by the same supervisor
    pub restart_count: u32,
}

/// Lifetime counters of one supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    /// Processes spawned
    pub total_started: u64,
    /// Nodes that ended up `Crashed`
    pub total_crashed: u64,
    /// Launches of an id that had been launched before
    pub total_restarts: u64,
    /// Completed shutdowns
    pub total_stopped: u64,
    /// Nodes currently in a live state
    pub live: usize,
}

#[derive(Debug)]
struct NodeEntry {
    descriptor: Arc<NodeDescriptor>,
    process: ChildProcess,
    socket_path: PathBuf,
    state: NodeState,
    started_at: DateTime<Utc>,
    exit: Option<ExitInfo>,
    last_error: Option<String>,
    restart_count: u32,
}

impl NodeEntry {
    fn snapshot(&self) -> NodeProcess {
        NodeProcess {
            descriptor_id: self.descriptor.id.clone(),
            pid: self.process.pid(),
            socket_path: self.socket_path.clone(),
            state: self.state,
            started_at: self.started_at,
            exit: self.exit,
            last_error: self.last_error.clone(),
            restart_count: self.restart_count,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    nodes: HashMap<String, NodeEntry>,
    /// Launch count per id; survives entry removal
    launches: HashMap<String, u32>,
    stats: SupervisorStats,
}

impl Table {
    /// Move an entry to `Crashed`, counting it once
    fn crash(&mut self, node_id: &str, reason: String) -> Option<&mut NodeEntry> {
        let entry = self.nodes.get_mut(node_id)?;
        if entry.state != NodeState::Crashed {
            entry.state = NodeState::Crashed;
            self.stats.total_crashed += 1;
        }
        entry.last_error = Some(reason);
        Some(entry)
    }

    /// Id of another node whose process may still hold `path`
    fn socket_owner(&self, node_id: &str, path: &Path) -> Option<String> {
        self.nodes
            .iter()
            .find(|(id, entry)| {
                id.as_str() != node_id
                    && entry.socket_path == path
                    && (entry.state.is_live() || entry.process.exit_status().is_none())
            })
            .map(|(id, _)| id.clone())
    }
}

#[derive(Debug)]
struct Inner {
    registry: Arc<Registry>,
    runtime_dir: PathBuf,
    config: SupervisorConfig,
    table: Mutex<Table>,
}

/// Owner of all node processes
///
/// Cheap to clone; clones share the same process table.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor for the nodes in `registry`
    #[must_use]
    pub fn new(registry: Arc<Registry>, runtime_dir: PathBuf, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                runtime_dir,
                config,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Create a supervisor using the runtime dir and timings from `config`
    #[must_use]
    pub fn from_config(registry: Arc<Registry>, config: &Config) -> Self {
        Self::new(registry, config.runtime_dir.clone(), config.supervisor)
    }

    /// Registry this supervisor launches from
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Directory substituted for `{runtime_dir}`
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        &self.inner.runtime_dir
    }

    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the registered node `node_id`
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if no such descriptor exists, otherwise any
    /// error from [`Supervisor::launch`]
    pub async fn launch_id(&self, node_id: &str) -> Result<NodeProcess, SupervisorError> {
        let descriptor = self
            .inner
            .registry
            .lookup(node_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownNode(node_id.to_string()))?;
        self.launch(descriptor).await
    }

    /// Spawn a node and wait until its socket accepts connections
    ///
    /// The process receives its socket path as the first argument. The node
    /// is `Starting` until a probe connection succeeds, then `Running`. If
    /// the startup timeout passes or the process exits first, the node is
    /// `Crashed`, any remaining process is killed, and an error returned.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if a live process exists for the id,
    /// `PreviousStillRunning` if a crashed process for the id outlives the
    /// shutdown ladder, `SocketPathInUse` if another node's process owns the
    /// socket path, or a spawn or startup error
    pub async fn launch(
        &self,
        descriptor: Arc<NodeDescriptor>,
    ) -> Result<NodeProcess, SupervisorError> {
        let node_id = descriptor.id.clone();
        let socket_path = descriptor.socket_path(&self.inner.runtime_dir);

        if socket_path.as_os_str().len() > SOCKET_PATH_MAX {
            return Err(SupervisorError::SocketPathTooLong {
                node_id,
                path: socket_path,
                max: SOCKET_PATH_MAX,
            });
        }

        let program = descriptor
            .resolve_executable()
            .map_err(|e| SupervisorError::ExecutableNotFound {
                node_id: node_id.clone(),
                reason: e.to_string(),
            })?;

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SupervisorError::RuntimeDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        // A crashed process may still be on its way down
        let lingering = self
            .lock()
            .nodes
            .get(&node_id)
            .filter(|existing| !existing.state.is_live())
            .map(|existing| existing.process.clone())
            .filter(|previous| previous.exit_status().is_none());
        if let Some(previous) = lingering {
            tracing::debug!(
                node_id = %node_id,
                pid = previous.pid(),
                "waiting for previous process to exit"
            );
            previous
                .wait_timeout(self.inner.config.shutdown_grace + KILL_WAIT)
                .await;
        }

        let process = {
            // Check, spawn and register without yielding so two launches of
            // the same id can't both spawn
            let mut table = self.lock();
            if let Some(existing) = table.nodes.get(&node_id) {
                if existing.state.is_live() {
                    let state = existing.state;
                    return Err(SupervisorError::AlreadyRunning { node_id, state });
                }
                if existing.process.exit_status().is_none() {
                    let pid = existing.process.pid();
                    return Err(SupervisorError::PreviousStillRunning { node_id, pid });
                }
            }
            if let Some(owner) = table.socket_owner(&node_id, &socket_path) {
                return Err(SupervisorError::SocketPathInUse {
                    node_id,
                    owner,
                    path: socket_path,
                });
            }

            remove_socket(&node_id, &socket_path);

            let weak = Arc::downgrade(&self.inner);
            let exit_node_id = node_id.clone();
            let spec = LaunchSpec {
                node_id: &node_id,
                program: &program,
                socket_path: &socket_path,
                args: &descriptor.args,
                env: &descriptor.env,
                working_dir: descriptor.working_dir.as_deref(),
                limits: &descriptor.resources,
            };
            let process = ChildProcess::start(&spec, move |pid, exit| {
                if let Some(inner) = weak.upgrade() {
                    Self { inner }.on_exit(&exit_node_id, pid, exit);
                }
            })
            .map_err(|source| SupervisorError::Spawn {
                node_id: node_id.clone(),
                source,
            })?;

            let launches = table.launches.entry(node_id.clone()).or_insert(0);
            let restart_count = *launches;
            *launches += 1;
            table.stats.total_started += 1;
            if restart_count > 0 {
                table.stats.total_restarts += 1;
            }

            table.nodes.insert(
                node_id.clone(),
                NodeEntry {
                    descriptor: Arc::clone(&descriptor),
                    process: process.clone(),
                    socket_path: socket_path.clone(),
                    state: NodeState::Starting,
                    started_at: Utc::now(),
                    exit: None,
                    last_error: None,
                    restart_count,
                },
            );
            process
        };

        tracing::info!(
            node_id = %node_id,
            pid = process.pid(),
            socket = %socket_path.display(),
            limited = !descriptor.resources.is_unlimited(),
            "launched node"
        );

        let startup_timeout = descriptor
            .startup_timeout
            .unwrap_or(self.inner.config.startup_timeout);

        let probe = tokio::select! {
            result = transport::connect(&socket_path, startup_timeout) => result,
            exit = process.wait() => {
                let error = SupervisorError::ExitedDuringStartup {
                    node_id: node_id.clone(),
                    exit: exit.unwrap_or_default(),
                };
                return Err(self.fail_startup(&node_id, &process, error));
            }
        };

        match probe {
            Ok(connection) => drop(connection),
            Err(TransportError::ConnectTimeout { .. }) => {
                let error = SupervisorError::StartupTimeout {
                    node_id: node_id.clone(),
                    timeout: startup_timeout,
                };
                return Err(self.fail_startup(&node_id, &process, error));
            }
            Err(source) => {
                let error = SupervisorError::Startup {
                    node_id: node_id.clone(),
                    source,
                };
                return Err(self.fail_startup(&node_id, &process, error));
            }
        }

        let mut table = self.lock();
        match table.nodes.get_mut(&node_id) {
            Some(entry) if entry.process.pid() == process.pid() => {
                if entry.state == NodeState::Starting {
                    entry.state = NodeState::Running;
                    tracing::info!(node_id = %node_id, pid = process.pid(), "node running");
                    Ok(entry.snapshot())
                } else if let Some(exit) = entry.exit {
                    Err(SupervisorError::ExitedDuringStartup { node_id, exit })
                } else {
                    Err(SupervisorError::StartupInterrupted {
                        node_id,
                        state: entry.state,
                    })
                }
            }
            _ => Err(SupervisorError::StartupInterrupted {
                node_id,
                state: NodeState::Stopped,
            }),
        }
    }

    /// Mark a failed startup as crashed and make sure the process is gone
    fn fail_startup(
        &self,
        node_id: &str,
        process: &ChildProcess,
        error: SupervisorError,
    ) -> SupervisorError {
        tracing::warn!(
            node_id = %node_id,
            pid = process.pid(),
            error = %error,
            "node failed to start"
        );

        let socket_path = {
            let mut table = self.lock();
            let owned = table
                .nodes
                .get(node_id)
                .is_some_and(|entry| entry.process.pid() == process.pid());
            if owned {
                table
                    .crash(node_id, error.to_string())
                    .map(|entry| entry.socket_path.clone())
            } else {
                None
            }
        };

        if let Err(e) = process.signal(Signal::Kill) {
            tracing::warn!(
                node_id = %node_id,
                error = %e,
                "failed to kill node after startup failure"
            );
        }
        if let Some(path) = socket_path {
            self.remove_socket_of(node_id, process.pid(), &path);
        }
        error
    }

    /// Record a process exit reported by the exit watcher
    ///
    /// Exits during `Stopping` are expected; anywhere else the node becomes
    /// `Crashed`.
    fn on_exit(&self, node_id: &str, pid: u32, exit: ExitInfo) {
        let mut table = self.lock();
        let Some(entry) = table.nodes.get_mut(node_id) else {
            return;
        };
        if entry.process.pid() != pid {
            // Exit of a replaced process
            return;
        }
        entry.exit = Some(exit);
        let previous = entry.state;
        if matches!(
            previous,
            NodeState::Stopping | NodeState::Stopped | NodeState::Crashed
        ) {
            return;
        }

        tracing::warn!(
            node_id = %node_id,
            pid,
            %exit,
            previous = %previous,
            "node crashed"
        );
        if let Some(entry) = table.crash(node_id, format!("process exited unexpectedly ({exit})")) {
            // Still under the lock, so no relaunch can claim the path first
            remove_socket(node_id, &entry.socket_path);
        }
    }

    /// Move a `Running` node to `Unhealthy`
    ///
    /// Returns whether the transition happened.
    #[must_use]
    pub fn mark_unhealthy(&self, node_id: &str) -> bool {
        self.transition(node_id, NodeState::Running, NodeState::Unhealthy)
    }

    /// Move an `Unhealthy` node back to `Running`
    ///
    /// Returns whether the transition happened.
    #[must_use]
    pub fn mark_healthy(&self, node_id: &str) -> bool {
        self.transition(node_id, NodeState::Unhealthy, NodeState::Running)
    }

    fn transition(&self, node_id: &str, from: NodeState, to: NodeState) -> bool {
        let mut table = self.lock();
        match table.nodes.get_mut(node_id) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                tracing::info!(node_id = %node_id, from = %from, to = %to, "node state changed");
                true
            }
            _ => false,
        }
    }

    /// Declare a live node dead
    ///
    /// The node becomes `Crashed` immediately; the process is then sent
    /// SIGTERM and, if it lingers, SIGKILL in the background, and its socket
    /// is removed unless the id has been relaunched meanwhile. Returns
    /// whether the node was live.
    #[must_use]
    pub fn mark_crashed(&self, node_id: &str, reason: &str) -> bool {
        let (process, socket_path) = {
            let mut table = self.lock();
            let declarable = table.nodes.get(node_id).is_some_and(|entry| {
                matches!(
                    entry.state,
                    NodeState::Starting | NodeState::Running | NodeState::Unhealthy
                )
            });
            if !declarable {
                return false;
            }
            match table.crash(node_id, reason.to_string()) {
                Some(entry) => (entry.process.clone(), entry.socket_path.clone()),
                None => return false,
            }
        };

        tracing::warn!(node_id = %node_id, pid = process.pid(), reason, "node declared crashed");

        let supervisor = self.clone();
        let node_id = node_id.to_string();
        let grace = self.inner.config.shutdown_grace / 2;
        tokio::spawn(async move {
            terminate(&node_id, &process, grace).await;
            supervisor.remove_socket_of(&node_id, process.pid(), &socket_path);
        });
        true
    }

    /// Remove a process's socket unless a newer process holds the id
    fn remove_socket_of(&self, node_id: &str, pid: u32, path: &Path) {
        let table = self.lock();
        let replaced = table
            .nodes
            .get(node_id)
            .is_some_and(|entry| entry.process.pid() != pid);
        if replaced {
            tracing::debug!(node_id = %node_id, pid, "socket belongs to a newer process");
        } else {
            remove_socket(node_id, path);
        }
    }

    /// Stop a node and remove it from the table
    ///
    /// Sends `node.shutdown` and waits up to `grace` for the process to exit;
    /// then SIGTERM with a further `grace / 2`; then SIGKILL. The socket file
    /// is always removed (failures are logged). A crashed node's entry is
    /// simply cleaned up. Returns the final snapshot in state `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns `NotLaunched` if there is no entry, or `ShutdownInProgress`
    /// if another shutdown of the node is running
    pub async fn shutdown(
        &self,
        node_id: &str,
        grace: Duration,
    ) -> Result<NodeProcess, SupervisorError> {
        let (initial, process, socket_path) = {
            let mut table = self.lock();
            let entry = table
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| SupervisorError::NotLaunched(node_id.to_string()))?;
            if entry.state == NodeState::Stopping {
                return Err(SupervisorError::ShutdownInProgress(node_id.to_string()));
            }
            let initial = entry.snapshot();
            if entry.state.is_live() {
                entry.state = NodeState::Stopping;
            }
            (initial, entry.process.clone(), entry.socket_path.clone())
        };

        tracing::info!(
            node_id = %node_id,
            pid = process.pid(),
            ?grace,
            from = %initial.state,
            "stopping node"
        );

        if process.exit_status().is_none() {
            let deadline = Instant::now() + grace;

            if matches!(initial.state, NodeState::Running | NodeState::Unhealthy) {
                request_shutdown(node_id, &socket_path, grace).await;
            }

            if tokio::time::timeout_at(deadline, process.wait()).await.is_err() {
                tracing::warn!(node_id = %node_id, "grace period elapsed, sending SIGTERM");
                terminate(node_id, &process, grace / 2).await;
            }
        }

        remove_socket(node_id, &socket_path);

        let removed = {
            let mut table = self.lock();
            let same_process = table
                .nodes
                .get(node_id)
                .is_some_and(|entry| entry.process.pid() == process.pid());
            if same_process {
                table.stats.total_stopped += 1;
                table.nodes.remove(node_id)
            } else {
                None
            }
        };

        let mut snapshot = removed.map_or(initial, |entry| entry.snapshot());
        snapshot.state = NodeState::Stopped;
        snapshot.exit = process.exit_status().or(snapshot.exit);

        tracing::info!(
            node_id = %node_id,
            pid = snapshot.pid,
            exit = ?snapshot.exit,
            "node stopped"
        );
        Ok(snapshot)
    }

    /// Stop a node if present, then launch it again from the registry
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the id isn't registered, otherwise any
    /// shutdown or launch error
    pub async fn restart(
        &self,
        node_id: &str,
        grace: Duration,
    ) -> Result<NodeProcess, SupervisorError> {
        let descriptor = self
            .inner
            .registry
            .lookup(node_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownNode(node_id.to_string()))?;

        if self.get(node_id).is_some() {
            self.shutdown(node_id, grace).await?;
        }
        tracing::info!(node_id = %node_id, "restarting node");
        self.launch(descriptor).await
    }

    /// Launch every registered node concurrently
    pub async fn launch_all(&self) -> Vec<(String, Result<NodeProcess, SupervisorError>)> {
        let launches = self.inner.registry.list().into_iter().map(|descriptor| {
            let descriptor = Arc::clone(descriptor);
            async move { (descriptor.id.clone(), self.launch(descriptor).await) }
        });
        futures::future::join_all(launches).await
    }

    /// Shut down every node in the table concurrently
    pub async fn shutdown_all(
        &self,
        grace: Duration,
    ) -> Vec<(String, Result<NodeProcess, SupervisorError>)> {
        let ids: Vec<String> = self.lock().nodes.keys().cloned().collect();
        let shutdowns = ids.into_iter().map(|node_id| async move {
            let result = self.shutdown(&node_id, grace).await;
            (node_id, result)
        });
        futures::future::join_all(shutdowns).await
    }

    /// Snapshot of one node
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeProcess> {
        self.lock().nodes.get(node_id).map(NodeEntry::snapshot)
    }

    /// Snapshots of all nodes ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<NodeProcess> {
        let mut nodes: Vec<NodeProcess> = self
            .lock()
            .nodes
            .values()
            .map(NodeEntry::snapshot)
            .collect();
        nodes.sort_by(|a, b| a.descriptor_id.cmp(&b.descriptor_id));
        nodes
    }

    /// Lifetime counters plus the number of live nodes
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        let table = self.lock();
        SupervisorStats {
            live: table
                .nodes
                .values()
                .filter(|entry| entry.state.is_live())
                .count(),
            ..table.stats
        }
    }
}


/// Ask the node to exit on its own
async fn request_shutdown(node_id: &str, socket_path: &Path, grace: Duration) {
    let mut params = Params::new();
    params.insert("timeout_seconds".into(), grace.as_secs().into());

    match call_socket(
        node_id,
        socket_path,
        ReservedMethod::Shutdown.as_str(),
        params,
        grace,
    )
    .await
    {
        Ok(_) => tracing::debug!(node_id = %node_id, "node acknowledged shutdown"),
        Err(e) => tracing::debug!(node_id = %node_id, error = %e, "cooperative shutdown failed"),
    }
}

/// SIGTERM, wait `grace`, then SIGKILL
async fn terminate(node_id: &str, process: &ChildProcess, grace: Duration) -> Option<ExitInfo> {
    if let Err(e) = process.signal(Signal::Terminate) {
        tracing::warn!(node_id = %node_id, error = %e, "failed to send SIGTERM");
    }
    if let Some(exit) = process.wait_timeout(grace).await {
        return Some(exit);
    }

    tracing::warn!(
        node_id = %node_id,
        pid = process.pid(),
        "node ignored SIGTERM, sending SIGKILL"
    );
    if let Err(e) = process.signal(Signal::Kill) {
        tracing::warn!(node_id = %node_id, error = %e, "failed to send SIGKILL");
    }
    let exit = process.wait_timeout(KILL_WAIT).await;
    if exit.is_none() {
        tracing::error!(node_id = %node_id, pid = process.pid(), "node survived SIGKILL");
    }
    exit
}

fn remove_socket(node_id: &str, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(node_id = %node_id, path = %path.display(), "removed socket file");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            node_id = %node_id,
            path = %path.display(),
            error = %e,
            "failed to remove socket file"
        ),
    }
}
