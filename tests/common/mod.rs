//! Shared test utilities
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nodehub::config::SupervisorConfig;
use nodehub::{Dispatcher, NodeState, Registry, Supervisor};
use tempfile::TempDir;

/// The stub node built alongside the tests
pub const ECHO: &str = env!("CARGO_BIN_EXE_nodehub-echo");

/// Grace period used by most tests
pub const GRACE: Duration = Duration::from_millis(500);

/// How long to wait for an asynchronous state change
pub const SETTLE: Duration = Duration::from_secs(5);

/// Echo node to register in a test harness
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoNode<'a> {
    pub id: &'a str,
    pub args: &'a [&'a str],
    pub startup_timeout_ms: Option<u64>,
    pub socket_template: Option<&'a str>,
}

impl<'a> EchoNode<'a> {
    #[must_use]
    pub const fn new(id: &'a str) -> Self {
        Self {
            id,
            args: &[],
            startup_timeout_ms: None,
            socket_template: None,
        }
    }

    #[must_use]
    pub const fn args(mut self, args: &'a [&'a str]) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub const fn startup_timeout_ms(mut self, ms: u64) -> Self {
        self.startup_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn socket_template(mut self, template: &'a str) -> Self {
        self.socket_template = Some(template);
        self
    }
}

/// Write `<nodes_dir>/<id>/node.yaml` pointing at the echo binary
pub fn write_manifest(nodes_dir: &Path, node: &EchoNode<'_>) -> PathBuf {
    let dir = nodes_dir.join(node.id);
    std::fs::create_dir_all(&dir).expect("failed to create manifest dir");

    let template = node.socket_template.unwrap_or("{runtime_dir}/{id}.sock");
    let mut yaml = format!(
        "id: {id}\n\
         executable: {exe}\n\
         protocol_version: \"1.0\"\n\
         socket_path_template: {template}\n\
         methods: [node.info, node.health, node.execute, node.validate, node.shutdown]\n\
         args: {args}\n",
        id = node.id,
        exe = serde_json::to_string(ECHO).expect("encode path"),
        template = serde_json::to_string(template).expect("encode template"),
        args = serde_json::to_string(node.args).expect("encode args"),
    );
    if let Some(ms) = node.startup_timeout_ms {
        yaml.push_str(&format!("startup_timeout_ms: {ms}\n"));
    }

    let path = dir.join("node.yaml");
    std::fs::write(&path, yaml).expect("failed to write manifest");
    path
}

/// Temp dir, registry and supervisor for a set of echo nodes
pub struct Harness {
    pub dir: TempDir,
    pub runtime_dir: PathBuf,
    pub supervisor: Supervisor,
}

impl Harness {
    pub fn new(nodes: &[EchoNode<'_>]) -> Self {
        Self::with_config(
            nodes,
            SupervisorConfig {
                startup_timeout: Duration::from_secs(10),
                shutdown_grace: GRACE,
            },
        )
    }

    pub fn with_config(nodes: &[EchoNode<'_>], config: SupervisorConfig) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let nodes_dir = dir.path().join("nodes");
        for node in nodes {
            write_manifest(&nodes_dir, node);
        }

        let registry = Registry::from_dirs(&[nodes_dir]).expect("failed to load manifests");
        let runtime_dir = dir.path().join("run");
        let supervisor = Supervisor::new(Arc::new(registry), runtime_dir.clone(), config);

        Self {
            dir,
            runtime_dir,
            supervisor,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.supervisor.clone(), Duration::from_secs(5))
    }

    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.runtime_dir.join(format!("{id}.sock"))
    }
}

/// Poll until the node reaches `state` or `timeout` passes
pub async fn wait_for_state(
    supervisor: &Supervisor,
    id: &str,
    state: NodeState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if supervisor.get(id).is_some_and(|node| node.state == state) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Send a signal from outside the supervisor
pub fn send_signal(pid: u32, signal: &str) {
    let status = std::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .status()
        .expect("failed to run kill");
    assert!(status.success(), "kill -{signal} {pid} failed");
}

/// Params object from a JSON literal
pub fn params(value: serde_json::Value) -> nodehub::Params {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("params must be an object, got {other}"),
    }
}
