//! Periodic node health checks
//!
//! Each round sends `node.health` to every `Running` or `Unhealthy` node
//! over a fresh connection. Consecutive failures move a node to
//! `Unhealthy` after N rounds and to `Crashed` after N + M; one success
//! resets the count and brings an unhealthy node back to `Running`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::HealthConfig;
use crate::dispatch::call_socket;
use crate::protocol::{HEALTHY, Params, ReservedMethod};
use crate::supervisor::{NodeProcess, NodeState, Supervisor};

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum HealthOutcome {
    Healthy,
    Failed(String),
}

impl HealthOutcome {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Per-node summary of a health round
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub node_id: String,
    pub outcome: HealthOutcome,
    pub consecutive_failures: u32,
    /// State after the round was applied
    pub state: NodeState,
    /// Body of the node's health response, if it answered
    pub detail: Option<Value>,
}

/// Drives health-based state transitions
#[derive(Debug)]
pub struct HealthMonitor {
    supervisor: Supervisor,
    config: HealthConfig,
    /// Consecutive failures per node id, tagged with the pid they were
    /// counted against
    failures: HashMap<String, (u32, u32)>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(supervisor: Supervisor, config: HealthConfig) -> Self {
        Self {
            supervisor,
            config,
            failures: HashMap::new(),
        }
    }

    /// Consecutive failures currently recorded for a node
    #[must_use]
    pub fn failures(&self, node_id: &str) -> u32 {
        self.failures.get(node_id).map_or(0, |&(_, count)| count)
    }

    /// Probe every monitored node once and apply the results
    pub async fn check_once(&mut self) -> Vec<HealthReport> {
        let nodes: Vec<NodeProcess> = self
            .supervisor
            .list()
            .into_iter()
            .filter(|node| node.state.is_monitored())
            .collect();

        // A relaunched node starts with a clean count
        self.failures.retain(|id, (pid, _)| {
            nodes
                .iter()
                .any(|node| &node.descriptor_id == id && node.pid == *pid)
        });

        let timeout = self.config.timeout;
        let outcomes =
            futures::future::join_all(nodes.iter().map(|node| probe_node(node, timeout))).await;

        nodes
            .into_iter()
            .zip(outcomes)
            .map(|(node, (outcome, detail))| self.apply(node, outcome, detail))
            .collect()
    }

    fn apply(
        &mut self,
        node: NodeProcess,
        outcome: HealthOutcome,
        detail: Option<Value>,
    ) -> HealthReport {
        let node_id = node.descriptor_id;

        let consecutive_failures = match &outcome {
            HealthOutcome::Healthy => {
                self.failures.remove(&node_id);
                if self.supervisor.mark_healthy(&node_id) {
                    tracing::info!(node_id = %node_id, "node recovered");
                }
                0
            }
            HealthOutcome::Failed(reason) => {
                let (_, count) = self.failures.entry(node_id.clone()).or_insert((node.pid, 0));
                *count += 1;
                let count = *count;
                tracing::debug!(
                    node_id = %node_id,
                    failures = count,
                    reason = %reason,
                    "health check failed"
                );

                let crash_at = self.config.unhealthy_threshold + self.config.crash_threshold;
                if count >= crash_at {
                    self.failures.remove(&node_id);
                    let _ = self.supervisor.mark_crashed(
                        &node_id,
                        &format!("{count} consecutive failed health checks, last: {reason}"),
                    );
                } else if count >= self.config.unhealthy_threshold
                    && self.supervisor.mark_unhealthy(&node_id)
                {
                    tracing::warn!(
                        node_id = %node_id,
                        failures = count,
                        reason = %reason,
                        "node unhealthy"
                    );
                }
                count
            }
        };

        let state = self
            .supervisor
            .get(&node_id)
            .map_or(node.state, |current| current.state);

        HealthReport {
            node_id,
            outcome,
            consecutive_failures,
            state,
            detail,
        }
    }

    /// Run rounds every interval until `shutdown` becomes true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        tracing::info!(interval = ?self.config.interval, "health monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("health monitor stopped");
    }

    /// Run the monitor on its own task
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Send one `node.health` call and judge the answer
///
/// A node is healthy when it answers in time with `"status": "healthy"`.
pub async fn probe_node(node: &NodeProcess, timeout: Duration) -> (HealthOutcome, Option<Value>) {
    let result = call_socket(
        &node.descriptor_id,
        &node.socket_path,
        ReservedMethod::Health.as_str(),
        Params::new(),
        timeout,
    )
    .await;

    match result {
        Ok(body) => {
            let status = body.get("status").and_then(Value::as_str);
            let outcome = if status == Some(HEALTHY) {
                HealthOutcome::Healthy
            } else {
                HealthOutcome::Failed(format!(
                    "node reported status '{}'",
                    status.unwrap_or("<missing>")
                ))
            };
            (outcome, Some(body))
        }
        Err(e) => (HealthOutcome::Failed(e.to_string()), None),
    }
}
