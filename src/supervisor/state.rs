//! Node lifecycle states

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a launched node process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Spawned, socket not yet accepting connections
    Starting,
    /// Accepting requests
    Running,
    /// Failing health checks but still alive
    Unhealthy,
    /// Shutdown in progress
    Stopping,
    /// Terminated on request and cleaned up
    Stopped,
    /// Exited unexpectedly, failed to start, or declared dead
    Crashed,
}

impl NodeState {
    /// Whether a process may still be alive in this state
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Unhealthy | Self::Stopping
        )
    }

    /// Whether the dispatcher may route calls to the node
    #[must_use]
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the health monitor probes the node
    #[must_use]
    pub const fn is_monitored(self) -> bool {
        matches!(self, Self::Running | Self::Unhealthy)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_accepts_requests() {
        assert!(NodeState::Running.accepts_requests());
        assert!(!NodeState::Unhealthy.accepts_requests());
        assert!(!NodeState::Starting.accepts_requests());
    }

    #[test]
    fn terminal_states_are_not_live() {
        assert!(!NodeState::Stopped.is_live());
        assert!(!NodeState::Crashed.is_live());
        assert!(NodeState::Stopping.is_live());
    }

    #[test]
    fn display_and_serialize_agree() {
        let json = serde_json::to_string(&NodeState::Unhealthy).unwrap();
        assert_eq!(json, format!("\"{}\"", NodeState::Unhealthy));
    }
}
