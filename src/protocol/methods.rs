//! Reserved method names every node understands

use std::fmt;

/// Health status a node reports when it is able to serve requests
pub const HEALTHY: &str = "healthy";

/// Methods with a fixed meaning across all nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedMethod {
    /// Identity and metadata of the node
    Info,
    /// Zero-argument liveness probe
    Health,
    /// Run the node's business logic
    Execute,
    /// Check parameters without executing
    Validate,
    /// Cooperative shutdown request
    Shutdown,
}

impl ReservedMethod {
    /// All reserved methods
    pub const ALL: [Self; 5] = [
        Self::Info,
        Self::Health,
        Self::Execute,
        Self::Validate,
        Self::Shutdown,
    ];

    /// Wire name of the method
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "node.info",
            Self::Health => "node.health",
            Self::Execute => "node.execute",
            Self::Validate => "node.validate",
            Self::Shutdown => "node.shutdown",
        }
    }

    /// Look up a reserved method by its wire name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for ReservedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
