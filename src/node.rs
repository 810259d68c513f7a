//! Cluster member identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one cluster member: a logical name plus the address the
/// membership provider advertises for it.
///
/// `Node` values are opaque to this crate: they are produced by the
/// membership provider and compared, ordered, and hashed as a whole. The
/// ordering is used to keep fan-out result maps deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Logical member name, unique within the group.
    pub name: String,
    /// Host the member is reachable at.
    pub host: String,
    /// Port the member is reachable at.
    pub port: u16,
}

impl Node {
    /// Create a node identity.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// Ring placement for consistent hashing. The full identity participates so
/// two members sharing a logical name on different addresses land on
/// different ring positions.
impl conhash::Node for Node {
    fn name(&self) -> String {
        format!("{}@{}:{}", self.name, self.host, self.port)
    }
}
