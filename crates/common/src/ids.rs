//! Typed identifiers shared across planner/tablet components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a dedicated backend connection.
///
/// Assigned by the stateful pool at registration time; survives a renew even
/// though the underlying MySQL connection id changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(
    /// Raw numeric id value.
    pub i64,
);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
