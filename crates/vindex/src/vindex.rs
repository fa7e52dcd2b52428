//! The vindex contract.
//!
//! A vindex maps user column values to keyspace ids. The core trait carries
//! the attributes every vindex has; optional capabilities (single-column
//! mapping, reversal, hashing, sequential ranges) are separate narrow traits
//! that implementations opt into through explicit `as_*` adapters.

use std::collections::HashMap;

use kmx_common::Result;
use kmx_sql::Value;

use crate::destination::ShardDestination;

/// Execution-time cursor handed to vindexes whose mapping requires running
/// queries against a backend (`needs_vcursor`).
pub trait VCursor: Send {
    /// Run a keyspace-id lookup query with the given bind variables.
    fn execute(
        &mut self,
        query: &str,
        bind_vars: &HashMap<String, Value>,
    ) -> Result<Vec<Vec<Value>>>;
}

/// Core vindex contract: attributes shared by every vindex plus capability
/// adapters.
pub trait Vindex: Send + Sync + std::fmt::Debug {
    /// Configured name of this vindex instance.
    fn name(&self) -> &str;

    /// Relative cost of using this vindex; lower is preferred when several
    /// columns could route a query.
    fn cost(&self) -> u32;

    /// Whether one input value maps to at most one keyspace id.
    fn is_unique(&self) -> bool;

    /// Whether mapping requires an execution-time cursor.
    fn needs_vcursor(&self) -> bool;

    /// Parameter names this vindex received but does not understand.
    /// Preserved for diagnostics.
    fn unknown_params(&self) -> &[String] {
        &[]
    }

    /// Single-column mapping capability, when implemented.
    fn as_single_column(&self) -> Option<&dyn SingleColumn> {
        None
    }

    /// Reverse-mapping capability, when implemented.
    fn as_reversible(&self) -> Option<&dyn Reversible> {
        None
    }

    /// Pure-hashing capability, when implemented.
    fn as_hashing(&self) -> Option<&dyn Hashing> {
        None
    }

    /// Sequential range-mapping capability, when implemented.
    fn as_sequential(&self) -> Option<&dyn Sequential> {
        None
    }
}

/// Vindexes keyed on a single column.
pub trait SingleColumn: Vindex {
    /// Map each id to a shard destination.
    fn map(
        &self,
        cursor: Option<&mut dyn VCursor>,
        ids: &[Value],
    ) -> Result<Vec<ShardDestination>>;

    /// Whether each id maps to the corresponding keyspace id.
    fn verify(
        &self,
        cursor: Option<&mut dyn VCursor>,
        ids: &[Value],
        ksids: &[Vec<u8>],
    ) -> Result<Vec<bool>>;
}

/// Vindexes that can recover ids from keyspace ids.
pub trait Reversible: Vindex {
    /// Recover the id for each keyspace id; fails per-row on an absent id.
    fn reverse_map(
        &self,
        cursor: Option<&mut dyn VCursor>,
        ksids: &[Option<Vec<u8>>],
    ) -> Result<Vec<Value>>;
}

/// Vindexes with a deterministic, pure value-to-bytes hash.
pub trait Hashing: Vindex {
    /// Hash one value to its keyspace id bytes.
    fn hash(&self, id: &Value) -> Result<Vec<u8>>;
}

/// Vindexes whose hash preserves ordering, enabling range mapping.
pub trait Sequential: Vindex {
    /// Map an id range to a single destination key range spanning the two
    /// hashed endpoints.
    fn range_map(
        &self,
        cursor: Option<&mut dyn VCursor>,
        start: &Value,
        end: &Value,
    ) -> Result<Vec<ShardDestination>>;
}

/// Parameter names in `params` that are not in `known`, sorted for stable
/// diagnostics.
pub fn find_unknown_params(params: &HashMap<String, String>, known: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = params
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .cloned()
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::find_unknown_params;
    use std::collections::HashMap;

    #[test]
    fn unknown_params_are_sorted() {
        let mut params = HashMap::new();
        params.insert("zeta".to_string(), "1".to_string());
        params.insert("alpha".to_string(), "2".to_string());
        params.insert("table".to_string(), "t".to_string());
        let unknown = find_unknown_params(&params, &["table"]);
        assert_eq!(unknown, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
