//! Executable plan primitives.
//!
//! The transformer lowers the abstract operator tree into this enum; the
//! execution engine walks it. Children are exclusively owned by their parent,
//! and two plans for the same statement compare equal.

use std::collections::BTreeMap;

use kmx_sql::ast::LockingFunc;
use kmx_vindex::ShardDestination;
use serde::{Deserialize, Serialize};

use crate::context::Keyspace;
use crate::eval::EvalExpr;

/// Executable plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    /// Send a SQL fragment to one or more shards.
    Route(Route),
    /// Evaluate expressions over an input primitive.
    Projection(Projection),
    /// Produce one synthetic empty row.
    SingleRow,
    /// Run a limit plan and a count plan for `SQL_CALC_FOUND_ROWS`.
    SqlCalcFoundRows(SqlCalcFoundRows),
    /// Evaluate advisory locking functions on a single shard.
    Lock(Lock),
    /// Resolve shard destinations through a cursor-backed vindex, then route.
    VindexLookup(VindexLookup),
}

impl Primitive {
    /// Short kind label used for plan metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Primitive::Route(_) => "route",
            Primitive::Projection(_) => "projection",
            Primitive::SingleRow => "single_row",
            Primitive::SqlCalcFoundRows(_) => "sql_calc_found_rows",
            Primitive::Lock(_) => "lock",
            Primitive::VindexLookup(_) => "vindex_lookup",
        }
    }

    /// Set the no-routes sentinel on the outermost route-like node.
    ///
    /// Only `Route` and the `send_to` half of `VindexLookup` need the
    /// sentinel: every other primitive already produces a well-formed empty
    /// result.
    pub fn mark_no_routes_special_handling(&mut self) {
        match self {
            Primitive::Route(route) => route.no_routes_special_handling = true,
            Primitive::VindexLookup(lookup) => lookup.send_to.no_routes_special_handling = true,
            _ => {}
        }
    }
}

/// How a route picks its target shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOpcode {
    /// Single shard of an unsharded keyspace.
    Unsharded,
    /// Exactly one shard located through a unique vindex.
    EqualUnique,
    /// All shards, results merged.
    Scatter,
    /// System schema (`information_schema` and friends).
    Dba,
    /// Any single shard; the data is identical everywhere.
    Reference,
}

/// Route: send `query` to the shards picked by `opcode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub opcode: RouteOpcode,
    pub keyspace: Keyspace,
    /// Query sent to each target shard.
    pub query: String,
    /// Field-probe query matching no rows, used to fetch column metadata.
    pub field_query: String,
    /// Vindex used to resolve destinations for `EqualUnique`.
    pub vindex: Option<String>,
    /// Values fed to the vindex at execution time.
    pub values: Vec<EvalExpr>,
    /// `table_schema` filters extracted from a system-schema query.
    pub sys_table_table_schema: Vec<EvalExpr>,
    /// `table_name` filters extracted from a system-schema query.
    pub sys_table_table_name: BTreeMap<String, EvalExpr>,
    /// Forces a synthetic zero/NULL row when no shard matches, preserving
    /// SQL aggregation semantics.
    pub no_routes_special_handling: bool,
    /// Per-query timeout from a `/*kmx+ QUERY_TIMEOUT_MS=n */` directive.
    pub query_timeout_ms: Option<u64>,
}

impl Route {
    /// Route with the given shape and empty optional fields.
    pub fn new(opcode: RouteOpcode, keyspace: Keyspace, query: String, field_query: String) -> Self {
        Self {
            opcode,
            keyspace,
            query,
            field_query,
            vindex: None,
            values: Vec::new(),
            sys_table_table_schema: Vec::new(),
            sys_table_table_name: BTreeMap::new(),
            no_routes_special_handling: false,
            query_timeout_ms: None,
        }
    }
}

/// Expression projection over an input primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub exprs: Vec<EvalExpr>,
    pub cols: Vec<String>,
    pub input: Box<Primitive>,
}

/// `SQL_CALC_FOUND_ROWS` pair: the limited result and the total count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCalcFoundRows {
    pub limit: Box<Primitive>,
    pub count: Box<Primitive>,
}

/// One advisory locking call within a [`Lock`] primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFunc {
    /// The parsed locking function.
    pub func: LockingFunc,
    /// Translated lock-name argument, when the function takes one.
    pub name: Option<EvalExpr>,
}

/// Evaluate locking functions against a pinned shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub keyspace: Keyspace,
    pub target_destination: ShardDestination,
    /// Field-probe query for result metadata.
    pub field_query: String,
    pub lock_functions: Vec<LockFunc>,
}

/// Route whose destinations come from a cursor-backed vindex lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VindexLookup {
    /// Name of the vindex consulted at execution time.
    pub vindex: String,
    /// Values resolved through the vindex.
    pub values: Vec<EvalExpr>,
    /// The route executed with the resolved destinations.
    pub send_to: Box<Route>,
}

#[cfg(test)]
mod tests {
    use super::{Primitive, Route, RouteOpcode, VindexLookup};
    use crate::context::Keyspace;

    fn route() -> Route {
        Route::new(
            RouteOpcode::Scatter,
            Keyspace {
                name: "main".to_string(),
                sharded: true,
            },
            "select a from t".to_string(),
            "select a from t where 1 != 1".to_string(),
        )
    }

    #[test]
    fn sentinel_lands_on_route() {
        let mut p = Primitive::Route(route());
        p.mark_no_routes_special_handling();
        let Primitive::Route(r) = &p else { unreachable!() };
        assert!(r.no_routes_special_handling);
    }

    #[test]
    fn sentinel_lands_on_vindex_lookup_send_to() {
        let mut p = Primitive::VindexLookup(VindexLookup {
            vindex: "binary".to_string(),
            values: Vec::new(),
            send_to: Box::new(route()),
        });
        p.mark_no_routes_special_handling();
        let Primitive::VindexLookup(l) = &p else { unreachable!() };
        assert!(l.send_to.no_routes_special_handling);
    }
}
