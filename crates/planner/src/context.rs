//! Planning context and the vschema contract.

use std::fmt;
use std::sync::Arc;

use kmx_common::Result;
use kmx_sql::{ReservedVars, SqlParser};
use kmx_sql::ast::SelectStatement;
use kmx_vindex::Vindex;
use serde::{Deserialize, Serialize};

use crate::semantics::{analyze, SemTable};

/// MySQL collation id of the proxy session.
pub type CollationId = u32;

/// A logical database that may be sharded across multiple backends.
///
/// Identity is by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    pub name: String,
    pub sharded: bool,
}

/// One column-to-vindex binding on a table.
#[derive(Clone)]
pub struct ColumnVindex {
    pub column: String,
    pub vindex: Arc<dyn Vindex>,
}

impl fmt::Debug for ColumnVindex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnVindex")
            .field("column", &self.column)
            .field("vindex", &self.vindex.name())
            .finish()
    }
}

/// Catalog entry for a user table.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub keyspace: Keyspace,
    /// Column vindexes, primary first.
    pub column_vindexes: Vec<ColumnVindex>,
    /// Reference tables are replicated to every shard and can be served from
    /// any of them.
    pub reference: bool,
}

/// Planner versions selectable per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlannerVersion {
    /// The production planner.
    #[default]
    Stable,
    /// Opt-in staging ground for planner changes.
    Preview,
}

/// Read-only directory the planner consults: keyspaces, tables, session
/// collation, and the parser handle.
pub trait VSchema {
    /// Keyspace selected by the session (`USE ks`), when any.
    fn selected_keyspace(&self) -> Result<Keyspace>;

    /// Lexicographically first keyspace; anchor for locking pseudo-queries.
    fn first_sorted_keyspace(&self) -> Result<Keyspace>;

    /// Resolve a table reference against the catalog.
    fn find_table(&self, qualifier: Option<&str>, name: &str) -> Result<Table>;

    /// Collation of the proxy session connection.
    fn conn_collation(&self) -> CollationId;

    /// Parser handle for re-parsing statements during planning.
    fn parser(&self) -> &SqlParser;

    /// Record a non-fatal planner warning for the session.
    fn planner_warning(&self, warning: &str);
}

/// Carries everything one planning pass needs.
pub struct PlanningContext<'a> {
    pub sem_table: SemTable,
    pub vschema: &'a dyn VSchema,
    pub reserved_vars: &'a mut ReservedVars,
    pub version: PlannerVersion,
}

/// Analyze the statement and assemble a [`PlanningContext`].
pub fn create_planning_context<'a>(
    stmt: &SelectStatement,
    reserved_vars: &'a mut ReservedVars,
    vschema: &'a dyn VSchema,
    version: PlannerVersion,
) -> Result<PlanningContext<'a>> {
    let default_keyspace = vschema.selected_keyspace().ok();
    let sem_table = analyze(stmt, default_keyspace.as_ref().map(|k| k.name.as_str()), vschema)?;
    if let Some(warning) = &sem_table.warning {
        vschema.planner_warning(warning);
    }
    Ok(PlanningContext {
        sem_table,
        vschema,
        reserved_vars,
        version,
    })
}
