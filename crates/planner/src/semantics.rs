//! Minimal semantic analysis: resolve FROM items against the vschema and
//! decide whether the whole statement can short-circuit to a single
//! unsharded keyspace.

use kmx_common::{KmxError, Result};
use kmx_sql::ast::{SelectStatement, SimpleTableExpr, TableExpr};

use crate::context::{Keyspace, Table, VSchema};

/// Schemas owned by MySQL itself; queries against them route as `Dba`.
pub const SYSTEM_SCHEMAS: [&str; 4] = [
    "information_schema",
    "performance_schema",
    "mysql",
    "sys",
];

/// One resolved FROM item.
#[derive(Debug, Clone)]
pub enum TableInfo {
    /// The `dual` pseudo-table.
    Dual,
    /// A system-schema table.
    SysTable {
        schema: String,
        name: String,
    },
    /// A user table resolved in the catalog.
    Real {
        table: Table,
    },
}

/// Result of semantic analysis over one statement.
#[derive(Debug, Clone, Default)]
pub struct SemTable {
    /// Resolved FROM items, in statement order, derived tables flattened.
    pub tables: Vec<TableInfo>,
    /// Set when the statement cannot be planned against an unsharded-only
    /// view of the world; surfaced if no other plan is found.
    pub not_unsharded_err: Option<String>,
    /// Non-fatal observation worth reporting to the session.
    pub warning: Option<String>,
}

impl SemTable {
    /// When every user table lives in the same unsharded keyspace, the
    /// statement can be routed there verbatim.
    pub fn can_take_select_unsharded_shortcut(&self) -> Option<Keyspace> {
        let mut keyspace: Option<Keyspace> = None;
        for info in &self.tables {
            match info {
                TableInfo::Dual => {}
                TableInfo::SysTable { .. } => return None,
                TableInfo::Real { table } => {
                    if table.keyspace.sharded {
                        return None;
                    }
                    match &keyspace {
                        None => keyspace = Some(table.keyspace.clone()),
                        Some(ks) if *ks == table.keyspace => {}
                        Some(_) => return None,
                    }
                }
            }
        }
        keyspace
    }
}

/// Resolve every table the statement references.
///
/// `default_keyspace` qualifies unqualified names; resolution failures are
/// recorded as `not_unsharded_err` rather than failing the analysis, so the
/// planner can surface them only when no plan exists.
pub fn analyze(
    stmt: &SelectStatement,
    default_keyspace: Option<&str>,
    vschema: &dyn VSchema,
) -> Result<SemTable> {
    let mut sem = SemTable::default();
    collect_stmt(stmt, default_keyspace, vschema, &mut sem)?;

    if sem.warning.is_none() && matches!(stmt, SelectStatement::Union(_)) {
        let scatter = sem.tables.iter().any(|t| match t {
            TableInfo::Real { table } => table.keyspace.sharded,
            _ => false,
        });
        if scatter {
            sem.warning = Some("union over a sharded keyspace is routed as a scatter".to_string());
        }
    }
    Ok(sem)
}

fn collect_stmt(
    stmt: &SelectStatement,
    default_keyspace: Option<&str>,
    vschema: &dyn VSchema,
    sem: &mut SemTable,
) -> Result<()> {
    for item in stmt.from_items() {
        collect_table_expr(item, default_keyspace, vschema, sem)?;
    }
    Ok(())
}

fn collect_table_expr(
    item: &TableExpr,
    default_keyspace: Option<&str>,
    vschema: &dyn VSchema,
    sem: &mut SemTable,
) -> Result<()> {
    match item {
        TableExpr::Aliased(ate) => match &ate.expr {
            SimpleTableExpr::Table(t) => {
                if t.qualifier.is_none() && t.name.eq_ignore_ascii_case("dual") {
                    sem.tables.push(TableInfo::Dual);
                    return Ok(());
                }
                if let Some(q) = &t.qualifier {
                    if SYSTEM_SCHEMAS.iter().any(|s| q.eq_ignore_ascii_case(s)) {
                        sem.tables.push(TableInfo::SysTable {
                            schema: q.to_lowercase(),
                            name: t.name.clone(),
                        });
                        return Ok(());
                    }
                }
                let qualifier = t.qualifier.as_deref().or(default_keyspace);
                match vschema.find_table(qualifier, &t.name) {
                    Ok(table) => sem.tables.push(TableInfo::Real { table }),
                    Err(err) => {
                        if sem.not_unsharded_err.is_none() {
                            sem.not_unsharded_err = Some(match err {
                                KmxError::Planning(msg) => msg,
                                other => other.to_string(),
                            });
                        }
                    }
                }
                Ok(())
            }
            SimpleTableExpr::Derived(inner) => {
                collect_stmt(inner, default_keyspace, vschema, sem)
            }
        },
        TableExpr::Join(join) => {
            collect_table_expr(&join.left, default_keyspace, vschema, sem)?;
            collect_table_expr(&join.right, default_keyspace, vschema, sem)
        }
    }
}
