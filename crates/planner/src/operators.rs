//! Abstract relational operators.
//!
//! The builder turns an analyzed statement into an operator tree, then
//! normalizes and inspects its predicates: system-schema filters are lifted
//! into route metadata and unique-vindex point predicates pick the routing
//! opcode. The transformer consumes the tree and discards it.

use std::collections::BTreeMap;
use std::sync::Arc;

use kmx_common::{KmxError, Result};
use kmx_sql::ast::{ComparisonOp, Expr, SelectStatement};
use kmx_sql::split_and;
use kmx_vindex::Vindex;

use crate::context::{Keyspace, PlanningContext, VSchema};
use crate::eval::{translate, EvalExpr, TranslateConfig};
use crate::primitive::RouteOpcode;
use crate::semantics::TableInfo;

/// Abstract operator tree with a `tables_used` accessor.
#[derive(Debug)]
pub enum Operator {
    Route(RouteOp),
}

impl Operator {
    /// Keyspace-qualified names of every table this operator touches.
    pub fn tables_used(&self) -> Vec<String> {
        match self {
            Operator::Route(r) => r.tables.clone(),
        }
    }
}

/// Route operator: the whole statement goes to one set of shards.
pub struct RouteOp {
    pub opcode: RouteOpcode,
    pub keyspace: Keyspace,
    /// Statement to send, already normalized.
    pub stmt: SelectStatement,
    pub tables: Vec<String>,
    /// Unique-vindex selection backing `EqualUnique`.
    pub vindex: Option<VindexSelection>,
    /// `table_schema` filters for system-schema routes.
    pub sys_table_table_schema: Vec<EvalExpr>,
    /// `table_name` filters for system-schema routes, keyed by the reserved
    /// bind variable that will carry the value.
    pub sys_table_table_name: BTreeMap<String, EvalExpr>,
}

impl std::fmt::Debug for RouteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOp")
            .field("opcode", &self.opcode)
            .field("keyspace", &self.keyspace.name)
            .field("tables", &self.tables)
            .finish()
    }
}

/// A vindex chosen to resolve route destinations.
#[derive(Clone)]
pub struct VindexSelection {
    pub name: String,
    pub vindex: Arc<dyn Vindex>,
    pub values: Vec<EvalExpr>,
}

/// Build the operator tree for an analyzed statement.
pub fn plan_query(ctx: &mut PlanningContext<'_>, stmt: &SelectStatement) -> Result<Operator> {
    let conjuncts = top_level_conjuncts(stmt);

    let mut sys_tables = Vec::new();
    let mut real_tables = Vec::new();
    let mut saw_dual = false;
    for info in &ctx.sem_table.tables {
        match info {
            TableInfo::Dual => saw_dual = true,
            TableInfo::SysTable { schema, name } => sys_tables.push((schema.clone(), name.clone())),
            TableInfo::Real { table } => real_tables.push(table.clone()),
        }
    }

    if !sys_tables.is_empty() {
        return plan_sys_table_route(ctx, stmt, &sys_tables, &conjuncts);
    }

    if real_tables.is_empty() {
        // Bare-dual (or table-free) statement that fell through the routing
        // tier's constant path; any shard can answer it.
        let keyspace = anchor_keyspace(ctx.vschema)?;
        let tables = vec![dual_table_name(ctx.vschema)];
        return Ok(Operator::Route(RouteOp {
            opcode: RouteOpcode::Reference,
            keyspace,
            stmt: stmt.clone(),
            tables,
            vindex: None,
            sys_table_table_schema: Vec::new(),
            sys_table_table_name: BTreeMap::new(),
        }));
    }

    let keyspace = real_tables[0].keyspace.clone();
    if real_tables.iter().any(|t| t.keyspace != keyspace) {
        return Err(KmxError::Unsupported(
            "cross-keyspace joins are not supported".to_string(),
        ));
    }

    let mut tables: Vec<String> = Vec::new();
    for t in &real_tables {
        let qualified = format!("{}.{}", t.keyspace.name, t.name);
        if !tables.contains(&qualified) {
            tables.push(qualified);
        }
    }
    if saw_dual {
        let dual = dual_table_name(ctx.vschema);
        if !tables.contains(&dual) {
            tables.push(dual);
        }
    }

    let mut opcode = if !keyspace.sharded {
        RouteOpcode::Unsharded
    } else if real_tables.iter().all(|t| t.reference) {
        RouteOpcode::Reference
    } else {
        RouteOpcode::Scatter
    };

    let mut vindex = None;
    if opcode == RouteOpcode::Scatter {
        if let Some(selection) = best_vindex_selection(ctx, &real_tables, &conjuncts) {
            opcode = RouteOpcode::EqualUnique;
            vindex = Some(selection);
        }
    }

    Ok(Operator::Route(RouteOp {
        opcode,
        keyspace,
        stmt: stmt.clone(),
        tables,
        vindex,
        sys_table_table_schema: Vec::new(),
        sys_table_table_name: BTreeMap::new(),
    }))
}

fn plan_sys_table_route(
    ctx: &mut PlanningContext<'_>,
    stmt: &SelectStatement,
    sys_tables: &[(String, String)],
    conjuncts: &[Expr],
) -> Result<Operator> {
    let keyspace = anchor_keyspace(ctx.vschema)?;
    let cfg = TranslateConfig {
        collation: ctx.vschema.conn_collation(),
    };

    let mut sys_table_table_schema = Vec::new();
    let mut sys_table_table_name = BTreeMap::new();
    for conjunct in conjuncts {
        let Some((column, value)) = as_column_equality(conjunct) else {
            continue;
        };
        if column.eq_ignore_ascii_case("table_schema") {
            if let Ok(translated) = translate(value, &cfg) {
                sys_table_table_schema.push(translated);
            }
        } else if column.eq_ignore_ascii_case("table_name") {
            if let Ok(translated) = translate(value, &cfg) {
                sys_table_table_name.insert(ctx.reserved_vars.reserve(), translated);
            }
        }
    }

    let tables = sys_tables
        .iter()
        .map(|(schema, name)| format!("{schema}.{name}"))
        .collect();

    Ok(Operator::Route(RouteOp {
        opcode: RouteOpcode::Dba,
        keyspace,
        stmt: stmt.clone(),
        tables,
        vindex: None,
        sys_table_table_schema,
        sys_table_table_name,
    }))
}

// Point predicates can only pick a single shard through a unique vindex on a
// single table; joins always scatter.
fn best_vindex_selection(
    ctx: &PlanningContext<'_>,
    real_tables: &[crate::context::Table],
    conjuncts: &[Expr],
) -> Option<VindexSelection> {
    if real_tables.len() != 1 {
        return None;
    }
    let cfg = TranslateConfig {
        collation: ctx.vschema.conn_collation(),
    };
    let mut best: Option<VindexSelection> = None;
    for cv in &real_tables[0].column_vindexes {
        if !cv.vindex.is_unique() {
            continue;
        }
        for conjunct in conjuncts {
            let Some((column, value)) = as_column_equality(conjunct) else {
                continue;
            };
            if !column.eq_ignore_ascii_case(&cv.column) {
                continue;
            }
            let Ok(translated) = translate(value, &cfg) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(current) => cv.vindex.cost() < current.vindex.cost(),
            };
            if better {
                best = Some(VindexSelection {
                    name: cv.vindex.name().to_string(),
                    vindex: Arc::clone(&cv.vindex),
                    values: vec![translated],
                });
            }
        }
    }
    best
}

// `col = <expr>` or `<expr> = col`, returning the column name and the other
// side.
fn as_column_equality(e: &Expr) -> Option<(&str, &Expr)> {
    let Expr::Comparison {
        op: ComparisonOp::Eq,
        left,
        right,
    } = e
    else {
        return None;
    };
    match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), value) if !matches!(value, Expr::Column(_)) => Some((&c.name, value)),
        (value, Expr::Column(c)) if !matches!(value, Expr::Column(_)) => Some((&c.name, value)),
        _ => None,
    }
}

fn top_level_conjuncts(stmt: &SelectStatement) -> Vec<Expr> {
    let mut out = Vec::new();
    if let Some(sel) = stmt.as_select() {
        if let Some(w) = &sel.where_clause {
            split_and(w, &mut out);
        }
    }
    out
}

fn anchor_keyspace(vschema: &dyn VSchema) -> Result<Keyspace> {
    vschema
        .selected_keyspace()
        .or_else(|_| vschema.first_sorted_keyspace())
}

fn dual_table_name(vschema: &dyn VSchema) -> String {
    match vschema.selected_keyspace() {
        Ok(ks) => format!("{}.dual", ks.name),
        Err(_) => "dual".to_string(),
    }
}
