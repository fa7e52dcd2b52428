//! SELECT planning entry point.
//!
//! Responsibilities:
//! - constant-only `dual` selects answered at the routing tier, including
//!   advisory locking functions;
//! - the `SQL_CALC_FOUND_ROWS` split into a limit plan and a count plan;
//! - the general build path (unsharded shortcut, operator tree, lowering);
//! - the CNF retry for system-schema routes that found no filters;
//! - the no-routes sentinel that keeps aggregation semantics on empty
//!   scatters.

use kmx_common::{global_metrics, KmxError, PlannerConfig, Result};
use kmx_sql::ast::{
    AggregateFunc, AliasedExpr, AliasedTableExpr, Expr, Literal, Select, SelectExpr,
    SelectStatement, SimpleTableExpr,
};
use kmx_sql::{format_impossible_query, rewrite_predicate, ReservedVars};
use kmx_vindex::ShardDestination;
use tracing::debug;

use crate::context::{create_planning_context, Keyspace, PlannerVersion, PlanningContext, VSchema};
use crate::eval::{translate, TranslateConfig};
use crate::operators::plan_query;
use crate::primitive::{
    Lock, LockFunc, Primitive, Projection, Route, RouteOpcode, SqlCalcFoundRows,
};
use crate::semantics::{analyze, TableInfo};
use crate::transform::{query_timeout_directive, transform_to_primitive};

/// Stable error id for mixing a LOCK function with other expressions.
const VT12001: &str = "VT12001";

/// A finished plan: the primitive tree plus the tables it touches.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    pub primitive: Primitive,
    pub tables_used: Vec<String>,
}

/// Plan one SELECT statement.
///
/// `query` is the original SQL text; it is re-parsed when a plan needs a
/// second, independent AST, and quoted in error context.
pub fn plan_select(
    query: &str,
    version: PlannerVersion,
    stmt: &SelectStatement,
    reserved_vars: &mut ReservedVars,
    vschema: &dyn VSchema,
) -> Result<PlanResult> {
    if let SelectStatement::Select(sel) = stmt {
        // Constant dual selects never leave the routing tier.
        if let Some(primitive) = handle_dual_selects(sel, vschema)? {
            let used = match vschema.selected_keyspace() {
                // Logging wants the qualified name; a missing default
                // keyspace is not worth failing the plan over.
                Ok(ks) => format!("{}.dual", ks.name),
                Err(_) => "dual".to_string(),
            };
            return Ok(finish(primitive, vec![used]));
        }
    }

    let mut stmt = stmt.clone();
    if let SelectStatement::Select(sel) = &mut stmt {
        if sel.sql_calc_found_rows && sel.limit.is_some() {
            return plan_sql_calc_found_rows(query, sel, reserved_vars, vschema, version);
        }
        // Without a limit the directive changes nothing; drop it so the
        // routed query stays clean.
        sel.sql_calc_found_rows = false;
    }

    let (mut primitive, mut tables_used) =
        build_select_plan(&stmt, reserved_vars, vschema, version).map_err(|e| wrap_query(query, e))?;

    if should_retry_after_predicate_rewriting(&primitive) {
        // Normalizing to CNF can surface system-schema filters hidden in
        // disjunctions; keep the original plan unless the retry strictly
        // improves on it.
        if let Some((better, better_tables)) =
            predicate_rewrite(&stmt, reserved_vars, vschema, version)
        {
            primitive = better;
            tables_used = better_tables;
        }
    }

    if let SelectStatement::Select(sel) = &stmt {
        if is_only_dual(sel) || (sel.group_by.is_empty() && sel.all_aggregation()) {
            // A Route that finds no shard produces nothing; aggregations
            // must still see a zero/NULL row.
            primitive.mark_no_routes_special_handling();
        }
    }

    Ok(finish(primitive, tables_used))
}

fn finish(primitive: Primitive, tables_used: Vec<String>) -> PlanResult {
    global_metrics().record_query_plan(primitive.kind());
    debug!(plan = primitive.kind(), tables = ?tables_used, "planned select");
    PlanResult {
        primitive,
        tables_used,
    }
}

fn wrap_query(query: &str, err: KmxError) -> KmxError {
    match err {
        e @ (KmxError::Planning(_) | KmxError::Unsupported(_)) => e,
        other => KmxError::wrap(format!("query {query:?}"), other),
    }
}

// -----------------------------
// Build
// -----------------------------

/// Build a primitive for the statement plus its tables-used.
pub(crate) fn build_select_plan(
    stmt: &SelectStatement,
    reserved_vars: &mut ReservedVars,
    vschema: &dyn VSchema,
    version: PlannerVersion,
) -> Result<(Primitive, Vec<String>)> {
    let mut ctx = create_planning_context(stmt, reserved_vars, vschema, version)?;

    if let Some(ks) = ctx.sem_table.can_take_select_unsharded_shortcut() {
        return select_unsharded_shortcut(&ctx, stmt, ks);
    }

    if let Some(err) = &ctx.sem_table.not_unsharded_err {
        return Err(KmxError::Planning(err.clone()));
    }

    let op = plan_query(&mut ctx, stmt)?;
    let tables_used = op.tables_used();
    let primitive = transform_to_primitive(&ctx, op)?;
    Ok((primitive, tables_used))
}

// Every table lives in one unsharded keyspace: ship the statement through
// verbatim.
fn select_unsharded_shortcut(
    ctx: &PlanningContext<'_>,
    stmt: &SelectStatement,
    keyspace: Keyspace,
) -> Result<(Primitive, Vec<String>)> {
    let mut tables_used = Vec::new();
    for info in &ctx.sem_table.tables {
        if let TableInfo::Real { table } = info {
            let qualified = format!("{}.{}", table.keyspace.name, table.name);
            if !tables_used.contains(&qualified) {
                tables_used.push(qualified);
            }
        }
    }

    let mut route = Route::new(
        RouteOpcode::Unsharded,
        keyspace,
        stmt.to_string(),
        format_impossible_query(stmt),
    );
    if let Some(sel) = stmt.as_select() {
        route.query_timeout_ms = query_timeout_directive(sel);
    }
    Ok((Primitive::Route(route), tables_used))
}

// -----------------------------
// CNF retry
// -----------------------------

// A system-schema route that extracted no filters scans every backend's
// schema; worth one retry after predicate normalization.
fn should_retry_after_predicate_rewriting(plan: &Primitive) -> bool {
    match plan {
        Primitive::Route(route) => {
            route.opcode == RouteOpcode::Dba
                && route.sys_table_table_name.is_empty()
                && route.sys_table_table_schema.is_empty()
        }
        _ => false,
    }
}

fn predicate_rewrite(
    stmt: &SelectStatement,
    reserved_vars: &mut ReservedVars,
    vschema: &dyn VSchema,
    version: PlannerVersion,
) -> Option<(Primitive, Vec<String>)> {
    let mut rewritten = stmt.clone();
    let sel = rewritten.as_select_mut()?;
    if let Some(w) = sel.where_clause.take() {
        sel.where_clause = Some(rewrite_predicate(w));
    }
    if let Some(h) = sel.having.take() {
        sel.having = Some(rewrite_predicate(h));
    }

    let (plan, tables_used) = build_select_plan(&rewritten, reserved_vars, vschema, version).ok()?;
    if should_retry_after_predicate_rewriting(&plan) {
        // No improvement; the caller keeps the original plan.
        return None;
    }
    Some((plan, tables_used))
}

// -----------------------------
// SQL_CALC_FOUND_ROWS
// -----------------------------

fn plan_sql_calc_found_rows(
    query: &str,
    sel: &Select,
    reserved_vars: &mut ReservedVars,
    vschema: &dyn VSchema,
    version: PlannerVersion,
) -> Result<PlanResult> {
    let default_keyspace = vschema.selected_keyspace().ok();
    let stmt = SelectStatement::Select(Box::new(sel.clone()));
    let sem_table = analyze(
        &stmt,
        default_keyspace.as_ref().map(|k| k.name.as_str()),
        vschema,
    )?;
    if let Some(warning) = &sem_table.warning {
        vschema.planner_warning(warning);
    }

    let (primitive, tables_used) =
        build_sql_calc_found_rows_plan(query, sel, reserved_vars, vschema, version)
            .map_err(|e| wrap_query(query, e))?;
    Ok(finish(primitive, tables_used))
}

fn build_sql_calc_found_rows_plan(
    query: &str,
    sel: &Select,
    reserved_vars: &mut ReservedVars,
    vschema: &dyn VSchema,
    version: PlannerVersion,
) -> Result<(Primitive, Vec<String>)> {
    let mut limit_sel = sel.clone();
    limit_sel.sql_calc_found_rows = false;
    let limit_stmt = SelectStatement::Select(Box::new(limit_sel));
    let (limit_plan, _) = build_select_plan(&limit_stmt, reserved_vars, vschema, version)?;

    // The limit half was built from the statement the planner has been
    // mutating; the count half must own a distinct tree, so re-parse the
    // original text.
    let (reparsed, reserved) = vschema.parser().parse_select(query)?;
    let SelectStatement::Select(mut count_sel) = reparsed else {
        return Err(KmxError::Planning(
            "SQL_CALC_FOUND_ROWS requires a simple select".to_string(),
        ));
    };
    count_sel.sql_calc_found_rows = false;
    count_sel.order_by.clear();
    count_sel.limit = None;

    let count_star = SelectExpr::Aliased(AliasedExpr {
        expr: Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        },
        alias: None,
    });
    let count_sel = if count_sel.group_by.is_empty() && count_sel.having.is_none() {
        // No grouping: the same query with the select list swapped for a
        // single count(*).
        count_sel.exprs = vec![count_star];
        *count_sel
    } else {
        // Grouping changes the row count, so the stripped query moves into a
        // derived table:
        //   select id, sum(b) from user group by id
        //     => select count(*) from (select id, sum(b) from user group by id) t
        Select {
            exprs: vec![count_star],
            from: vec![kmx_sql::ast::TableExpr::Aliased(AliasedTableExpr {
                expr: SimpleTableExpr::Derived(Box::new(SelectStatement::Select(count_sel))),
                alias: Some("t".to_string()),
            })],
            ..Default::default()
        }
    };

    let mut count_reserved_vars = ReservedVars::new(PlannerConfig::default().bind_var_prefix, reserved);
    let count_stmt = SelectStatement::Select(Box::new(count_sel));
    let (mut count_plan, tables_used) =
        build_select_plan(&count_stmt, &mut count_reserved_vars, vschema, version)?;

    if let Primitive::Route(route) = &mut count_plan {
        // An empty scatter must still report a count of zero.
        route.no_routes_special_handling = true;
    }

    Ok((
        Primitive::SqlCalcFoundRows(SqlCalcFoundRows {
            limit: Box::new(limit_plan),
            count: Box::new(count_plan),
        }),
        tables_used,
    ))
}

// -----------------------------
// Dual handling
// -----------------------------

// Only SELECT and FROM dual, nothing else: no filters, grouping or ordering,
// and a LIMIT only when it cannot suppress the single row. `LIMIT 0` and
// bind-variable limits fall through to the general planner.
fn is_only_dual(sel: &Select) -> bool {
    if sel.where_clause.is_some()
        || !sel.group_by.is_empty()
        || sel.having.is_some()
        || !sel.order_by.is_empty()
    {
        return false;
    }

    if let Some(limit) = &sel.limit {
        if limit.offset.is_some() {
            return false;
        }
        match &limit.rowcount {
            None => {}
            Some(Expr::Literal(Literal::Int(v))) => {
                if v == "0" {
                    return false;
                }
            }
            Some(_) => return false,
        }
    }

    if sel.from.is_empty() {
        // FROM-less selects read from the implicit dual.
        return true;
    }
    if sel.from.len() > 1 {
        return false;
    }
    match &sel.from[0] {
        kmx_sql::ast::TableExpr::Aliased(ate) => match &ate.expr {
            SimpleTableExpr::Table(t) => {
                t.qualifier.is_none() && t.name.eq_ignore_ascii_case("dual")
            }
            SimpleTableExpr::Derived(_) => false,
        },
        kmx_sql::ast::TableExpr::Join(_) => false,
    }
}

fn handle_dual_selects(sel: &Select, vschema: &dyn VSchema) -> Result<Option<Primitive>> {
    if !is_only_dual(sel) {
        return Ok(None);
    }

    let cfg = TranslateConfig {
        collation: vschema.conn_collation(),
    };
    let mut exprs = Vec::with_capacity(sel.exprs.len());
    let mut cols = Vec::with_capacity(sel.exprs.len());
    let mut lock_functions: Vec<LockFunc> = Vec::new();

    for column in sel.columns() {
        let SelectExpr::Aliased(aliased) = column else {
            return Ok(None);
        };
        if let Expr::Locking(lfunc) = &aliased.expr {
            let mut elem = LockFunc {
                func: lfunc.clone(),
                name: None,
            };
            if let Some(name) = &lfunc.name {
                elem.name = Some(translate(name, &cfg)?);
            }
            lock_functions.push(elem);
            continue;
        }
        if !lock_functions.is_empty() {
            return Err(KmxError::Unsupported(format!(
                "{VT12001}: LOCK function and other expression: [{aliased}] in same select query"
            )));
        }
        // Anything the evalengine cannot fold goes to the general planner
        // instead of failing here.
        let Ok(translated) = translate(&aliased.expr, &cfg) else {
            return Ok(None);
        };
        cols.push(aliased.column_name());
        exprs.push(translated);
    }

    if !lock_functions.is_empty() {
        return build_locking_primitive(sel, vschema, lock_functions).map(Some);
    }
    Ok(Some(Primitive::Projection(Projection {
        exprs,
        cols,
        input: Box::new(Primitive::SingleRow),
    })))
}

// Locks must always land on the same shard for every session, so they anchor
// to keyspace id 0x00 of the first-sorted keyspace.
fn build_locking_primitive(
    sel: &Select,
    vschema: &dyn VSchema,
    lock_functions: Vec<LockFunc>,
) -> Result<Primitive> {
    let keyspace = vschema.first_sorted_keyspace()?;
    let field_query = format_impossible_query(&SelectStatement::Select(Box::new(sel.clone())));
    Ok(Primitive::Lock(Lock {
        keyspace,
        target_destination: ShardDestination::KeyspaceId(vec![0]),
        field_query,
        lock_functions,
    }))
}
