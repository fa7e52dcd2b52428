//! Lower the operator tree into executable primitives.

use kmx_common::Result;
use kmx_sql::format_impossible_query;

use crate::context::PlanningContext;
use crate::operators::{Operator, RouteOp};
use crate::primitive::{Primitive, Route, VindexLookup};

/// Lower an operator tree into a primitive tree. The operator tree is
/// consumed; nothing references it afterwards.
pub fn transform_to_primitive(ctx: &PlanningContext<'_>, op: Operator) -> Result<Primitive> {
    match op {
        Operator::Route(route_op) => transform_route(ctx, route_op),
    }
}

fn transform_route(_ctx: &PlanningContext<'_>, op: RouteOp) -> Result<Primitive> {
    let query = op.stmt.to_string();
    let field_query = format_impossible_query(&op.stmt);

    let mut route = Route::new(op.opcode, op.keyspace, query, field_query);
    route.sys_table_table_schema = op.sys_table_table_schema;
    route.sys_table_table_name = op.sys_table_table_name;
    if let Some(sel) = op.stmt.as_select() {
        route.query_timeout_ms = query_timeout_directive(sel);
    }

    match op.vindex {
        Some(selection) => {
            route.vindex = Some(selection.name.clone());
            route.values = selection.values.clone();
            if selection.vindex.needs_vcursor() {
                // The route cannot resolve destinations on its own; wrap it
                // so the executor drives the lookup first.
                return Ok(Primitive::VindexLookup(VindexLookup {
                    vindex: selection.name,
                    values: selection.values,
                    send_to: Box::new(route),
                }));
            }
            Ok(Primitive::Route(route))
        }
        None => Ok(Primitive::Route(route)),
    }
}

/// `QUERY_TIMEOUT_MS` comment directive, when present and well-formed.
pub fn query_timeout_directive(sel: &kmx_sql::ast::Select) -> Option<u64> {
    sel.directive("QUERY_TIMEOUT_MS")
        .and_then(|v| v.parse::<u64>().ok())
}
