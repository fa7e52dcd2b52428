//! MySQL parser frontend.
//!
//! Responsibilities:
//! - pre-scan raw SQL for `SQL_CALC_FOUND_ROWS` and `/*kmx+ ... */`
//!   directive comments (the generic grammar drops both);
//! - parse with the external MySQL grammar;
//! - lower the external AST into the crate-owned [`ast`] model;
//! - report which bind-variable names the query already uses, so fresh
//!   reserved names never collide.

use std::collections::HashSet;

use kmx_common::{KmxError, Result};
use sqlparser::ast::{
    self as ext, BinaryOperator, Distinct, DuplicateTreatment, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator, ObjectName, SelectItem, SetExpr,
    SetOperator, Statement, TableFactor, UnaryOperator, Value as ExtValue,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::ast::{
    AggregateFunc, AliasedExpr, AliasedTableExpr, ArithmeticOp, ColName, ComparisonOp, Expr,
    JoinKind, JoinTableExpr, Limit, Literal, LockingFunc, LockingFuncKind, OrderExpr, Select,
    SelectExpr, SelectStatement, SimpleTableExpr, TableExpr, TableName, Union,
};

/// Handle to the SQL parser, carried by the vschema.
#[derive(Debug, Clone, Default)]
pub struct SqlParser;

impl SqlParser {
    /// Fresh parser handle.
    pub fn new() -> Self {
        Self
    }

    /// Parse one SELECT statement and report the bind-variable names it
    /// already uses.
    pub fn parse_select(&self, sql: &str) -> Result<(SelectStatement, HashSet<String>)> {
        parse_select(sql)
    }
}

/// Parse one SELECT statement plus its in-use bind-variable names.
pub fn parse_select(sql: &str) -> Result<(SelectStatement, HashSet<String>)> {
    let pre = preprocess(sql);
    let dialect = MySqlDialect {};
    let stmts = Parser::parse_sql(&dialect, &pre.sql)
        .map_err(|e| KmxError::Planning(format!("parse error: {e}")))?;
    if stmts.len() != 1 {
        return Err(KmxError::Unsupported(
            "only single-statement SQL is supported".to_string(),
        ));
    }
    let query = match &stmts[0] {
        Statement::Query(q) => q,
        other => {
            return Err(KmxError::Unsupported(format!(
                "only SELECT statements are planned here, got: {other}"
            )));
        }
    };

    let mut ctx = LowerCtx::default();
    let mut stmt = lower_query(query, &mut ctx)?;
    if let Some(sel) = stmt.as_select_mut() {
        sel.sql_calc_found_rows = pre.sql_calc_found_rows;
        sel.directives = pre.directives;
    }
    Ok((stmt, ctx.bind_vars))
}

/// Allocator for reserved bind-variable names.
///
/// Names are `<prefix><n>` for increasing `n`, skipping anything the parsed
/// query already uses.
#[derive(Debug, Clone)]
pub struct ReservedVars {
    prefix: String,
    counter: usize,
    taken: HashSet<String>,
}

impl ReservedVars {
    /// Allocator over `prefix` avoiding the `taken` names.
    pub fn new(prefix: impl Into<String>, taken: HashSet<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
            taken,
        }
    }

    /// Next unused reserved name.
    pub fn reserve(&mut self) -> String {
        loop {
            self.counter += 1;
            let candidate = format!("{}{}", self.prefix, self.counter);
            if !self.taken.contains(&candidate) {
                self.taken.insert(candidate.clone());
                return candidate;
            }
        }
    }
}

// -----------------------------
// Raw-text preprocessing
// -----------------------------

struct Preprocessed {
    sql: String,
    sql_calc_found_rows: bool,
    directives: Vec<(String, String)>,
}

// The external grammar does not keep MySQL's SQL_CALC_FOUND_ROWS modifier or
// comment text, so both are lifted off the raw string first. Quoted regions
// are skipped so literals are never rewritten.
fn preprocess(sql: &str) -> Preprocessed {
    const MODIFIER: &str = "sql_calc_found_rows";
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut directives = Vec::new();
    let mut found_modifier = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(sql, i, c);
                out.push_str(&sql[i..end]);
                i = end;
            }
            '/' if sql[i..].starts_with("/*") => {
                let end = sql[i..].find("*/").map(|p| i + p + 2).unwrap_or(sql.len());
                let body = &sql[i + 2..end.saturating_sub(2).max(i + 2)];
                if let Some(rest) = body.strip_prefix("kmx+") {
                    for pair in rest.split_whitespace() {
                        if let Some((k, v)) = pair.split_once('=') {
                            directives.push((k.to_string(), v.to_string()));
                        }
                    }
                } else {
                    out.push_str(&sql[i..end]);
                }
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let end = sql[i..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .map(|p| i + p)
                    .unwrap_or(sql.len());
                let word = &sql[i..end];
                if !found_modifier && word.eq_ignore_ascii_case(MODIFIER) {
                    found_modifier = true;
                    // also swallow one following space so "select  a" does
                    // not appear in the rewritten text
                    i = if end < bytes.len() && bytes[end] == b' ' {
                        end + 1
                    } else {
                        end
                    };
                } else {
                    out.push_str(word);
                    i = end;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Preprocessed {
        sql: out,
        sql_calc_found_rows: found_modifier,
        directives,
    }
}

fn skip_quoted(sql: &str, start: usize, quote: char) -> usize {
    let bytes = sql.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] as char == quote {
            // doubled quote is an escape
            if i + 1 < bytes.len() && bytes[i + 1] as char == quote {
                i += 2;
                continue;
            }
            return i + 1;
        }
        if bytes[i] == b'\\' {
            i += 1;
        }
        i += 1;
    }
    sql.len()
}

// -----------------------------
// Lowering
// -----------------------------

#[derive(Default)]
struct LowerCtx {
    bind_vars: HashSet<String>,
    anon: usize,
}

impl LowerCtx {
    fn bind_var(&mut self, placeholder: &str) -> Expr {
        let name = match placeholder.strip_prefix(':') {
            Some(named) if !named.is_empty() => named.to_string(),
            _ => {
                self.anon += 1;
                format!("v{}", self.anon)
            }
        };
        self.bind_vars.insert(name.clone());
        Expr::BindVar(name)
    }
}

fn lower_query(q: &ext::Query, ctx: &mut LowerCtx) -> Result<SelectStatement> {
    let mut stmt = lower_set_expr(&q.body, ctx)?;

    let order_by = match &q.order_by {
        Some(ob) => ob
            .exprs
            .iter()
            .map(|o| {
                Ok(OrderExpr {
                    expr: lower_expr(&o.expr, ctx)?,
                    desc: o.asc == Some(false),
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let limit = match (&q.limit, &q.offset) {
        (None, None) => None,
        (rowcount, offset) => Some(Limit {
            offset: offset
                .as_ref()
                .map(|o| lower_expr(&o.value, ctx))
                .transpose()?,
            rowcount: rowcount.as_ref().map(|e| lower_expr(e, ctx)).transpose()?,
        }),
    };

    match &mut stmt {
        SelectStatement::Select(sel) => {
            sel.order_by = order_by;
            sel.limit = limit;
        }
        SelectStatement::Union(_) => {
            if !order_by.is_empty() || limit.is_some() {
                return Err(KmxError::Unsupported(
                    "ORDER BY/LIMIT on a UNION is not supported".to_string(),
                ));
            }
        }
    }
    Ok(stmt)
}

fn lower_set_expr(body: &SetExpr, ctx: &mut LowerCtx) -> Result<SelectStatement> {
    match body {
        SetExpr::Select(sel) => Ok(SelectStatement::Select(Box::new(lower_select(sel, ctx)?))),
        SetExpr::Query(q) => lower_query(q, ctx),
        SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } => Ok(SelectStatement::Union(Box::new(Union {
            left: lower_set_expr(left, ctx)?,
            right: lower_set_expr(right, ctx)?,
            all: matches!(set_quantifier, ext::SetQuantifier::All),
        }))),
        _ => Err(KmxError::Unsupported(
            "only SELECT and UNION set operations are supported".to_string(),
        )),
    }
}

fn lower_select(sel: &ext::Select, ctx: &mut LowerCtx) -> Result<Select> {
    let distinct = match &sel.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(Distinct::On(_)) => {
            return Err(KmxError::Unsupported(
                "DISTINCT ON is not supported".to_string(),
            ));
        }
    };

    let mut exprs = Vec::with_capacity(sel.projection.len());
    for item in &sel.projection {
        exprs.push(lower_select_item(item, ctx)?);
    }

    let mut from = Vec::with_capacity(sel.from.len());
    for twj in &sel.from {
        from.push(lower_table_with_joins(twj, ctx)?);
    }

    let where_clause = sel
        .selection
        .as_ref()
        .map(|e| lower_expr(e, ctx))
        .transpose()?;

    let group_by = match &sel.group_by {
        GroupByExpr::Expressions(es, mods) => {
            if !mods.is_empty() {
                return Err(KmxError::Unsupported(
                    "GROUP BY modifiers are not supported".to_string(),
                ));
            }
            es.iter()
                .map(|e| lower_expr(e, ctx))
                .collect::<Result<Vec<_>>>()?
        }
        GroupByExpr::All(_) => {
            return Err(KmxError::Unsupported(
                "GROUP BY ALL is not supported".to_string(),
            ));
        }
    };

    let having = sel.having.as_ref().map(|e| lower_expr(e, ctx)).transpose()?;

    Ok(Select {
        sql_calc_found_rows: false,
        distinct,
        exprs,
        from,
        where_clause,
        group_by,
        having,
        order_by: Vec::new(),
        limit: None,
        directives: Vec::new(),
    })
}

fn lower_select_item(item: &SelectItem, ctx: &mut LowerCtx) -> Result<SelectExpr> {
    match item {
        SelectItem::UnnamedExpr(e) => Ok(SelectExpr::Aliased(AliasedExpr {
            expr: lower_expr(e, ctx)?,
            alias: None,
        })),
        SelectItem::ExprWithAlias { expr, alias } => Ok(SelectExpr::Aliased(AliasedExpr {
            expr: lower_expr(expr, ctx)?,
            alias: Some(alias.value.clone()),
        })),
        SelectItem::Wildcard(_) => Ok(SelectExpr::Star(None)),
        SelectItem::QualifiedWildcard(name, _) => {
            Ok(SelectExpr::Star(Some(object_name_to_string(name))))
        }
    }
}

fn lower_table_with_joins(twj: &ext::TableWithJoins, ctx: &mut LowerCtx) -> Result<TableExpr> {
    let mut left = lower_table_factor(&twj.relation, ctx)?;
    for join in &twj.joins {
        let right = lower_table_factor(&join.relation, ctx)?;
        let (constraint, kind) = match &join.join_operator {
            JoinOperator::Inner(c) => (c, JoinKind::Inner),
            JoinOperator::LeftOuter(c) => (c, JoinKind::Left),
            JoinOperator::RightOuter(c) => (c, JoinKind::Right),
            _ => {
                return Err(KmxError::Unsupported(
                    "only INNER/LEFT/RIGHT JOIN are supported".to_string(),
                ));
            }
        };
        let on = match constraint {
            JoinConstraint::On(e) => Some(lower_expr(e, ctx)?),
            JoinConstraint::None => None,
            _ => {
                return Err(KmxError::Unsupported(
                    "JOIN requires ON or no constraint".to_string(),
                ));
            }
        };
        left = TableExpr::Join(Box::new(JoinTableExpr {
            left,
            right,
            kind,
            on,
        }));
    }
    Ok(left)
}

fn lower_table_factor(tf: &TableFactor, ctx: &mut LowerCtx) -> Result<TableExpr> {
    match tf {
        TableFactor::Table { name, alias, .. } => {
            let parts = &name.0;
            let table = match parts.len() {
                1 => TableName {
                    qualifier: None,
                    name: parts[0].value.clone(),
                },
                2 => TableName {
                    qualifier: Some(parts[0].value.clone()),
                    name: parts[1].value.clone(),
                },
                _ => {
                    return Err(KmxError::Unsupported(format!(
                        "table name has too many qualifiers: {name}"
                    )));
                }
            };
            Ok(TableExpr::Aliased(AliasedTableExpr {
                expr: SimpleTableExpr::Table(table),
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            }))
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => Ok(TableExpr::Aliased(AliasedTableExpr {
            expr: SimpleTableExpr::Derived(Box::new(lower_query(subquery, ctx)?)),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
        })),
        _ => Err(KmxError::Unsupported(
            "only plain tables and derived tables are supported in FROM".to_string(),
        )),
    }
}

fn lower_expr(e: &ext::Expr, ctx: &mut LowerCtx) -> Result<Expr> {
    match e {
        ext::Expr::Identifier(ident) => Ok(Expr::Column(ColName::unqualified(ident.value.clone()))),
        ext::Expr::CompoundIdentifier(parts) => match parts.len() {
            2 => Ok(Expr::Column(ColName {
                qualifier: Some(parts[0].value.clone()),
                name: parts[1].value.clone(),
            })),
            _ => Err(KmxError::Unsupported(format!(
                "column reference has too many qualifiers: {e}"
            ))),
        },
        ext::Expr::Value(v) => lower_value(v, ctx),
        ext::Expr::Nested(inner) => lower_expr(inner, ctx),
        ext::Expr::IsNull(inner) => Ok(Expr::Is {
            expr: Box::new(lower_expr(inner, ctx)?),
            negated: false,
        }),
        ext::Expr::IsNotNull(inner) => Ok(Expr::Is {
            expr: Box::new(lower_expr(inner, ctx)?),
            negated: true,
        }),
        ext::Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Expr::Not(Box::new(lower_expr(expr, ctx)?))),
        ext::Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match lower_expr(expr, ctx)? {
            Expr::Literal(Literal::Int(s)) => Ok(Expr::Literal(Literal::Int(format!("-{s}")))),
            Expr::Literal(Literal::Float(s)) => Ok(Expr::Literal(Literal::Float(format!("-{s}")))),
            other => Err(KmxError::Unsupported(format!(
                "unary minus on non-literal expression: {other}"
            ))),
        },
        ext::Expr::BinaryOp { left, op, right } => {
            let l = Box::new(lower_expr(left, ctx)?);
            let r = Box::new(lower_expr(right, ctx)?);
            match op {
                BinaryOperator::And => Ok(Expr::And(l, r)),
                BinaryOperator::Or => Ok(Expr::Or(l, r)),
                other => {
                    if let Some(op) = comparison_op(other) {
                        Ok(Expr::Comparison { op, left: l, right: r })
                    } else if let Some(op) = arithmetic_op(other) {
                        Ok(Expr::Arithmetic { op, left: l, right: r })
                    } else {
                        Err(KmxError::Unsupported(format!(
                            "unsupported binary operator: {other}"
                        )))
                    }
                }
            }
        }
        ext::Expr::Function(func) => lower_function(func, ctx),
        other => Err(KmxError::Unsupported(format!(
            "unsupported expression: {other}"
        ))),
    }
}

fn lower_value(v: &ExtValue, ctx: &mut LowerCtx) -> Result<Expr> {
    Ok(match v {
        ExtValue::Number(n, _) => {
            if n.contains('.') || n.contains('e') || n.contains('E') {
                Expr::Literal(Literal::Float(n.clone()))
            } else {
                Expr::Literal(Literal::Int(n.clone()))
            }
        }
        ExtValue::SingleQuotedString(s) | ExtValue::DoubleQuotedString(s) => {
            Expr::Literal(Literal::Str(s.clone()))
        }
        ExtValue::Null => Expr::Literal(Literal::Null),
        ExtValue::Boolean(b) => Expr::Literal(Literal::Bool(*b)),
        ExtValue::Placeholder(p) => ctx.bind_var(p),
        other => {
            return Err(KmxError::Unsupported(format!(
                "unsupported literal: {other}"
            )));
        }
    })
}

fn lower_function(func: &ext::Function, ctx: &mut LowerCtx) -> Result<Expr> {
    if func.over.is_some() {
        return Err(KmxError::Unsupported(
            "window functions are not supported".to_string(),
        ));
    }
    let name = object_name_to_string(&func.name);
    let upper = name.to_uppercase();

    let (args, distinct) = match &func.args {
        FunctionArguments::None => (Vec::new(), false),
        FunctionArguments::List(list) => {
            let distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
            (list.args.iter().collect::<Vec<_>>(), distinct)
        }
        FunctionArguments::Subquery(_) => {
            return Err(KmxError::Unsupported(
                "subquery function arguments are not supported".to_string(),
            ));
        }
    };

    if let Some(agg) = aggregate_func(&upper) {
        let arg = match args.as_slice() {
            [] => {
                return Err(KmxError::Unsupported(format!(
                    "{upper}() requires an argument"
                )));
            }
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => None,
            [single] => Some(Box::new(function_arg_to_expr(single, ctx)?)),
            _ => {
                return Err(KmxError::Unsupported(format!(
                    "{upper}() takes a single argument"
                )));
            }
        };
        if arg.is_none() && agg != AggregateFunc::Count {
            return Err(KmxError::Unsupported(format!(
                "{upper}(*) is not a valid aggregation"
            )));
        }
        return Ok(Expr::Aggregate {
            func: agg,
            arg,
            distinct,
        });
    }

    if let Some(kind) = locking_func(&upper) {
        let mut lowered = Vec::with_capacity(args.len());
        for a in &args {
            lowered.push(function_arg_to_expr(a, ctx)?);
        }
        let (name_arg, timeout) = match kind {
            LockingFuncKind::ReleaseAllLocks => (None, None),
            LockingFuncKind::GetLock => {
                if lowered.len() != 2 {
                    return Err(KmxError::Planning(
                        "get_lock requires a name and a timeout".to_string(),
                    ));
                }
                let timeout = lowered.pop().map(Box::new);
                (lowered.pop().map(Box::new), timeout)
            }
            _ => {
                if lowered.len() != 1 {
                    return Err(KmxError::Planning(format!(
                        "{} requires a lock name",
                        kind.sql_name()
                    )));
                }
                (lowered.pop().map(Box::new), None)
            }
        };
        return Ok(Expr::Locking(LockingFunc {
            kind,
            name: name_arg,
            timeout,
        }));
    }

    let mut lowered = Vec::with_capacity(args.len());
    for a in &args {
        lowered.push(function_arg_to_expr(a, ctx)?);
    }
    Ok(Expr::FuncCall {
        name: name.to_lowercase(),
        args: lowered,
    })
}

fn comparison_op(op: &BinaryOperator) -> Option<ComparisonOp> {
    Some(match op {
        BinaryOperator::Eq => ComparisonOp::Eq,
        BinaryOperator::NotEq => ComparisonOp::NotEq,
        BinaryOperator::Lt => ComparisonOp::Lt,
        BinaryOperator::LtEq => ComparisonOp::LtEq,
        BinaryOperator::Gt => ComparisonOp::Gt,
        BinaryOperator::GtEq => ComparisonOp::GtEq,
        _ => return None,
    })
}

fn arithmetic_op(op: &BinaryOperator) -> Option<ArithmeticOp> {
    Some(match op {
        BinaryOperator::Plus => ArithmeticOp::Plus,
        BinaryOperator::Minus => ArithmeticOp::Minus,
        BinaryOperator::Multiply => ArithmeticOp::Multiply,
        BinaryOperator::Divide => ArithmeticOp::Divide,
        BinaryOperator::Modulo => ArithmeticOp::Modulo,
        _ => return None,
    })
}

fn aggregate_func(upper: &str) -> Option<AggregateFunc> {
    Some(match upper {
        "COUNT" => AggregateFunc::Count,
        "SUM" => AggregateFunc::Sum,
        "MIN" => AggregateFunc::Min,
        "MAX" => AggregateFunc::Max,
        "AVG" => AggregateFunc::Avg,
        _ => return None,
    })
}

fn locking_func(upper: &str) -> Option<LockingFuncKind> {
    Some(match upper {
        "GET_LOCK" => LockingFuncKind::GetLock,
        "IS_FREE_LOCK" => LockingFuncKind::IsFreeLock,
        "IS_USED_LOCK" => LockingFuncKind::IsUsedLock,
        "RELEASE_ALL_LOCKS" => LockingFuncKind::ReleaseAllLocks,
        "RELEASE_LOCK" => LockingFuncKind::ReleaseLock,
        _ => return None,
    })
}

fn function_arg_to_expr(arg: &FunctionArg, ctx: &mut LowerCtx) -> Result<Expr> {
    match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => lower_expr(e, ctx),
        _ => Err(KmxError::Unsupported(
            "unsupported function argument form".to_string(),
        )),
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::parse_select;
    use crate::ast::{Expr, SelectExpr, SelectStatement};

    fn select(stmt: &SelectStatement) -> &crate::ast::Select {
        stmt.as_select().expect("simple select")
    }

    #[test]
    fn lifts_sql_calc_found_rows() {
        let (stmt, _) = parse_select("select SQL_CALC_FOUND_ROWS a from t limit 10").expect("parse");
        let sel = select(&stmt);
        assert!(sel.sql_calc_found_rows);
        assert!(sel.limit.is_some());
        assert_eq!(sel.to_string(), "select sql_calc_found_rows a from t limit 10");
    }

    #[test]
    fn modifier_inside_string_is_untouched() {
        let (stmt, _) = parse_select("select 'sql_calc_found_rows' from dual").expect("parse");
        assert!(!select(&stmt).sql_calc_found_rows);
    }

    #[test]
    fn collects_bind_var_names() {
        let (_, vars) = parse_select("select a from t where id = ? and b = ?").expect("parse");
        assert!(vars.contains("v1"));
        assert!(vars.contains("v2"));
    }

    #[test]
    fn lifts_directive_comments() {
        let (stmt, _) =
            parse_select("select /*kmx+ QUERY_TIMEOUT_MS=500 */ a from u").expect("parse");
        assert_eq!(select(&stmt).directive("query_timeout_ms"), Some("500"));
    }

    #[test]
    fn lowers_locking_functions() {
        let (stmt, _) = parse_select("select get_lock('x', 0) from dual").expect("parse");
        let sel = select(&stmt);
        match &sel.exprs[0] {
            SelectExpr::Aliased(ae) => assert!(matches!(ae.expr, Expr::Locking(_))),
            other => panic!("unexpected select expr: {other:?}"),
        }
        assert_eq!(sel.to_string(), "select get_lock('x', 0) from dual");
    }

    #[test]
    fn count_star_lowers_to_bare_aggregate() {
        let (stmt, _) = parse_select("select count(*) from t").expect("parse");
        let sel = select(&stmt);
        assert!(sel.all_aggregation());
        assert_eq!(sel.to_string(), "select count(*) from t");
    }

    #[test]
    fn reserved_vars_skip_taken_names() {
        let mut rv = super::ReservedVars::new(
            "kmx",
            ["kmx1".to_string()].into_iter().collect(),
        );
        assert_eq!(rv.reserve(), "kmx2");
        assert_eq!(rv.reserve(), "kmx3");
    }
}
