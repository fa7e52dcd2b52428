//! Crate-owned SELECT statement model.
//!
//! The external parser yields its own AST; `parse` lowers it into this model
//! so the planner can clone-and-mutate statements freely and render them back
//! to canonical MySQL text. Rendering is lowercase and deterministic: the
//! same statement always formats to the same string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A parsed SELECT: either a simple select or a set operation over selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectStatement {
    /// Simple `SELECT ... FROM ...`.
    Select(Box<Select>),
    /// `UNION [ALL]` over two select statements.
    Union(Box<Union>),
}

impl SelectStatement {
    /// The inner select when this is a simple select.
    pub fn as_select(&self) -> Option<&Select> {
        match self {
            SelectStatement::Select(sel) => Some(sel),
            SelectStatement::Union(_) => None,
        }
    }

    /// Mutable inner select when this is a simple select.
    pub fn as_select_mut(&mut self) -> Option<&mut Select> {
        match self {
            SelectStatement::Select(sel) => Some(sel),
            SelectStatement::Union(_) => None,
        }
    }

    /// All FROM items across the statement, left to right.
    pub fn from_items(&self) -> Vec<&TableExpr> {
        match self {
            SelectStatement::Select(sel) => sel.from.iter().collect(),
            SelectStatement::Union(u) => {
                let mut out = u.left.from_items();
                out.extend(u.right.from_items());
                out
            }
        }
    }
}

/// `UNION [ALL]` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Union {
    pub left: SelectStatement,
    pub right: SelectStatement,
    /// `UNION ALL` when set; plain `UNION` otherwise.
    pub all: bool,
}

/// Simple SELECT node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Select {
    /// `SQL_CALC_FOUND_ROWS` directive was present.
    pub sql_calc_found_rows: bool,
    pub distinct: bool,
    pub exprs: Vec<SelectExpr>,
    pub from: Vec<TableExpr>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderExpr>,
    pub limit: Option<Limit>,
    /// Key/value pairs from a leading `/*kmx+ ... */` comment, if any.
    pub directives: Vec<(String, String)>,
}

impl Select {
    /// Projected columns of this select.
    pub fn columns(&self) -> &[SelectExpr] {
        &self.exprs
    }

    /// True when every projected column is an aggregation.
    pub fn all_aggregation(&self) -> bool {
        !self.exprs.is_empty()
            && self.exprs.iter().all(|e| match e {
                SelectExpr::Aliased(ae) => matches!(ae.expr, Expr::Aggregate { .. }),
                SelectExpr::Star(_) => false,
            })
    }

    /// Value of a `/*kmx+ KEY=value */` directive, if present.
    pub fn directive(&self, key: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// One projected column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectExpr {
    /// Expression with optional alias.
    Aliased(AliasedExpr),
    /// `*` or `qualifier.*`.
    Star(Option<String>),
}

/// Expression plus optional alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasedExpr {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl AliasedExpr {
    /// Result column name: the alias when present, else the rendered
    /// expression.
    pub fn column_name(&self) -> String {
        match &self.alias {
            Some(a) => a.clone(),
            None => self.expr.to_string(),
        }
    }
}

/// One FROM item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableExpr {
    /// Table or derived table, with optional alias.
    Aliased(AliasedTableExpr),
    /// Binary join.
    Join(Box<JoinTableExpr>),
}

/// Aliased table expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasedTableExpr {
    pub expr: SimpleTableExpr,
    pub alias: Option<String>,
}

/// Table reference or derived table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimpleTableExpr {
    Table(TableName),
    Derived(Box<SelectStatement>),
}

/// Possibly qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub qualifier: Option<String>,
    pub name: String,
}

impl TableName {
    /// Unqualified table name.
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }
}

/// Join kinds the proxy routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

/// Binary join over two table expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTableExpr {
    pub left: TableExpr,
    pub right: TableExpr,
    pub kind: JoinKind,
    pub on: Option<Expr>,
}

/// One ORDER BY element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderExpr {
    pub expr: Expr,
    pub desc: bool,
}

/// LIMIT clause; either part may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Limit {
    pub offset: Option<Expr>,
    pub rowcount: Option<Expr>,
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    /// Named bind variable, rendered as `:name`.
    BindVar(String),
    Column(ColName),
    Comparison {
        op: ComparisonOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// `IS NULL` / `IS NOT NULL`.
    Is {
        expr: Box<Expr>,
        negated: bool,
    },
    /// Generic scalar function call.
    FuncCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Aggregate call; `arg == None` means `count(*)`.
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    /// Advisory locking function.
    Locking(LockingFunc),
}

/// Literal value kept in source text form where it matters.
///
/// Integer and float literals retain their raw text so planning rules that
/// depend on the written literal (for example `LIMIT 0`) see exactly what the
/// client sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Int(String),
    Float(String),
    Str(String),
    Bool(bool),
}

/// Possibly qualified column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColName {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColName {
    /// Unqualified column reference.
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

/// Aggregate functions the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// Advisory locking functions evaluated at the routing tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockingFunc {
    pub kind: LockingFuncKind,
    /// Lock name argument, absent for `release_all_locks()`.
    pub name: Option<Box<Expr>>,
    /// Timeout argument for `get_lock`.
    pub timeout: Option<Box<Expr>>,
}

/// The locking function family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockingFuncKind {
    GetLock,
    IsFreeLock,
    IsUsedLock,
    ReleaseAllLocks,
    ReleaseLock,
}

impl LockingFuncKind {
    /// Lowercase SQL name of the function.
    pub fn sql_name(&self) -> &'static str {
        match self {
            LockingFuncKind::GetLock => "get_lock",
            LockingFuncKind::IsFreeLock => "is_free_lock",
            LockingFuncKind::IsUsedLock => "is_used_lock",
            LockingFuncKind::ReleaseAllLocks => "release_all_locks",
            LockingFuncKind::ReleaseLock => "release_lock",
        }
    }
}

// -----------------------------
// Canonical rendering
// -----------------------------

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectStatement::Select(sel) => write!(f, "{sel}"),
            SelectStatement::Union(u) => write!(f, "{u}"),
        }
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "select ")?;
        if self.sql_calc_found_rows {
            write!(f, "sql_calc_found_rows ")?;
        }
        if self.distinct {
            write!(f, "distinct ")?;
        }
        write_joined(f, &self.exprs, ", ")?;
        if !self.from.is_empty() {
            write!(f, " from ")?;
            write_joined(f, &self.from, ", ")?;
        }
        if let Some(w) = &self.where_clause {
            write!(f, " where {w}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " group by ")?;
            write_joined(f, &self.group_by, ", ")?;
        }
        if let Some(h) = &self.having {
            write!(f, " having {h}")?;
        }
        if !self.order_by.is_empty() {
            write!(f, " order by ")?;
            write_joined(f, &self.order_by, ", ")?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " limit ")?;
            match (&limit.offset, &limit.rowcount) {
                (Some(o), Some(r)) => write!(f, "{o}, {r}")?,
                (None, Some(r)) => write!(f, "{r}")?,
                (Some(o), None) => write!(f, "{o}, 18446744073709551615")?,
                (None, None) => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for Union {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.all { "union all" } else { "union" };
        write!(f, "{} {op} {}", self.left, self.right)
    }
}

impl fmt::Display for SelectExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectExpr::Aliased(ae) => write!(f, "{ae}"),
            SelectExpr::Star(None) => write!(f, "*"),
            SelectExpr::Star(Some(q)) => write!(f, "{q}.*"),
        }
    }
}

impl fmt::Display for AliasedExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(a) => write!(f, "{} as {a}", self.expr),
            None => write!(f, "{}", self.expr),
        }
    }
}

impl fmt::Display for TableExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableExpr::Aliased(ate) => write!(f, "{ate}"),
            TableExpr::Join(j) => write!(f, "{j}"),
        }
    }
}

impl fmt::Display for AliasedTableExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expr {
            SimpleTableExpr::Table(t) => write!(f, "{t}")?,
            SimpleTableExpr::Derived(sel) => write!(f, "({sel})")?,
        }
        if let Some(a) = &self.alias {
            write!(f, " as {a}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for JoinTableExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kw = match self.kind {
            JoinKind::Inner => "join",
            JoinKind::Left => "left join",
            JoinKind::Right => "right join",
        };
        write!(f, "{} {kw} {}", self.left, self.right)?;
        if let Some(on) = &self.on {
            write!(f, " on {on}")?;
        }
        Ok(())
    }
}

impl fmt::Display for OrderExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.desc { "desc" } else { "asc" };
        write!(f, "{} {dir}", self.expr)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(l) => write!(f, "{l}"),
            Expr::BindVar(name) => write!(f, ":{name}"),
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Comparison { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::Arithmetic { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::And(l, r) => {
                write_boolean_operand(f, l)?;
                write!(f, " and ")?;
                write_boolean_operand(f, r)
            }
            Expr::Or(l, r) => write!(f, "{l} or {r}"),
            Expr::Not(e) => match e.as_ref() {
                Expr::And(_, _) | Expr::Or(_, _) => write!(f, "not ({e})"),
                _ => write!(f, "not {e}"),
            },
            Expr::Is { expr, negated } => {
                if *negated {
                    write!(f, "{expr} is not null")
                } else {
                    write!(f, "{expr} is null")
                }
            }
            Expr::FuncCall { name, args } => {
                write!(f, "{name}(")?;
                write_joined(f, args, ", ")?;
                write!(f, ")")
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                write!(f, "{func}(")?;
                if *distinct {
                    write!(f, "distinct ")?;
                }
                match arg {
                    Some(a) => write!(f, "{a}")?,
                    None => write!(f, "*")?,
                }
                write!(f, ")")
            }
            Expr::Locking(l) => write!(f, "{l}"),
        }
    }
}

// OR binds loosest, so OR operands need parentheses under AND.
fn write_boolean_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    match e {
        Expr::Or(_, _) => write!(f, "({e})"),
        _ => write!(f, "{e}"),
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Int(s) | Literal::Float(s) => write!(f, "{s}"),
            Literal::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl fmt::Display for ColName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithmeticOp::Plus => "+",
            ArithmeticOp::Minus => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
            ArithmeticOp::Modulo => "%",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::Avg => "avg",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for LockingFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind.sql_name())?;
        if let Some(name) = &self.name {
            write!(f, "{name}")?;
        }
        if let Some(timeout) = &self.timeout {
            write!(f, ", {timeout}")?;
        }
        write!(f, ")")
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    sep: &str,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Render a statement as a field-probe query that matches no rows.
///
/// The select list, FROM clause and grouping survive so the backend returns
/// accurate column metadata; the filter is replaced by `1 != 1` and
/// ORDER BY/LIMIT are dropped.
pub fn format_impossible_query(stmt: &SelectStatement) -> String {
    match stmt {
        SelectStatement::Select(sel) => {
            let mut out = String::from("select ");
            let exprs = sel
                .exprs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&exprs);
            if !sel.from.is_empty() {
                out.push_str(" from ");
                let from = sel
                    .from
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&from);
            }
            out.push_str(" where 1 != 1");
            if !sel.group_by.is_empty() {
                out.push_str(" group by ");
                let gb = sel
                    .group_by
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&gb);
            }
            out
        }
        SelectStatement::Union(u) => {
            let op = if u.all { " union all " } else { " union " };
            format!(
                "{}{op}{}",
                format_impossible_query(&u.left),
                format_impossible_query(&u.right)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::Column(ColName::unqualified(name))
    }

    fn int(v: &str) -> Expr {
        Expr::Literal(Literal::Int(v.to_string()))
    }

    #[test]
    fn renders_canonical_select() {
        let sel = Select {
            exprs: vec![SelectExpr::Aliased(AliasedExpr {
                expr: col("a"),
                alias: None,
            })],
            from: vec![TableExpr::Aliased(AliasedTableExpr {
                expr: SimpleTableExpr::Table(TableName::unqualified("t")),
                alias: None,
            })],
            where_clause: Some(Expr::Comparison {
                op: ComparisonOp::Eq,
                left: Box::new(col("id")),
                right: Box::new(int("5")),
            }),
            limit: Some(Limit {
                offset: None,
                rowcount: Some(int("10")),
            }),
            ..Default::default()
        };
        assert_eq!(sel.to_string(), "select a from t where id = 5 limit 10");
    }

    #[test]
    fn or_is_parenthesized_under_and() {
        let e = Expr::And(
            Box::new(Expr::Or(Box::new(col("a")), Box::new(col("b")))),
            Box::new(col("c")),
        );
        assert_eq!(e.to_string(), "(a or b) and c");
    }

    #[test]
    fn locking_funcs_render_lowercase() {
        let e = Expr::Locking(LockingFunc {
            kind: LockingFuncKind::GetLock,
            name: Some(Box::new(Expr::Literal(Literal::Str("x".to_string())))),
            timeout: Some(Box::new(int("0"))),
        });
        assert_eq!(e.to_string(), "get_lock('x', 0)");
        let e = Expr::Locking(LockingFunc {
            kind: LockingFuncKind::ReleaseAllLocks,
            name: None,
            timeout: None,
        });
        assert_eq!(e.to_string(), "release_all_locks()");
    }

    #[test]
    fn impossible_query_replaces_filter_and_drops_limit() {
        let sel = Select {
            exprs: vec![SelectExpr::Aliased(AliasedExpr {
                expr: col("a"),
                alias: None,
            })],
            from: vec![TableExpr::Aliased(AliasedTableExpr {
                expr: SimpleTableExpr::Table(TableName::unqualified("t")),
                alias: None,
            })],
            where_clause: Some(Expr::Comparison {
                op: ComparisonOp::Eq,
                left: Box::new(col("id")),
                right: Box::new(int("5")),
            }),
            group_by: vec![col("a")],
            limit: Some(Limit {
                offset: None,
                rowcount: Some(int("10")),
            }),
            ..Default::default()
        };
        let stmt = SelectStatement::Select(Box::new(sel));
        assert_eq!(
            format_impossible_query(&stmt),
            "select a from t where 1 != 1 group by a"
        );
    }

    #[test]
    fn count_star_renders() {
        let e = Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        };
        assert_eq!(e.to_string(), "count(*)");
    }
}
