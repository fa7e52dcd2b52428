//! Planning-time predicate normalization.
//!
//! The planner retries certain plans after rewriting predicates into
//! conjunctive normal form: filters hidden inside disjunctions become
//! top-level conjuncts the route builder can act on. The rewrite is a pure
//! `Expr -> Expr` function run to a fixpoint.

use crate::ast::Expr;

const MAX_REWRITE_PASSES: usize = 64;

/// Rewrite a predicate into conjunctive normal form.
///
/// Passes applied until stable:
/// - double-negation elimination and De Morgan's laws;
/// - extraction of conjuncts common to both branches of an OR
///   (`(a and b) or (a and c)` becomes `a and (b or c)`);
/// - distribution of OR over AND.
pub fn rewrite_predicate(expr: Expr) -> Expr {
    let mut current = expr;
    for _ in 0..MAX_REWRITE_PASSES {
        let next = rewrite_pass(current.clone());
        if next == current {
            return current;
        }
        current = next;
    }
    current
}

/// Flatten an AND tree into its conjuncts, left to right.
pub fn split_and(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::And(l, r) => {
            split_and(l, out);
            split_and(r, out);
        }
        other => out.push(other.clone()),
    }
}

/// Rebuild a left-associated AND tree from conjuncts.
pub fn and_exprs(mut conjuncts: Vec<Expr>) -> Option<Expr> {
    if conjuncts.is_empty() {
        return None;
    }
    let mut acc = conjuncts.remove(0);
    for c in conjuncts {
        acc = Expr::And(Box::new(acc), Box::new(c));
    }
    Some(acc)
}

fn rewrite_pass(expr: Expr) -> Expr {
    match expr {
        Expr::Not(inner) => rewrite_not(*inner),
        Expr::And(l, r) => Expr::And(
            Box::new(rewrite_pass(*l)),
            Box::new(rewrite_pass(*r)),
        ),
        Expr::Or(l, r) => rewrite_or(rewrite_pass(*l), rewrite_pass(*r)),
        other => other,
    }
}

fn rewrite_not(inner: Expr) -> Expr {
    match inner {
        Expr::Not(e) => rewrite_pass(*e),
        Expr::And(l, r) => Expr::Or(
            Box::new(rewrite_pass(Expr::Not(l))),
            Box::new(rewrite_pass(Expr::Not(r))),
        ),
        Expr::Or(l, r) => Expr::And(
            Box::new(rewrite_pass(Expr::Not(l))),
            Box::new(rewrite_pass(Expr::Not(r))),
        ),
        other => Expr::Not(Box::new(rewrite_pass(other))),
    }
}

fn rewrite_or(left: Expr, right: Expr) -> Expr {
    // Extraction first: it keeps the result small and covers the common
    // routing shapes. Distribution below completes CNF for the rest.
    let mut left_conjuncts = Vec::new();
    let mut right_conjuncts = Vec::new();
    split_and(&left, &mut left_conjuncts);
    split_and(&right, &mut right_conjuncts);

    let common: Vec<Expr> = left_conjuncts
        .iter()
        .filter(|c| right_conjuncts.contains(c))
        .cloned()
        .collect();
    if !common.is_empty() {
        let rest_left: Vec<Expr> = left_conjuncts
            .iter()
            .filter(|c| !common.contains(c))
            .cloned()
            .collect();
        let rest_right: Vec<Expr> = right_conjuncts
            .iter()
            .filter(|c| !common.contains(c))
            .cloned()
            .collect();
        let mut conjuncts = common;
        // X or (X and Y) simplifies to X, so a fully-common side drops the
        // disjunction entirely.
        if let (Some(rl), Some(rr)) = (and_exprs(rest_left), and_exprs(rest_right)) {
            conjuncts.push(Expr::Or(Box::new(rl), Box::new(rr)));
        }
        return and_exprs(conjuncts).expect("common conjuncts are non-empty");
    }

    match (left, right) {
        (Expr::And(a, b), c) => Expr::And(
            Box::new(rewrite_or(*a, c.clone())),
            Box::new(rewrite_or(*b, c)),
        ),
        (c, Expr::And(a, b)) => Expr::And(
            Box::new(rewrite_or(c.clone(), *a)),
            Box::new(rewrite_or(c, *b)),
        ),
        (l, r) => Expr::Or(Box::new(l), Box::new(r)),
    }
}
