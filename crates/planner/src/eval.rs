//! Constant-expression subset of the evaluation engine.
//!
//! The routing tier evaluates projections over `dual` and vindex input
//! values without touching a backend. Translation accepts literals, bind
//! variables, arithmetic and comparisons; anything referencing a column
//! refuses, which callers treat as "plan it the general way instead".

use std::collections::HashMap;

use kmx_common::{KmxError, Result};
use kmx_sql::ast::{ArithmeticOp, ComparisonOp, Expr, Literal};
use kmx_sql::Value;
use serde::{Deserialize, Serialize};

use crate::context::CollationId;

/// Translation options.
#[derive(Debug, Clone, Copy)]
pub struct TranslateConfig {
    /// Collation of the proxy session, applied to string comparisons.
    pub collation: CollationId,
}

/// A translated, backend-free expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvalExpr {
    Literal(Value),
    BindVar(String),
    Arithmetic {
        op: ArithmeticOp,
        left: Box<EvalExpr>,
        right: Box<EvalExpr>,
    },
    Comparison {
        op: ComparisonOp,
        left: Box<EvalExpr>,
        right: Box<EvalExpr>,
    },
}

/// Translate an AST expression into an [`EvalExpr`].
///
/// Fails with `Unsupported` on anything that needs row context (columns,
/// aggregates, arbitrary functions).
pub fn translate(expr: &Expr, cfg: &TranslateConfig) -> Result<EvalExpr> {
    // Collation participates once string comparison honors it; carried now so
    // the call sites do not change when it does.
    let _ = cfg;
    match expr {
        Expr::Literal(l) => Ok(EvalExpr::Literal(literal_value(l)?)),
        Expr::BindVar(name) => Ok(EvalExpr::BindVar(name.clone())),
        Expr::Arithmetic { op, left, right } => Ok(EvalExpr::Arithmetic {
            op: *op,
            left: Box::new(translate(left, cfg)?),
            right: Box::new(translate(right, cfg)?),
        }),
        Expr::Comparison { op, left, right } => Ok(EvalExpr::Comparison {
            op: *op,
            left: Box::new(translate(left, cfg)?),
            right: Box::new(translate(right, cfg)?),
        }),
        other => Err(KmxError::Unsupported(format!(
            "expression is not constant-foldable: {other}"
        ))),
    }
}

fn literal_value(l: &Literal) -> Result<Value> {
    Ok(match l {
        Literal::Null => Value::Null,
        Literal::Int(s) => match s.parse::<i64>() {
            Ok(v) => Value::Int64(v),
            Err(_) => Value::Uint64(s.parse::<u64>().map_err(|_| {
                KmxError::Planning(format!("integer literal out of range: {s}"))
            })?),
        },
        Literal::Float(s) => Value::Float64(
            s.parse::<f64>()
                .map_err(|_| KmxError::Planning(format!("bad float literal: {s}")))?,
        ),
        Literal::Str(s) => Value::VarChar(s.clone()),
        Literal::Bool(b) => Value::Int64(i64::from(*b)),
    })
}

impl EvalExpr {
    /// Evaluate with the given bind variables.
    pub fn evaluate(&self, bind_vars: &HashMap<String, Value>) -> Result<Value> {
        match self {
            EvalExpr::Literal(v) => Ok(v.clone()),
            EvalExpr::BindVar(name) => bind_vars.get(name).cloned().ok_or_else(|| {
                KmxError::Execution(format!("missing bind variable: {name}"))
            }),
            EvalExpr::Arithmetic { op, left, right } => {
                let l = left.evaluate(bind_vars)?;
                let r = right.evaluate(bind_vars)?;
                eval_arithmetic(*op, l, r)
            }
            EvalExpr::Comparison { op, left, right } => {
                let l = left.evaluate(bind_vars)?;
                let r = right.evaluate(bind_vars)?;
                eval_comparison(*op, l, r)
            }
        }
    }
}

fn eval_arithmetic(op: ArithmeticOp, l: Value, r: Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (numeric(&l)?, numeric(&r)?) {
        (Num::Int(a), Num::Int(b)) => {
            let out = match op {
                ArithmeticOp::Plus => a.checked_add(b),
                ArithmeticOp::Minus => a.checked_sub(b),
                ArithmeticOp::Multiply => a.checked_mul(b),
                ArithmeticOp::Divide => {
                    return if b == 0 {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::Float64(a as f64 / b as f64))
                    };
                }
                ArithmeticOp::Modulo => {
                    return if b == 0 {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::Int64(a % b))
                    };
                }
            };
            out.map(Value::Int64)
                .ok_or_else(|| KmxError::Execution("integer overflow".to_string()))
        }
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            Ok(match op {
                ArithmeticOp::Plus => Value::Float64(a + b),
                ArithmeticOp::Minus => Value::Float64(a - b),
                ArithmeticOp::Multiply => Value::Float64(a * b),
                ArithmeticOp::Divide => {
                    if b == 0.0 {
                        Value::Null
                    } else {
                        Value::Float64(a / b)
                    }
                }
                ArithmeticOp::Modulo => {
                    if b == 0.0 {
                        Value::Null
                    } else {
                        Value::Float64(a % b)
                    }
                }
            })
        }
    }
}

fn eval_comparison(op: ComparisonOp, l: Value, r: Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    let ordering = match (&l, &r) {
        (Value::VarChar(a), Value::VarChar(b)) => a.cmp(b),
        (Value::VarBinary(a), Value::VarBinary(b)) => a.cmp(b),
        _ => {
            let (a, b) = (numeric(&l)?.as_f64(), numeric(&r)?.as_f64());
            a.partial_cmp(&b)
                .ok_or_else(|| KmxError::Execution("incomparable values".to_string()))?
        }
    };
    let truth = match op {
        ComparisonOp::Eq => ordering.is_eq(),
        ComparisonOp::NotEq => ordering.is_ne(),
        ComparisonOp::Lt => ordering.is_lt(),
        ComparisonOp::LtEq => ordering.is_le(),
        ComparisonOp::Gt => ordering.is_gt(),
        ComparisonOp::GtEq => ordering.is_ge(),
    };
    Ok(Value::Int64(i64::from(truth)))
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(v) => *v as f64,
            Num::Float(v) => *v,
        }
    }
}

fn numeric(v: &Value) -> Result<Num> {
    Ok(match v {
        Value::Int64(i) => Num::Int(*i),
        Value::Uint64(u) => {
            if *u <= i64::MAX as u64 {
                Num::Int(*u as i64)
            } else {
                Num::Float(*u as f64)
            }
        }
        Value::Float64(f) => Num::Float(*f),
        Value::VarChar(s) => Num::Float(
            s.trim()
                .parse::<f64>()
                .map_err(|_| KmxError::Execution(format!("cannot coerce {s:?} to a number")))?,
        ),
        other => {
            return Err(KmxError::Execution(format!(
                "cannot coerce {other:?} to a number"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{translate, EvalExpr, TranslateConfig};
    use kmx_sql::ast::{ArithmeticOp, ColName, Expr, Literal};
    use kmx_sql::Value;
    use std::collections::HashMap;

    const CFG: TranslateConfig = TranslateConfig { collation: 45 };

    #[test]
    fn translates_constant_arithmetic() {
        let expr = Expr::Arithmetic {
            op: ArithmeticOp::Plus,
            left: Box::new(Expr::Literal(Literal::Int("1".to_string()))),
            right: Box::new(Expr::Literal(Literal::Int("2".to_string()))),
        };
        let t = translate(&expr, &CFG).expect("translate");
        assert_eq!(t.evaluate(&HashMap::new()).expect("eval"), Value::Int64(3));
    }

    #[test]
    fn refuses_column_references() {
        let expr = Expr::Column(ColName::unqualified("a"));
        assert!(translate(&expr, &CFG).is_err());
    }

    #[test]
    fn bind_vars_resolve_at_eval_time() {
        let t = EvalExpr::BindVar("v1".to_string());
        let mut binds = HashMap::new();
        binds.insert("v1".to_string(), Value::VarChar("x".to_string()));
        assert_eq!(
            t.evaluate(&binds).expect("eval"),
            Value::VarChar("x".to_string())
        );
        assert!(t.evaluate(&HashMap::new()).is_err());
    }

    #[test]
    fn division_by_zero_is_null() {
        let expr = Expr::Arithmetic {
            op: ArithmeticOp::Divide,
            left: Box::new(Expr::Literal(Literal::Int("1".to_string()))),
            right: Box::new(Expr::Literal(Literal::Int("0".to_string()))),
        };
        let t = translate(&expr, &CFG).expect("translate");
        assert_eq!(t.evaluate(&HashMap::new()).expect("eval"), Value::Null);
    }
}
