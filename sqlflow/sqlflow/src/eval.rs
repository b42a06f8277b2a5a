//! Condition evaluation over resolved variables.
//!
//! Walks the expression AST directly; no host-language evaluation is ever
//! involved. Comparisons are numeric when both operands parse as numbers and
//! lexicographic otherwise; `AND`/`OR` short-circuit.

use sqlflow_parser::ast::{BinOp, Expr, ExprKind, Literal, UnOp};
use sqlflow_parser::error::{Error, Reason, WithErrorInfo};

use crate::variables::VariableResolver;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Value {
    fn describe(&self) -> String {
        match self {
            Value::Text(s) => format!("string '{s}'"),
            Value::Number(n) => format!("number {n}"),
            Value::Bool(b) => format!("boolean {b}"),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        }
    }
}

/// Evaluate a condition to a boolean. Non-boolean results are a
/// [Reason::ConditionType] error.
pub fn eval_condition(expr: &Expr, vars: &VariableResolver) -> Result<bool, Error> {
    match eval(expr, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::new(Reason::ConditionType {
            found: other.describe(),
        })
        .with_span(expr.span)
        .push_hint("compare the value explicitly, e.g. `${x} == 'true'`")),
    }
}

fn eval(expr: &Expr, vars: &VariableResolver) -> Result<Value, Error> {
    Ok(match &expr.kind {
        ExprKind::Literal(Literal::String(s)) => Value::Text(s.clone()),
        ExprKind::Literal(Literal::Integer(i)) => Value::Number(*i as f64),
        ExprKind::Literal(Literal::Float(f)) => Value::Number(*f),
        ExprKind::Literal(Literal::Boolean(b)) => Value::Bool(*b),
        ExprKind::Literal(Literal::Null) => Value::Text(String::new()),

        // Variables resolve to their string value; comparison decides whether
        // it is treated numerically.
        ExprKind::Variable(var) => Value::Text(
            vars.resolve(var)
                .map(|b| b.value)
                .with_span(expr.span)?,
        ),

        // A bare word compares by its text.
        ExprKind::Ident(name) => Value::Text(name.clone()),

        ExprKind::Unary(unary) => {
            let UnOp::Not = unary.op;
            match eval(&unary.expr, vars)? {
                Value::Bool(b) => Value::Bool(!b),
                other => {
                    return Err(Error::new(Reason::ConditionType {
                        found: other.describe(),
                    })
                    .with_span(unary.expr.span))
                }
            }
        }

        ExprKind::Binary(binary) => match binary.op {
            BinOp::And | BinOp::Or => {
                let left = require_bool(eval(&binary.left, vars)?, &binary.left)?;
                // short-circuit
                match (binary.op, left) {
                    (BinOp::And, false) => Value::Bool(false),
                    (BinOp::Or, true) => Value::Bool(true),
                    _ => Value::Bool(require_bool(eval(&binary.right, vars)?, &binary.right)?),
                }
            }
            op => {
                let left = eval(&binary.left, vars)?;
                let right = eval(&binary.right, vars)?;
                Value::Bool(compare(&left, &right, op))
            }
        },
    })
}

fn require_bool(value: Value, expr: &Expr) -> Result<bool, Error> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(Error::new(Reason::ConditionType {
            found: other.describe(),
        })
        .with_span(expr.span)),
    }
}

fn compare(left: &Value, right: &Value, op: BinOp) -> bool {
    let (l, r) = (left.as_text(), right.as_text());

    let ordering = match (l.parse::<f64>(), r.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r),
        _ => Some(l.cmp(&r)),
    };

    let Some(ordering) = ordering else {
        // NaN on either side: nothing compares
        return matches!(op, BinOp::Ne);
    };

    match op {
        BinOp::Eq => ordering.is_eq(),
        BinOp::Ne => !ordering.is_eq(),
        BinOp::Lt => ordering.is_lt(),
        BinOp::Lte => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Gte => ordering.is_ge(),
        BinOp::And | BinOp::Or => unreachable!("handled by eval"),
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> VariableResolver {
        let profile = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        VariableResolver::new(BTreeMap::new(), profile).with_env_lookup(|_| None)
    }

    fn check(source: &str, resolver: &VariableResolver) -> Result<bool, Error> {
        let stmts =
            sqlflow_parser::parse_source(&format!("IF {source} THEN SELECT 1; END IF"), 0)
                .unwrap();
        let block = stmts[0].kind.as_if().unwrap().clone();
        eval_condition(&block.branches[0].0, resolver)
    }

    #[test]
    fn string_equality() {
        let r = vars(&[("env", "prod")]);
        assert!(check("${env} == 'prod'", &r).unwrap());
        assert!(!check("${env} == 'dev'", &r).unwrap());
        assert!(check("${env} != 'dev'", &r).unwrap());
    }

    #[test]
    fn numeric_comparison_when_both_sides_are_numbers() {
        let r = vars(&[("batch", "200")]);
        // lexicographically "200" < "30"; numerically it is not
        assert!(check("${batch} > 30", &r).unwrap());
        assert!(check("${batch} <= 200", &r).unwrap());
    }

    #[test]
    fn lexicographic_comparison_otherwise() {
        let r = vars(&[("name", "alpha")]);
        assert!(check("${name} < 'beta'", &r).unwrap());
    }

    #[test]
    fn boolean_connectives_short_circuit() {
        let r = vars(&[("env", "prod"), ("region", "eu")]);
        assert!(check("${env} == 'prod' AND ${region} == 'eu'", &r).unwrap());
        assert!(check("${env} == 'dev' OR ${region} == 'eu'", &r).unwrap());
        // The unresolved variable on the right is never evaluated.
        assert!(check("${env} == 'prod' OR ${missing} == 'x'", &r).unwrap());
        assert!(!check("${env} == 'dev' AND ${missing} == 'x'", &r).unwrap());
    }

    #[test]
    fn not_negates() {
        let r = vars(&[("env", "prod")]);
        assert!(!check("NOT ${env} == 'prod'", &r).unwrap());
        assert!(check("NOT (${env} == 'dev' AND true)", &r).unwrap());
    }

    #[test]
    fn unresolved_variable_propagates() {
        let r = vars(&[]);
        let err = check("${missing} == 'x'", &r).unwrap_err();
        assert!(matches!(err.reason, Reason::UnresolvedVariable { .. }));
        assert!(err.span.is_some());
    }

    #[test]
    fn non_boolean_condition_is_a_type_error() {
        let r = vars(&[("env", "prod")]);
        let err = check("${env}", &r).unwrap_err();
        assert!(matches!(err.reason, Reason::ConditionType { .. }));

        let err = check("${env} AND true", &r).unwrap_err();
        assert!(matches!(err.reason, Reason::ConditionType { .. }));
    }
}
