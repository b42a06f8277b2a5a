//! Lowers the statement AST into an operation plan.
//!
//! Pass 1 flattens conditionals (evaluating `SET`s in source order), pass 2
//! substitutes variables per context, pass 3 lowers to operations with
//! identifier validation, pass 4 orders the DAG and rejects cycles.

mod lower;

pub use lower::referenced_tables;

use sqlflow_parser::ast::{SetStmt, SqlStmt, Stmt, StmtKind};
use sqlflow_parser::error::{Error, WithErrorInfo};

use crate::eval::eval_condition;
use crate::ir::plan::{self, Operation, Plan};
use crate::profile::Profile;
use crate::variables::{VarContext, VariableResolver};

pub fn plan(
    stmts: Vec<Stmt>,
    profile: &Profile,
    vars: &mut VariableResolver,
) -> Result<Plan, Error> {
    let operations = lowered(stmts, profile, vars)?;
    let operations = plan::toposort(operations)?;
    Ok(Plan { operations })
}

/// Planner passes 1–3, without the final ordering. This is what `validate`
/// runs.
pub fn check(stmts: Vec<Stmt>, profile: &Profile, vars: &mut VariableResolver) -> Result<(), Error> {
    lowered(stmts, profile, vars).map(|_| ())
}

fn lowered(
    stmts: Vec<Stmt>,
    profile: &Profile,
    vars: &mut VariableResolver,
) -> Result<Vec<Operation>, Error> {
    let flat = flatten(stmts, vars)?;
    log::debug!("flattened to {} statements", flat.len());

    let substituted = flat
        .into_iter()
        .map(|stmt| substitute_stmt(stmt, vars))
        .collect::<Result<Vec<_>, _>>()?;

    lower::lower(substituted, profile)
}

/// Pass 1. Exactly one branch of each conditional survives (or none); `SET`
/// statements are folded into the resolver as they are passed, so a `SET`
/// inside a discarded branch has no effect.
fn flatten(stmts: Vec<Stmt>, vars: &mut VariableResolver) -> Result<Vec<Stmt>, Error> {
    let mut out = Vec::with_capacity(stmts.len());

    for stmt in stmts {
        match stmt.kind {
            StmtKind::Set(SetStmt { name, expression }) => {
                let value = vars
                    .substitute(&expression, VarContext::Raw)
                    .with_span_fallback(stmt.span)?;
                vars.set(&name, unquote(value));
            }
            StmtKind::If(block) => {
                let mut chosen = None;
                for (cond, body) in block.branches {
                    if eval_condition(&cond, vars).with_span_fallback(stmt.span)? {
                        chosen = Some(body);
                        break;
                    }
                }
                if let Some(body) = chosen.or(block.else_body) {
                    out.extend(flatten(body, vars)?);
                }
            }
            _ => out.push(stmt),
        }
    }

    Ok(out)
}

/// A quoted `SET` value binds its inner text: `SET r = 'us-west'` binds
/// `us-west`.
fn unquote(value: String) -> String {
    let trimmed = value.trim();
    let quoted = trimmed.len() >= 2
        && (trimmed.starts_with('\'') && trimmed.ends_with('\'')
            || trimmed.starts_with('"') && trimmed.ends_with('"'));
    if quoted {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        value
    }
}

/// Pass 2. Each string field is substituted in its context: connector params
/// and destination paths verbatim, SQL text as SQL literals.
fn substitute_stmt(mut stmt: Stmt, vars: &VariableResolver) -> Result<Stmt, Error> {
    let span = stmt.span;

    stmt.kind = match stmt.kind {
        StmtKind::SourceDef(mut def) => {
            if let Some(params) = def.params.take() {
                def.params = Some(substitute_json(params, vars).with_span_fallback(span)?);
            }
            if let Some(options) = def.options.take() {
                def.options = Some(substitute_json(options, vars).with_span_fallback(span)?);
            }
            StmtKind::SourceDef(def)
        }
        StmtKind::Sql(sql) => StmtKind::Sql(SqlStmt {
            raw: vars
                .substitute(&sql.raw, VarContext::SqlLiteral)
                .with_span_fallback(span)?,
        }),
        StmtKind::Export(mut export) => {
            export.select_sql = vars
                .substitute(&export.select_sql, VarContext::SqlLiteral)
                .with_span_fallback(span)?;
            export.destination_uri = vars
                .substitute(&export.destination_uri, VarContext::Raw)
                .with_span_fallback(span)?;
            if let Some(options) = export.options.take() {
                export.options = Some(substitute_json(options, vars).with_span_fallback(span)?);
            }
            StmtKind::Export(export)
        }
        other => other,
    };

    Ok(stmt)
}

fn substitute_json(
    value: serde_json::Value,
    vars: &VariableResolver,
) -> Result<serde_json::Value, Error> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => Value::String(vars.substitute(&s, VarContext::Raw)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| substitute_json(item, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(members) => Value::Object(
            members
                .into_iter()
                .map(|(key, item)| substitute_json(item, vars).map(|item| (key, item)))
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}
