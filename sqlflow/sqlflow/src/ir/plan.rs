//! The operation DAG produced by the planner.
//!
//! A [Plan] is conditional-free and fully substituted; its operations are
//! stored in a valid topological order, with ties broken by statement order
//! so compilation is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use sqlflow_parser::ast::LoadMode;
use sqlflow_parser::error::{Error, Reason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub operations: Vec<Operation>,
}

impl Plan {
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(flatten)]
    pub kind: OpKind,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub depends_on: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, EnumAsInner, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OpKind {
    SourceDef(SourceDefOp),
    Load(LoadOp),
    Transform(TransformOp),
    Export(ExportOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefOp {
    pub name: String,
    pub type_tag: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOp {
    pub target_table: String,
    pub source_ref: String,
    pub mode: LoadMode,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub merge_keys: Vec<String>,
    /// Watermark column for incremental sources.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOp {
    pub sql: String,
    /// Table names this statement creates or writes, as inferred from the SQL.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub produces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOp {
    pub select_sql: String,
    pub destination_uri: String,
    pub type_tag: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub options: serde_json::Value,
}

/// Kahn's algorithm, always taking the earliest ready operation so the output
/// order is stable for identical inputs.
pub fn toposort(operations: Vec<Operation>) -> Result<Vec<Operation>, Error> {
    let mut remaining = operations;
    let mut done: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|op| op.depends_on.iter().all(|dep| done.contains(dep)));

        match ready {
            Some(i) => {
                let op = remaining.remove(i);
                done.insert(op.id.clone());
                out.push(op);
            }
            None => {
                return Err(Error::new(Reason::PlanCycle {
                    path: cycle_path(&remaining),
                }));
            }
        }
    }

    Ok(out)
}

/// Walk unmet dependencies from the first stuck operation until one repeats.
fn cycle_path(remaining: &[Operation]) -> Vec<String> {
    let by_id: BTreeMap<&str, &Operation> = remaining.iter().map(|op| (op.id.as_str(), op)).collect();

    let mut path: Vec<String> = Vec::new();
    let mut current = match remaining.first() {
        Some(op) => op.id.clone(),
        None => return path,
    };

    loop {
        if let Some(at) = path.iter().position(|id| *id == current) {
            let mut cycle = path.split_off(at);
            cycle.push(current);
            return cycle;
        }
        path.push(current.clone());

        let next = by_id
            .get(current.as_str())
            .and_then(|op| op.depends_on.iter().find(|dep| by_id.contains_key(dep.as_str())));
        match next {
            Some(next) => current = next.clone(),
            None => return path,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn op(id: &str, deps: &[&str]) -> Operation {
        Operation {
            id: id.to_string(),
            kind: OpKind::Transform(TransformOp {
                sql: format!("SELECT '{id}'"),
                produces: vec![],
            }),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn toposort_is_stable_for_independent_ops() {
        let sorted = toposort(vec![op("b", &[]), op("a", &[]), op("c", &["a"])]).unwrap();
        let ids: Vec<_> = sorted.iter().map(|o| o.id.as_str()).collect();
        // statement order wins among ready operations
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn dependencies_order_execution() {
        let sorted = toposort(vec![op("late", &["early"]), op("early", &[])]).unwrap();
        let ids: Vec<_> = sorted.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn cycles_are_reported_with_a_path() {
        let err = toposort(vec![op("a", &["b"]), op("b", &["a"])]).unwrap_err();
        let Reason::PlanCycle { path } = err.reason else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(path, vec!["a", "b", "a"]);
    }
}
