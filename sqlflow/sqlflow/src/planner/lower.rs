//! Pass 3: statements → operations, with identifier validation and
//! dependency inference.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use itertools::Itertools;
use regex::Regex;
use sqlflow_parser::ast::{Stmt, StmtKind};
use sqlflow_parser::error::{Error, Reason, WithErrorInfo};

use crate::ir::plan::{ExportOp, LoadOp, OpKind, Operation, SourceDefOp, TransformOp};
use crate::profile::Profile;
use crate::safety;

/// Connector params that name database objects and therefore must pass
/// identifier validation. Everything else (paths, URLs, credentials) is
/// opaque.
const IDENTIFIER_PARAMS: &[&str] = &["table", "schema", "table_name", "cursor_field"];

struct Lowering {
    ops: Vec<Operation>,
    /// source name → (op id, params)
    sources: BTreeMap<String, (String, serde_json::Value)>,
    /// table name → id of the op that (last) produces it
    producers: BTreeMap<String, String>,
    transform_ids: Vec<String>,
}

pub(super) fn lower(stmts: Vec<Stmt>, profile: &Profile) -> Result<Vec<Operation>, Error> {
    let mut lowering = Lowering {
        ops: Vec::with_capacity(stmts.len()),
        sources: BTreeMap::new(),
        producers: BTreeMap::new(),
        transform_ids: Vec::new(),
    };

    for (index, stmt) in stmts.into_iter().enumerate() {
        lowering.lower_stmt(index, stmt, profile)?;
    }

    Ok(lowering.ops)
}

impl Lowering {
    fn lower_stmt(&mut self, index: usize, stmt: Stmt, profile: &Profile) -> Result<(), Error> {
        let span = stmt.span;

        match stmt.kind {
            StmtKind::SourceDef(def) => {
                safety::validate_identifier(&def.name).with_span_fallback(span)?;

                let (type_tag, params) = match def.from_ref {
                    // `SOURCE x FROM "name"` points at a profile connector,
                    // with OPTIONS layered over its params.
                    Some(ref connector) => {
                        let base = profile.connectors.get(connector).ok_or_else(|| {
                            Error::new(Reason::UnknownReference {
                                name: connector.clone(),
                            })
                            .with_span(span)
                            .push_hint("declare the connector in the profile's `connectors` section")
                        })?;
                        let mut params = base.params.clone();
                        if let Some(options) = def.options {
                            merge_params(&mut params, options);
                        }
                        (base.type_tag.clone(), params)
                    }
                    None => (
                        def.type_tag.unwrap_or_default(),
                        def.params.unwrap_or_else(|| serde_json::json!({})),
                    ),
                };

                validate_identifier_params(&params).with_span_fallback(span)?;

                let id = format!("{index:03}_source_{}", def.name);
                self.sources
                    .insert(def.name.clone(), (id.clone(), params.clone()));
                self.ops.push(Operation {
                    id,
                    kind: OpKind::SourceDef(SourceDefOp {
                        name: def.name,
                        type_tag,
                        params,
                    }),
                    depends_on: BTreeSet::new(),
                });
            }

            StmtKind::Load(load) => {
                safety::validate_identifier(&load.target_table).with_span_fallback(span)?;
                for key in &load.merge_keys {
                    safety::validate_identifier(key).with_span_fallback(span)?;
                }

                let (source_id, source_params) = self
                    .sources
                    .get(&load.source_ref)
                    .cloned()
                    .ok_or_else(|| {
                        Error::new(Reason::UnknownReference {
                            name: load.source_ref.clone(),
                        })
                        .with_span(span)
                        .push_hint("LOAD reads from a SOURCE defined earlier in the pipeline")
                    })?;

                let cursor_field = incremental_cursor(&source_params);
                if let Some(cursor) = &cursor_field {
                    safety::validate_identifier(cursor).with_span_fallback(span)?;
                }

                let mut depends_on = BTreeSet::from([source_id]);
                // APPEND/MERGE into a table another operation produces must
                // run after that operation
                if let Some(producer) = self.producers.get(&load.target_table) {
                    depends_on.insert(producer.clone());
                }

                let id = format!("{index:03}_load_{}", load.target_table);
                self.producers
                    .insert(load.target_table.clone(), id.clone());
                self.ops.push(Operation {
                    id,
                    kind: OpKind::Load(LoadOp {
                        target_table: load.target_table,
                        source_ref: load.source_ref,
                        mode: load.mode,
                        merge_keys: load.merge_keys,
                        cursor_field,
                    }),
                    depends_on,
                });
            }

            StmtKind::Sql(sql) => {
                let referenced = referenced_tables(&sql.raw);
                let produces = produced_tables(&sql.raw);

                let mut depends_on = BTreeSet::new();
                for table in &referenced {
                    if let Some(producer) = self.producers.get(table) {
                        depends_on.insert(producer.clone());
                    }
                }
                if referenced.is_empty() && produces.is_empty() {
                    // inference found nothing to anchor on: order after every
                    // prior transform
                    depends_on.extend(self.transform_ids.iter().cloned());
                }

                let id = match produces.first() {
                    Some(table) => format!("{index:03}_transform_{table}"),
                    None => format!("{index:03}_transform"),
                };
                for table in &produces {
                    self.producers.insert(table.clone(), id.clone());
                }
                self.transform_ids.push(id.clone());
                self.ops.push(Operation {
                    id,
                    kind: OpKind::Transform(TransformOp {
                        sql: sql.raw,
                        produces,
                    }),
                    depends_on,
                });
            }

            StmtKind::Export(export) => {
                let mut depends_on = BTreeSet::new();
                for table in referenced_tables(&export.select_sql) {
                    if let Some(producer) = self.producers.get(&table) {
                        depends_on.insert(producer.clone());
                    }
                }

                let id = format!("{index:03}_export");
                self.ops.push(Operation {
                    id,
                    kind: OpKind::Export(ExportOp {
                        select_sql: export.select_sql,
                        destination_uri: export.destination_uri,
                        type_tag: export.type_tag,
                        options: export.options.unwrap_or(serde_json::Value::Null),
                    }),
                    depends_on,
                });
            }

            StmtKind::Set(_) | StmtKind::If(_) => {
                return Err(Error::new_assert(
                    "SET and IF statements must be consumed before lowering",
                )
                .with_span(span));
            }
        }

        Ok(())
    }
}

fn merge_params(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn validate_identifier_params(params: &serde_json::Value) -> Result<(), Error> {
    let Some(members) = params.as_object() else {
        return Ok(());
    };
    for key in IDENTIFIER_PARAMS {
        if let Some(value) = members.get(*key).and_then(|v| v.as_str()) {
            safety::validate_identifier(value)
                .push_hint(format!("the `{key}` parameter becomes part of a SQL statement"))?;
        }
    }
    Ok(())
}

fn incremental_cursor(params: &serde_json::Value) -> Option<String> {
    if params.get("sync_mode").and_then(|v| v.as_str()) != Some("incremental") {
        return None;
    }
    params
        .get("cursor_field")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Tables this SQL reads or writes into, in order of appearance. Best-effort
/// lexical inference; quoted or schema-qualified names are out of scope.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:FROM|JOIN|INTO)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
    });
    re.captures_iter(sql)
        .map(|caps| caps[1].to_string())
        .unique()
        .collect()
}

/// Tables this SQL creates or inserts into.
fn produced_tables(sql: &str) -> Vec<String> {
    static CREATE_RE: OnceLock<Regex> = OnceLock::new();
    static INSERT_RE: OnceLock<Regex> = OnceLock::new();

    let create = CREATE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\bCREATE\s+(?:OR\s+REPLACE\s+)?(?:TEMP(?:ORARY)?\s+)?(?:TABLE|VIEW)\s+(?:IF\s+NOT\s+EXISTS\s+)?([A-Za-z_][A-Za-z0-9_]*)",
        )
        .unwrap()
    });
    let insert =
        INSERT_RE.get_or_init(|| Regex::new(r"(?i)\bINSERT\s+INTO\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

    create
        .captures_iter(sql)
        .chain(insert.captures_iter(sql))
        .map(|caps| caps[1].to_string())
        .unique()
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inference_finds_read_tables() {
        assert_eq!(
            referenced_tables("SELECT * FROM a JOIN b ON a.id = b.id WHERE x IN (SELECT y FROM c)"),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn inference_finds_produced_tables() {
        assert_eq!(
            produced_tables("CREATE TABLE u AS SELECT 1"),
            vec!["u"]
        );
        assert_eq!(
            produced_tables("create or replace table daily as select 1"),
            vec!["daily"]
        );
        assert_eq!(produced_tables("INSERT INTO log SELECT * FROM t"), vec!["log"]);
        assert_eq!(produced_tables("CREATE VIEW v AS SELECT 1"), vec!["v"]);
    }

    #[test]
    fn inference_ignores_duplicates() {
        assert_eq!(
            referenced_tables("SELECT * FROM t UNION SELECT * FROM t"),
            vec!["t"]
        );
    }
}
