//! Plan execution: topological stepping, staged loads, per-operation
//! transactions, and failure propagation to dependents.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlflow::ir::plan::{ExportOp, LoadOp, OpKind, Operation, Plan, SourceDefOp, TransformOp};
use sqlflow::planner::referenced_tables;
use sqlflow::profile::Profile;
use sqlflow::{Error, ErrorMessage, Reason};

use crate::connectors::{ConnectorFactory, MemoryStore, ReadOptions, Source};
use crate::data::Value;
use crate::engine::Engine;
use crate::modes;
use crate::resilience::CancelToken;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: CancelToken,
    /// The in-memory connector store for this run. Injected so tests can
    /// seed and inspect their own.
    pub memory: MemoryStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub operations: Vec<OperationResult>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.operations
            .iter()
            .all(|op| op.status == OpStatus::Succeeded)
    }

    pub fn get(&self, id: &str) -> Option<&OperationResult> {
        self.operations.iter().find(|op| op.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub id: String,
    pub status: OpStatus,
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum OpStatus {
    Succeeded,
    Failed,
    Skipped,
}

pub struct Executor {
    engine: Engine,
    factory: ConnectorFactory,
    cancel: CancelToken,
    /// name → (type_tag, params) of sources registered so far
    sources: BTreeMap<String, (String, serde_json::Value)>,
    /// memory-store tables already materialised in the engine
    registered: BTreeSet<String>,
}

impl Executor {
    pub fn new(profile: &Profile, options: RunOptions) -> Result<Executor, Error> {
        let engine = Engine::open(&profile.engines.duckdb)?;
        Ok(Executor {
            engine,
            factory: ConnectorFactory::new(options.memory, options.cancel.clone()),
            cancel: options.cancel,
            sources: BTreeMap::new(),
            registered: BTreeSet::new(),
        })
    }

    /// Step through the plan in its topological order. An operation runs only
    /// when all its dependencies succeeded; failures roll back their own
    /// transaction and mark every transitive dependent `Skipped`.
    pub fn run(&mut self, plan: &Plan) -> RunResult {
        let mut results = Vec::with_capacity(plan.operations.len());
        let mut unrunnable: BTreeSet<String> = BTreeSet::new();

        for op in &plan.operations {
            if let Err(e) = self.cancel.check() {
                unrunnable.insert(op.id.clone());
                results.push(OperationResult {
                    id: op.id.clone(),
                    status: OpStatus::Skipped,
                    rows: 0,
                    error: Some(ErrorMessage::from(e)),
                });
                continue;
            }

            if let Some(dep) = op.depends_on.iter().find(|dep| unrunnable.contains(*dep)) {
                log::info!("skipping {} ({} did not succeed)", op.id, dep);
                unrunnable.insert(op.id.clone());
                results.push(OperationResult {
                    id: op.id.clone(),
                    status: OpStatus::Skipped,
                    rows: 0,
                    error: None,
                });
                continue;
            }

            match self.execute(op) {
                Ok(rows) => {
                    log::info!("{} succeeded ({rows} rows)", op.id);
                    results.push(OperationResult {
                        id: op.id.clone(),
                        status: OpStatus::Succeeded,
                        rows,
                        error: None,
                    });
                }
                Err(e) => {
                    log::warn!("{} failed: {}", op.id, e.reason);
                    unrunnable.insert(op.id.clone());
                    results.push(OperationResult {
                        id: op.id.clone(),
                        status: OpStatus::Failed,
                        rows: 0,
                        error: Some(ErrorMessage::from(e)),
                    });
                }
            }
        }

        RunResult {
            operations: results,
        }
    }

    fn execute(&mut self, op: &Operation) -> Result<u64, Error> {
        match &op.kind {
            OpKind::SourceDef(def) => self.execute_source_def(def),
            OpKind::Load(load) => self.execute_load(load),
            OpKind::Transform(transform) => self.execute_transform(transform),
            OpKind::Export(export) => self.execute_export(export),
        }
    }

    /// Register the connector configuration under its name; no table is
    /// materialised yet.
    fn execute_source_def(&mut self, def: &SourceDefOp) -> Result<u64, Error> {
        // constructing the connector validates its params
        self.factory.source(&def.type_tag, &def.params)?;
        self.sources
            .insert(def.name.clone(), (def.type_tag.clone(), def.params.clone()));
        Ok(0)
    }

    fn source_connector(&self, name: &str) -> Result<Box<dyn Source>, Error> {
        let (type_tag, params) = self.sources.get(name).ok_or_else(|| {
            Error::new(Reason::UnknownReference {
                name: name.to_string(),
            })
        })?;
        self.factory.source(type_tag, params)
    }

    fn execute_load(&mut self, load: &LoadOp) -> Result<u64, Error> {
        let mut source = self.source_connector(&load.source_ref)?;
        let options = ReadOptions::default();

        // incremental loads read past the target's current watermark
        let chunks = match &load.cursor_field {
            Some(cursor) if self.engine.table_schema(&load.target_table)?.is_some() => {
                let watermark = self.engine.query_value(&format!(
                    "SELECT max({}) FROM {}",
                    sqlflow::safety::quote_identifier(cursor),
                    sqlflow::safety::quote_identifier(&load.target_table),
                ))?;
                match watermark {
                    Value::Null => source.read(&options)?,
                    watermark => source.read_incremental(cursor, &watermark, &options)?,
                }
            }
            _ => source.read(&options)?,
        };

        let mut schema = chunks.first().map(|c| c.schema.clone());
        if schema.as_ref().map_or(true, |s| s.columns.is_empty()) {
            schema = source.describe().ok().filter(|s| !s.columns.is_empty());
        }
        let Some(schema) = schema else {
            log::info!("source `{}` produced no data and no schema", load.source_ref);
            return Ok(0);
        };

        let staging = format!("__sqlflow_stage_{}", load.target_table);

        self.engine.begin()?;
        let result = (|| -> Result<u64, Error> {
            self.engine.create_table(&staging, &schema)?;
            let mut rows = 0u64;
            for chunk in &chunks {
                rows += self.engine.insert_chunk(&staging, chunk)?;
            }

            // pre-flight before anything touches the target
            match self.engine.table_schema(&load.target_table)? {
                None => {
                    self.engine
                        .execute_batch(&modes::replace_sql(&load.target_table, &staging))?;
                }
                Some(target_schema) => match load.mode {
                    sqlflow::ast::LoadMode::Replace => {
                        self.engine
                            .execute_batch(&modes::replace_sql(&load.target_table, &staging))?;
                    }
                    sqlflow::ast::LoadMode::Append => {
                        modes::check_compatibility(&schema, &target_schema)?;
                        self.engine.execute_batch(&modes::append_sql(
                            &load.target_table,
                            &staging,
                            &schema,
                        ))?;
                    }
                    sqlflow::ast::LoadMode::Merge | sqlflow::ast::LoadMode::Upsert => {
                        modes::check_compatibility(&schema, &target_schema)?;
                        modes::check_merge_keys(
                            &load.merge_keys,
                            &schema,
                            &target_schema,
                            &load.target_table,
                        )?;
                        for statement in modes::merge_sql(
                            &load.target_table,
                            &staging,
                            &schema,
                            &load.merge_keys,
                        ) {
                            self.engine.execute_batch(&statement)?;
                        }
                    }
                },
            }

            self.engine.drop_table(&staging)?;
            Ok(rows)
        })();

        match result {
            Ok(rows) => {
                self.engine.commit()?;
                self.engine.checkpoint();
                Ok(rows)
            }
            Err(e) => {
                self.engine.rollback();
                Err(e)
            }
        }
    }

    fn execute_transform(&mut self, transform: &TransformOp) -> Result<u64, Error> {
        self.register_memory_tables(&transform.sql)?;

        // bare queries return rows instead of a change count
        let head = transform.sql.trim_start().to_ascii_uppercase();
        let returns_rows = ["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN"]
            .iter()
            .any(|kw| head.starts_with(kw));

        self.engine.begin()?;
        let result = if returns_rows {
            self.engine
                .query(&transform.sql, ReadOptions::default().batch_size)
                .map(|chunks| chunks.iter().map(|c| c.row_count() as u64).sum())
        } else {
            self.engine.execute(&transform.sql).map(|rows| rows as u64)
        };

        match result {
            Ok(rows) => {
                self.engine.commit()?;
                self.engine.checkpoint();
                Ok(rows)
            }
            Err(e) => {
                self.engine.rollback();
                Err(e)
            }
        }
    }

    fn execute_export(&mut self, export: &ExportOp) -> Result<u64, Error> {
        self.register_memory_tables(&export.select_sql)?;

        let chunks = self
            .engine
            .query(&export.select_sql, ReadOptions::default().batch_size)?;

        let mut destination =
            self.factory
                .destination(&export.type_tag, &export.destination_uri, &export.options)?;
        let result = destination.write(&chunks, sqlflow::ast::LoadMode::Replace, &[])?;
        Ok(result.rows_written)
    }

    /// Make every referenced in-memory table visible to the engine. Idempotent.
    fn register_memory_tables(&mut self, sql: &str) -> Result<(), Error> {
        for table in referenced_tables(sql) {
            if self.registered.contains(&table) {
                continue;
            }
            let Some(chunk) = self.factory.memory_store().get(&table) else {
                continue;
            };
            if self.engine.table_exists(&table)? {
                continue;
            }
            sqlflow::safety::validate_identifier(&table)?;
            log::debug!("registering in-memory table `{table}` with the engine");
            self.engine.create_table(&table, &chunk.schema)?;
            self.engine.insert_chunk(&table, &chunk)?;
            self.registered.insert(table);
        }
        Ok(())
    }
}
