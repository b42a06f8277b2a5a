//! The embedded DuckDB adapter.
//!
//! Owns the single connection a run executes against, the persistent-mode
//! lock file, and the transaction/checkpoint discipline.

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use duckdb::types::{TimeUnit, ToSqlOutput, ValueRef};
use duckdb::{params_from_iter, Connection, ToSql};
use sqlflow::profile::{EngineConfig, EngineMode};
use sqlflow::safety::quote_identifier;
use sqlflow::{Error, Reason, WithErrorInfo};

use crate::data::{Column, DataChunk, DataType, Schema, Value};

pub struct Engine {
    conn: Connection,
    persistent: bool,
    _lock: Option<EngineLock>,
}

/// Exclusive advisory lock next to the database file. Released on drop.
struct EngineLock {
    path: PathBuf,
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn engine_err(e: duckdb::Error) -> Error {
    Error::new(Reason::EngineInternal {
        details: e.to_string(),
    })
}

impl Engine {
    pub fn open(config: &EngineConfig) -> Result<Engine, Error> {
        let (conn, lock, persistent) = match config.mode {
            EngineMode::Memory => (Connection::open_in_memory().map_err(engine_err)?, None, false),
            EngineMode::Persistent => {
                let path = config.path.as_deref().ok_or_else(|| {
                    Error::new_simple("persistent engine mode requires `engines.duckdb.path`")
                })?;
                let lock = EngineLock::acquire(path)?;
                (Connection::open(path).map_err(engine_err)?, Some(lock), true)
            }
        };

        if let Some(limit) = &config.memory_limit {
            let limit = limit.replace('\'', "");
            conn.execute_batch(&format!("SET memory_limit='{limit}';"))
                .map_err(engine_err)?;
        }

        Ok(Engine {
            conn,
            persistent,
            _lock: lock,
        })
    }

    pub fn begin(&self) -> Result<(), Error> {
        self.conn
            .execute_batch("BEGIN TRANSACTION;")
            .map_err(engine_err)
    }

    pub fn commit(&self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT;").map_err(|e| {
            Error::new(Reason::TransactionAborted {
                details: e.to_string(),
            })
        })
    }

    pub fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK;") {
            log::warn!("rollback failed: {e}");
        }
    }

    /// Flush the WAL after a committed mutation in persistent mode.
    pub fn checkpoint(&self) {
        if !self.persistent {
            return;
        }
        if let Err(e) = self.conn.execute_batch("CHECKPOINT;") {
            log::warn!("checkpoint failed: {e}");
        }
    }

    /// Execute one statement, returning the affected row count.
    pub fn execute(&self, sql: &str) -> Result<usize, Error> {
        log::debug!("engine execute: {sql}");
        self.conn.execute(sql, []).map_err(engine_err)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), Error> {
        log::debug!("engine execute_batch: {sql}");
        self.conn.execute_batch(sql).map_err(engine_err)
    }

    /// Run a query and collect the result as chunks of at most `batch_size`
    /// rows.
    pub fn query(&self, sql: &str, batch_size: usize) -> Result<Vec<DataChunk>, Error> {
        log::debug!("engine query: {sql}");
        let mut stmt = self.conn.prepare(sql).map_err(engine_err)?;

        let mut rows = stmt.query([]).map_err(engine_err)?;
        let mut names: Option<Vec<String>> = None;
        let mut chunks = Vec::new();
        let mut current: Option<DataChunk> = None;

        while let Some(row) = rows.next().map_err(engine_err)? {
            let names = names.get_or_insert_with(|| {
                row.as_ref().column_names().iter().map(|s| s.to_string()).collect()
            });

            let chunk = current.get_or_insert_with(|| {
                DataChunk::empty(Schema {
                    columns: names
                        .iter()
                        .map(|name| Column {
                            name: name.clone(),
                            data_type: DataType::Text,
                        })
                        .collect(),
                })
            });

            let mut values = Vec::with_capacity(names.len());
            for i in 0..names.len() {
                let value = row.get_ref(i).map_err(engine_err)?;
                values.push(value_from_ref(value)?);
            }
            chunk.push_row(values);

            if chunk.row_count() >= batch_size {
                let mut full = current.take().unwrap();
                full.infer_types();
                chunks.push(full);
            }
        }

        if let Some(mut chunk) = current {
            chunk.infer_types();
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Single-value helper for watermark lookups and the like.
    pub fn query_value(&self, sql: &str) -> Result<Value, Error> {
        let chunks = self.query(sql, 2)?;
        Ok(chunks
            .first()
            .filter(|c| c.row_count() > 0)
            .map(|c| c.columns[0][0].clone())
            .unwrap_or(Value::Null))
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT count(*) FROM information_schema.tables WHERE table_name = ?")
            .map_err(engine_err)?;
        let count: i64 = stmt
            .query_row([table], |row| row.get(0))
            .map_err(engine_err)?;
        Ok(count > 0)
    }

    /// Column names and normalised types, or `None` when the table does not
    /// exist.
    pub fn table_schema(&self, table: &str) -> Result<Option<Schema>, Error> {
        if !self.table_exists(table)? {
            return Ok(None);
        }
        let mut stmt = self
            .conn
            .prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = ? ORDER BY ordinal_position",
            )
            .map_err(engine_err)?;
        let mut rows = stmt.query([table]).map_err(engine_err)?;

        let mut columns = Vec::new();
        while let Some(row) = rows.next().map_err(engine_err)? {
            let name: String = row.get(0).map_err(engine_err)?;
            let decl: String = row.get(1).map_err(engine_err)?;
            columns.push(Column {
                name,
                data_type: DataType::from_engine_decl(&decl),
            });
        }
        Ok(Some(Schema { columns }))
    }

    pub fn create_table(&self, table: &str, schema: &Schema) -> Result<(), Error> {
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_identifier(&c.name), c.data_type.sql_decl()))
            .collect::<Vec<_>>()
            .join(", ");
        self.execute_batch(&format!(
            "CREATE OR REPLACE TABLE {} ({});",
            quote_identifier(table),
            columns
        ))
    }

    pub fn drop_table(&self, table: &str) -> Result<(), Error> {
        self.execute_batch(&format!(
            "DROP TABLE IF EXISTS {};",
            quote_identifier(table)
        ))
    }

    /// Append a chunk through a prepared, fully parameterised INSERT.
    pub fn insert_chunk(&self, table: &str, chunk: &DataChunk) -> Result<u64, Error> {
        if chunk.row_count() == 0 {
            return Ok(0);
        }
        let columns = chunk
            .schema
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; chunk.schema.columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            columns,
            placeholders
        );

        let mut stmt = self.conn.prepare(&sql).map_err(engine_err)?;
        for i in 0..chunk.row_count() {
            let row = chunk.row(i);
            stmt.execute(params_from_iter(row.iter()))
                .map_err(engine_err)?;
        }
        Ok(chunk.row_count() as u64)
    }
}

impl EngineLock {
    fn acquire(db_path: &str) -> Result<EngineLock, Error> {
        let path = PathBuf::from(format!("{db_path}.lock"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(EngineLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::new(Reason::EngineLocked {
                    path: db_path.to_string(),
                })
                .push_hint("another SQLFlow run holds this engine file; wait for it or remove the stale .lock file"))
            }
            Err(e) => Err(Error::new_simple(format!(
                "cannot create engine lock file: {e}"
            ))),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        use duckdb::types::Value as Dv;
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(Dv::Null),
            Value::Boolean(b) => ToSqlOutput::Owned(Dv::Boolean(*b)),
            Value::Integer(i) => ToSqlOutput::Owned(Dv::BigInt(*i)),
            Value::Double(f) => ToSqlOutput::Owned(Dv::Double(*f)),
            Value::Text(s) => ToSqlOutput::Owned(Dv::Text(s.clone())),
            Value::Date(d) => return d.to_sql(),
            Value::Timestamp(ts) => return ts.to_sql(),
        })
    }
}

fn value_from_ref(value: ValueRef) -> Result<Value, Error> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Boolean(b),
        ValueRef::TinyInt(v) => Value::Integer(v as i64),
        ValueRef::SmallInt(v) => Value::Integer(v as i64),
        ValueRef::Int(v) => Value::Integer(v as i64),
        ValueRef::BigInt(v) => Value::Integer(v),
        ValueRef::UTinyInt(v) => Value::Integer(v as i64),
        ValueRef::USmallInt(v) => Value::Integer(v as i64),
        ValueRef::UInt(v) => Value::Integer(v as i64),
        ValueRef::UBigInt(v) => i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Double(v as f64)),
        ValueRef::HugeInt(v) => i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Double(v as f64)),
        ValueRef::Float(v) => Value::Double(v as f64),
        ValueRef::Double(v) => Value::Double(v),
        ValueRef::Decimal(d) => Value::Double(d.to_string().parse::<f64>().unwrap_or(f64::NAN)),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Date32(days) => Value::Date(date_from_days(days)?),
        ValueRef::Timestamp(unit, v) => Value::Timestamp(timestamp_from_unit(unit, v)?),
        other => {
            return Err(Error::new(Reason::EngineInternal {
                details: format!("unsupported engine value: {other:?}"),
            }))
        }
    })
}

fn date_from_days(days: i32) -> Result<NaiveDate, Error> {
    crate::data::date_from_epoch_days(days).ok_or_else(|| {
        Error::new(Reason::EngineInternal {
            details: format!("date out of range: {days} days since epoch"),
        })
    })
}

fn timestamp_from_unit(unit: TimeUnit, value: i64) -> Result<NaiveDateTime, Error> {
    let micros = match unit {
        TimeUnit::Second => value.checked_mul(1_000_000),
        TimeUnit::Millisecond => value.checked_mul(1_000),
        TimeUnit::Microsecond => Some(value),
        TimeUnit::Nanosecond => Some(value / 1_000),
    };
    micros
        .and_then(crate::data::timestamp_from_micros)
        .ok_or_else(|| {
            Error::new(Reason::EngineInternal {
                details: format!("timestamp out of range: {value} ({unit:?})"),
            })
        })
}
