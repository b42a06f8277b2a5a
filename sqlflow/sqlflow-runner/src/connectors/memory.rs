//! The in-memory connector: a single-process table store, intended for
//! tests. One `MemoryStore` owner is injected into every instance so each
//! test can run against its own map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlflow::ast::LoadMode;
use sqlflow::{Error, Reason};

use crate::data::{DataChunk, Schema, Value};

use super::{
    config_err, required_str, Connector, ConnectorKind, Destination, ReadOptions, Source,
    TestStatus, WriteResult,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<String, DataChunk>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn put(&self, name: &str, chunk: DataChunk) {
        self.tables.lock().unwrap().insert(name.to_string(), chunk);
    }

    pub fn get(&self, name: &str) -> Option<DataChunk> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct MemoryConnector {
    store: MemoryStore,
    table_name: String,
}

impl MemoryConnector {
    pub fn configure(params: &serde_json::Value, store: MemoryStore) -> Result<MemoryConnector, Error> {
        Ok(MemoryConnector {
            store,
            table_name: required_str(params, "table_name", "memory")?,
        })
    }
}

impl Connector for MemoryConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Memory
    }

    fn test_connection(&mut self) -> TestStatus {
        TestStatus {
            ok: true,
            message: format!("{} tables in store", self.store.table_names().len()),
        }
    }
}

impl Source for MemoryConnector {
    fn describe(&mut self) -> Result<Schema, Error> {
        self.store
            .get(&self.table_name)
            .map(|chunk| chunk.schema)
            .ok_or_else(|| config_err("memory", format!("no such table `{}`", self.table_name)))
    }

    fn read(&mut self, _options: &ReadOptions) -> Result<Vec<DataChunk>, Error> {
        match self.store.get(&self.table_name) {
            Some(chunk) => Ok(vec![chunk]),
            None => Err(config_err(
                "memory",
                format!("no such table `{}`", self.table_name),
            )),
        }
    }

    fn read_incremental(
        &mut self,
        cursor_field: &str,
        cursor_value: &Value,
        options: &ReadOptions,
    ) -> Result<Vec<DataChunk>, Error> {
        let chunk = self.read(options)?.remove(0);
        let cursor_index = chunk
            .schema
            .columns
            .iter()
            .position(|c| c.name == cursor_field)
            .ok_or_else(|| {
                config_err("memory", format!("no cursor column `{cursor_field}`"))
            })?;

        let mut filtered = DataChunk::empty(chunk.schema.clone());
        for i in 0..chunk.row_count() {
            let row = chunk.row(i);
            if value_gt(&row[cursor_index], cursor_value) {
                filtered.push_row(row);
            }
        }
        Ok(vec![filtered])
    }
}

/// `left > right`, numerically when both sides are numbers.
fn value_gt(left: &Value, right: &Value) -> bool {
    let (l, r) = (left.render(), right.render());
    match (l.parse::<f64>(), r.parse::<f64>()) {
        (Ok(l), Ok(r)) => l > r,
        _ => l > r,
    }
}

impl Destination for MemoryConnector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        mode: LoadMode,
        merge_keys: &[String],
    ) -> Result<WriteResult, Error> {
        let mut rows_written = 0u64;

        for chunk in chunks {
            rows_written += chunk.row_count() as u64;
        }

        let Some(first) = chunks.first() else {
            return Ok(WriteResult { rows_written: 0 });
        };

        let mut combined = DataChunk::empty(first.schema.clone());
        for chunk in chunks {
            for i in 0..chunk.row_count() {
                combined.push_row(chunk.row(i));
            }
        }

        match mode {
            LoadMode::Replace => self.store.put(&self.table_name, combined),
            LoadMode::Append => {
                let mut existing = self
                    .store
                    .get(&self.table_name)
                    .unwrap_or_else(|| DataChunk::empty(combined.schema.clone()));
                for i in 0..combined.row_count() {
                    existing.push_row(combined.row(i));
                }
                self.store.put(&self.table_name, existing);
            }
            LoadMode::Merge | LoadMode::Upsert => {
                if merge_keys.is_empty() {
                    return Err(Error::new_simple(
                        "the memory connector requires merge keys for MERGE writes",
                    ));
                }
                let existing = self
                    .store
                    .get(&self.table_name)
                    .unwrap_or_else(|| DataChunk::empty(combined.schema.clone()));
                let merged = merge_rows(existing, combined, merge_keys)?;
                self.store.put(&self.table_name, merged);
            }
        }

        Ok(WriteResult { rows_written })
    }
}

/// Upsert on key equality: incoming rows overwrite matching rows, the rest
/// append in arrival order.
fn merge_rows(
    existing: DataChunk,
    incoming: DataChunk,
    merge_keys: &[String],
) -> Result<DataChunk, Error> {
    let key_indices: Vec<usize> = merge_keys
        .iter()
        .map(|key| {
            existing
                .schema
                .columns
                .iter()
                .position(|c| &c.name == key)
                .ok_or_else(|| {
                    Error::new(Reason::MissingMergeKey {
                        key: key.clone(),
                        table: "the memory table".to_string(),
                    })
                })
        })
        .collect::<Result<_, _>>()?;

    let key_of = |row: &[Value]| -> Vec<Value> {
        key_indices.iter().map(|&i| row[i].clone()).collect()
    };

    let mut out = DataChunk::empty(existing.schema.clone());
    let mut row_index: HashMap<String, usize> = HashMap::new();

    for chunk in [&existing, &incoming] {
        for i in 0..chunk.row_count() {
            let row = chunk.row(i);
            let key = format!("{:?}", key_of(&row));
            match row_index.get(&key) {
                Some(&at) => {
                    for (column, value) in out.columns.iter_mut().zip(row) {
                        column[at] = value;
                    }
                }
                None => {
                    row_index.insert(key, out.row_count());
                    out.push_row(row);
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::DataType;

    fn chunk(rows: &[(i64, &str)]) -> DataChunk {
        let mut chunk = DataChunk::empty(Schema::new(vec![
            ("id", DataType::Bigint),
            ("name", DataType::Text),
        ]));
        for (id, name) in rows {
            chunk.push_row(vec![Value::Integer(*id), Value::Text(name.to_string())]);
        }
        chunk
    }

    fn connector(store: &MemoryStore) -> MemoryConnector {
        MemoryConnector::configure(&serde_json::json!({"table_name": "t"}), store.clone()).unwrap()
    }

    #[test]
    fn replace_and_read_back() {
        let store = MemoryStore::new();
        let mut conn = connector(&store);

        conn.write(&[chunk(&[(1, "a")])], LoadMode::Replace, &[]).unwrap();
        conn.write(&[chunk(&[(2, "b")])], LoadMode::Replace, &[]).unwrap();

        let chunks = conn.read(&ReadOptions::default()).unwrap();
        assert_eq!(chunks[0].row_count(), 1);
        assert_eq!(chunks[0].columns[0][0], Value::Integer(2));
    }

    #[test]
    fn append_concatenates() {
        let store = MemoryStore::new();
        let mut conn = connector(&store);

        conn.write(&[chunk(&[(1, "a")])], LoadMode::Replace, &[]).unwrap();
        conn.write(&[chunk(&[(2, "b")])], LoadMode::Append, &[]).unwrap();

        assert_eq!(store.get("t").unwrap().row_count(), 2);
    }

    #[test]
    fn merge_upserts_on_keys() {
        let store = MemoryStore::new();
        let mut conn = connector(&store);
        let keys = vec!["id".to_string()];

        conn.write(&[chunk(&[(1, "a"), (2, "b")])], LoadMode::Replace, &[])
            .unwrap();
        conn.write(&[chunk(&[(2, "B"), (3, "c")])], LoadMode::Merge, &keys)
            .unwrap();

        let table = store.get("t").unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.columns[1][1], Value::Text("B".to_string()));
        assert_eq!(table.columns[0][2], Value::Integer(3));
    }

    #[test]
    fn stores_are_isolated() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        connector(&a)
            .write(&[chunk(&[(1, "a")])], LoadMode::Replace, &[])
            .unwrap();

        assert!(a.get("t").is_some());
        assert!(b.get("t").is_none());
    }

    #[test]
    fn missing_table_is_a_config_error() {
        let store = MemoryStore::new();
        let err = connector(&store).read(&ReadOptions::default()).unwrap_err();
        assert!(matches!(err.reason, Reason::ConnectorConfig { .. }));
    }
}
