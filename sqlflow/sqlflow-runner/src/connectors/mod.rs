//! The connector framework: polymorphic sources and destinations behind the
//! resilience wrapper.

pub mod csv;
pub mod memory;
pub mod parquet;
pub mod postgres;
pub mod rest;
pub mod s3;

use sqlflow::ast::LoadMode;
use sqlflow::{Error, Reason, WithErrorInfo};

use crate::data::{DataChunk, Schema, Value};
use crate::resilience::CancelToken;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConnectorKind {
    Csv,
    Parquet,
    Postgres,
    S3,
    Rest,
    #[strum(serialize = "memory", serialize = "inmemory")]
    Memory,
}

#[derive(Debug, Clone)]
pub struct TestStatus {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub batch_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions { batch_size: 8192 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteResult {
    pub rows_written: u64,
}

pub trait Connector {
    fn kind(&self) -> ConnectorKind;

    fn test_connection(&mut self) -> TestStatus;
}

pub trait Source: Connector {
    fn describe(&mut self) -> Result<Schema, Error>;

    fn read(&mut self, options: &ReadOptions) -> Result<Vec<DataChunk>, Error>;

    /// Rows with `cursor_field > cursor_value`. Optional capability; the
    /// executor supplies the last-seen watermark.
    fn read_incremental(
        &mut self,
        cursor_field: &str,
        cursor_value: &Value,
        options: &ReadOptions,
    ) -> Result<Vec<DataChunk>, Error> {
        let _ = (cursor_field, cursor_value, options);
        Err(Error::new(Reason::ConnectorConfig {
            connector: self.kind().to_string(),
            details: "incremental reads are not supported by this connector".to_string(),
        }))
    }
}

pub trait Destination: Connector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        mode: LoadMode,
        merge_keys: &[String],
    ) -> Result<WriteResult, Error>;
}

/// Builds connector instances from `{type, params}` pairs. Holds the
/// process-wide in-memory store so tests can instantiate their own.
pub struct ConnectorFactory {
    memory: MemoryStore,
    cancel: CancelToken,
}

impl ConnectorFactory {
    pub fn new(memory: MemoryStore, cancel: CancelToken) -> ConnectorFactory {
        ConnectorFactory { memory, cancel }
    }

    pub fn source(
        &self,
        type_tag: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn Source>, Error> {
        Ok(match parse_kind(type_tag)? {
            ConnectorKind::Csv => Box::new(csv::CsvConnector::configure(params, &self.cancel)?),
            ConnectorKind::Parquet => {
                Box::new(parquet::ParquetConnector::configure(params, &self.cancel)?)
            }
            ConnectorKind::Postgres => {
                Box::new(postgres::PostgresConnector::configure(params, &self.cancel)?)
            }
            ConnectorKind::S3 => Box::new(s3::S3Connector::configure(params, &self.cancel)?),
            ConnectorKind::Rest => Box::new(rest::RestConnector::configure(params, &self.cancel)?),
            ConnectorKind::Memory => Box::new(memory::MemoryConnector::configure(
                params,
                self.memory.clone(),
            )?),
        })
    }

    /// Destination for an `EXPORT`: the URI names the file/table/endpoint,
    /// OPTIONS supply the rest.
    pub fn destination(
        &self,
        type_tag: &str,
        uri: &str,
        options: &serde_json::Value,
    ) -> Result<Box<dyn Destination>, Error> {
        let kind = parse_kind(type_tag)?;
        let mut params = match options {
            serde_json::Value::Object(members) => members.clone(),
            _ => serde_json::Map::new(),
        };

        let uri_key = match kind {
            ConnectorKind::Csv | ConnectorKind::Parquet => "path",
            ConnectorKind::S3 => {
                // `s3://bucket/key` expands into both params
                let (bucket, key) = s3::parse_s3_uri(uri)?;
                params.insert("bucket".to_string(), serde_json::Value::String(bucket));
                params.insert("key".to_string(), serde_json::Value::String(key));
                let params = serde_json::Value::Object(params);
                return Ok(Box::new(s3::S3Connector::configure(&params, &self.cancel)?));
            }
            ConnectorKind::Rest => "url",
            ConnectorKind::Postgres => "table",
            ConnectorKind::Memory => "table_name",
        };
        params
            .entry(uri_key.to_string())
            .or_insert_with(|| serde_json::Value::String(uri.to_string()));
        let params = serde_json::Value::Object(params);

        Ok(match kind {
            ConnectorKind::Csv => Box::new(csv::CsvConnector::configure(&params, &self.cancel)?),
            ConnectorKind::Parquet => {
                Box::new(parquet::ParquetConnector::configure(&params, &self.cancel)?)
            }
            ConnectorKind::Postgres => {
                Box::new(postgres::PostgresConnector::configure(&params, &self.cancel)?)
            }
            ConnectorKind::Rest => Box::new(rest::RestConnector::configure(&params, &self.cancel)?),
            ConnectorKind::Memory => Box::new(memory::MemoryConnector::configure(
                &params,
                self.memory.clone(),
            )?),
            ConnectorKind::S3 => unreachable!("handled above"),
        })
    }

    pub fn memory_store(&self) -> &MemoryStore {
        &self.memory
    }
}

fn parse_kind(type_tag: &str) -> Result<ConnectorKind, Error> {
    type_tag.parse::<ConnectorKind>().map_err(|_| {
        Error::new(Reason::ConnectorConfig {
            connector: type_tag.to_string(),
            details: "unknown connector type".to_string(),
        })
        .push_hint("known types: csv, parquet, postgres, s3, rest, memory")
    })
}

pub(crate) fn config_err(connector: &str, details: impl ToString) -> Error {
    Error::new(Reason::ConnectorConfig {
        connector: connector.to_string(),
        details: details.to_string(),
    })
}

pub(crate) fn required_str(
    params: &serde_json::Value,
    key: &str,
    connector: &str,
) -> Result<String, Error> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| config_err(connector, format!("missing required param `{key}`")))
}

pub(crate) fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

pub(crate) fn optional_bool(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub(crate) fn optional_u64(params: &serde_json::Value, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connector_kinds_parse_case_insensitively() {
        assert_eq!("CSV".parse::<ConnectorKind>().unwrap(), ConnectorKind::Csv);
        assert_eq!("csv".parse::<ConnectorKind>().unwrap(), ConnectorKind::Csv);
        assert_eq!(
            "Postgres".parse::<ConnectorKind>().unwrap(),
            ConnectorKind::Postgres
        );
        assert_eq!("S3".parse::<ConnectorKind>().unwrap(), ConnectorKind::S3);
        assert_eq!(
            "inmemory".parse::<ConnectorKind>().unwrap(),
            ConnectorKind::Memory
        );
        assert!("carrier-pigeon".parse::<ConnectorKind>().is_err());
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let factory = ConnectorFactory::new(MemoryStore::new(), CancelToken::new());
        let err = factory
            .source("carrier-pigeon", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err.reason, Reason::ConnectorConfig { .. }));
    }
}
