//! CSV file connector.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use sqlflow::ast::LoadMode;
use sqlflow::{Error, Reason};

use crate::data::{DataChunk, DataType, Schema, Value};
use crate::resilience::{CancelToken, Resilience, ResilienceConfig};

use super::{
    config_err, optional_bool, optional_str, required_str, Connector, ConnectorKind, Destination,
    ReadOptions, Source, TestStatus, WriteResult,
};

pub struct CsvConnector {
    path: PathBuf,
    has_header: bool,
    delimiter: u8,
    write_header: bool,
    resilience: Resilience,
}

impl CsvConnector {
    pub fn configure(params: &serde_json::Value, cancel: &CancelToken) -> Result<CsvConnector, Error> {
        let path = required_str(params, "path", "csv")?;
        let delimiter = optional_str(params, "delimiter").unwrap_or_else(|| ",".to_string());
        if delimiter.len() != 1 {
            return Err(config_err("csv", "`delimiter` must be a single character"));
        }

        Ok(CsvConnector {
            path: PathBuf::from(path),
            has_header: optional_bool(params, "has_header", true),
            delimiter: delimiter.as_bytes()[0],
            write_header: optional_bool(params, "header", true),
            resilience: Resilience::new(ResilienceConfig::from_params(params), cancel.clone()),
        })
    }

    fn endpoint(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

impl Connector for CsvConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Csv
    }

    fn test_connection(&mut self) -> TestStatus {
        match self.path.try_exists() {
            Ok(true) => TestStatus {
                ok: true,
                message: format!("{} is readable", self.path.display()),
            },
            Ok(false) => TestStatus {
                ok: false,
                message: format!("{} does not exist", self.path.display()),
            },
            Err(e) => TestStatus {
                ok: false,
                message: e.to_string(),
            },
        }
    }
}

impl Source for CsvConnector {
    fn describe(&mut self) -> Result<Schema, Error> {
        let chunks = self.read(&ReadOptions { batch_size: 128 })?;
        Ok(chunks
            .into_iter()
            .next()
            .map(|c| c.schema)
            .unwrap_or_default())
    }

    fn read(&mut self, options: &ReadOptions) -> Result<Vec<DataChunk>, Error> {
        let path = self.path.clone();
        let (has_header, delimiter) = (self.has_header, self.delimiter);
        let batch_size = options.batch_size;

        self.resilience.call(&self.endpoint(), || {
            let file = File::open(&path).map_err(|e| io_error(&path, e))?;
            decode_csv(file, has_header, delimiter, batch_size)
        })
    }
}

impl Destination for CsvConnector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        mode: LoadMode,
        _merge_keys: &[String],
    ) -> Result<WriteResult, Error> {
        let append = match mode {
            LoadMode::Replace => false,
            LoadMode::Append => true,
            LoadMode::Merge | LoadMode::Upsert => {
                return Err(config_err("csv", "CSV files do not support MERGE writes"))
            }
        };

        let path = self.path.clone();
        let (delimiter, write_header) = (self.delimiter, self.write_header);

        self.resilience.call(&self.endpoint(), || {
            let existing = append && path.try_exists().map_err(|e| io_error(&path, e))?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(existing)
                .truncate(!existing)
                .open(&path)
                .map_err(|e| io_error(&path, e))?;

            let rows_written =
                encode_csv(file, chunks, delimiter, write_header && !existing)?;
            Ok(WriteResult { rows_written })
        })
    }
}

/// Read CSV into typed chunks. Types are inferred per batch from the cell
/// values.
pub(crate) fn decode_csv(
    reader: impl Read,
    has_header: bool,
    delimiter: u8,
    batch_size: usize,
) -> Result<Vec<DataChunk>, Error> {
    let mut csv_reader = ::csv::ReaderBuilder::new()
        .has_headers(has_header)
        .delimiter(delimiter)
        .flexible(false)
        .from_reader(reader);

    let headers: Vec<String> = if has_header {
        csv_reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let mut chunks = Vec::new();
    let mut current: Option<DataChunk> = None;

    for record in csv_reader.records() {
        let record = record.map_err(csv_error)?;

        let chunk = current.get_or_insert_with(|| {
            let names: Vec<String> = if headers.is_empty() {
                (0..record.len()).map(|i| format!("column{i}")).collect()
            } else {
                headers.clone()
            };
            DataChunk::empty(Schema::new(
                names.into_iter().map(|n| (n, DataType::Text)).collect(),
            ))
        });

        chunk.push_row(record.iter().map(Value::parse).collect());

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

    // an empty but well-formed file still yields a schema
    if chunks.is_empty() && !headers.is_empty() {
        chunks.push(DataChunk::empty(Schema::new(
            headers.into_iter().map(|n| (n, DataType::Text)).collect(),
        )));
    }

    Ok(chunks)
}

pub(crate) fn encode_csv(
    writer: impl Write,
    chunks: &[DataChunk],
    delimiter: u8,
    write_header: bool,
) -> Result<u64, Error> {
    let mut csv_writer = ::csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(writer);

    let mut rows_written = 0u64;
    let mut header_pending = write_header;

    for chunk in chunks {
        if header_pending {
            csv_writer
                .write_record(chunk.schema.names())
                .map_err(csv_error)?;
            header_pending = false;
        }
        for i in 0..chunk.row_count() {
            let row: Vec<String> = chunk.row(i).iter().map(Value::render).collect();
            csv_writer.write_record(&row).map_err(csv_error)?;
            rows_written += 1;
        }
    }
    csv_writer.flush().map_err(|e| {
        Error::new(Reason::ConnectionFailed {
            details: e.to_string(),
        })
    })?;
    Ok(rows_written)
}

fn csv_error(e: ::csv::Error) -> Error {
    config_err("csv", format!("malformed csv: {e}"))
}

fn io_error(path: &std::path::Path, e: std::io::Error) -> Error {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => config_err(
            "csv",
            format!("{}: {e}", path.display()),
        ),
        _ => Error::new(Reason::ConnectionFailed {
            details: format!("{}: {e}", path.display()),
        }),
    }
}
