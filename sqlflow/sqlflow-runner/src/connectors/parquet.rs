//! Parquet file connector, converting between Arrow record batches and
//! engine chunks.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::reader::ChunkReader;
use sqlflow::ast::LoadMode;
use sqlflow::{Error, Reason};

use crate::data::{
    date_from_epoch_days, epoch_days, timestamp_from_micros, timestamp_micros, Column, DataChunk,
    DataType, Schema, Value,
};
use crate::resilience::{CancelToken, Resilience, ResilienceConfig};

use super::{
    config_err, optional_bool, optional_u64, required_str, Connector, ConnectorKind, Destination,
    ReadOptions, Source, TestStatus, WriteResult,
};

pub struct ParquetConnector {
    path: PathBuf,
    columns: Option<Vec<String>>,
    combine_files: bool,
    batch_size: Option<usize>,
    resilience: Resilience,
}

impl ParquetConnector {
    pub fn configure(
        params: &serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<ParquetConnector, Error> {
        let columns = params.get("columns").and_then(|v| v.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        Ok(ParquetConnector {
            path: PathBuf::from(required_str(params, "path", "parquet")?),
            columns,
            combine_files: optional_bool(params, "combine_files", true),
            batch_size: optional_u64(params, "batch_size").map(|v| v as usize),
            resilience: Resilience::new(ResilienceConfig::from_params(params), cancel.clone()),
        })
    }

    /// One file, or every `*.parquet` under a directory when combining.
    fn input_files(&self) -> Result<Vec<PathBuf>, Error> {
        if !self.path.is_dir() {
            return Ok(vec![self.path.clone()]);
        }
        if !self.combine_files {
            return Err(config_err(
                "parquet",
                format!("{} is a directory; set `combine_files`", self.path.display()),
            ));
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.path)
            .map_err(|e| config_err("parquet", e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(config_err(
                "parquet",
                format!("no parquet files under {}", self.path.display()),
            ));
        }
        Ok(files)
    }
}

impl Connector for ParquetConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Parquet
    }

    fn test_connection(&mut self) -> TestStatus {
        match self.input_files() {
            Ok(files) => TestStatus {
                ok: true,
                message: format!("{} file(s)", files.len()),
            },
            Err(e) => TestStatus {
                ok: false,
                message: e.reason.to_string(),
            },
        }
    }
}

impl Source for ParquetConnector {
    fn describe(&mut self) -> Result<Schema, Error> {
        let file = File::open(&self.input_files()?[0]).map_err(|e| config_err("parquet", e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;
        schema_from_arrow(builder.schema())
    }

    fn read(&mut self, options: &ReadOptions) -> Result<Vec<DataChunk>, Error> {
        let files = self.input_files()?;
        let batch_size = self.batch_size.unwrap_or(options.batch_size);
        let columns = self.columns.clone();

        self.resilience
            .call(&format!("parquet:{}", self.path.display()), || {
                let mut chunks = Vec::new();
                for path in &files {
                    let file = File::open(path).map_err(|e| config_err("parquet", e))?;
                    chunks.extend(decode_parquet(file, batch_size)?);
                }
                if let Some(columns) = &columns {
                    for chunk in &mut chunks {
                        project_columns(chunk, columns)?;
                    }
                }
                Ok(chunks)
            })
    }
}

impl Destination for ParquetConnector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        mode: LoadMode,
        _merge_keys: &[String],
    ) -> Result<WriteResult, Error> {
        if mode != LoadMode::Replace {
            return Err(config_err(
                "parquet",
                "parquet destinations only support REPLACE writes",
            ));
        }
        let path = self.path.clone();

        self.resilience
            .call(&format!("parquet:{}", path.display()), || {
                let file = File::create(&path).map_err(|e| config_err("parquet", e))?;
                let rows_written = encode_parquet(file, chunks)?;
                Ok(WriteResult { rows_written })
            })
    }
}

pub(crate) fn decode_parquet(
    reader: impl ChunkReader + 'static,
    batch_size: usize,
) -> Result<Vec<DataChunk>, Error> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(reader)
        .map_err(parquet_err)?
        .with_batch_size(batch_size)
        .build()
        .map_err(parquet_err)?;

    let mut chunks = Vec::new();
    for batch in reader {
        let batch = batch.map_err(arrow_err)?;
        chunks.push(batch_to_chunk(&batch)?);
    }
    Ok(chunks)
}

pub(crate) fn encode_parquet(
    writer: impl std::io::Write + Send,
    chunks: &[DataChunk],
) -> Result<u64, Error> {
    let schema = match chunks.first() {
        Some(chunk) => arrow_schema(&chunk.schema),
        None => Arc::new(ArrowSchema::empty()),
    };

    let mut parquet_writer =
        ArrowWriter::try_new(writer, schema.clone(), None).map_err(parquet_err)?;
    let mut rows_written = 0u64;

    for chunk in chunks {
        let batch = chunk_to_batch(chunk, schema.clone())?;
        parquet_writer.write(&batch).map_err(parquet_err)?;
        rows_written += chunk.row_count() as u64;
    }
    parquet_writer.close().map_err(parquet_err)?;
    Ok(rows_written)
}

fn project_columns(chunk: &mut DataChunk, keep: &[String]) -> Result<(), Error> {
    let mut indices = Vec::with_capacity(keep.len());
    for name in keep {
        let index = chunk
            .schema
            .columns
            .iter()
            .position(|c| &c.name == name)
            .ok_or_else(|| config_err("parquet", format!("no column `{name}` in file")))?;
        indices.push(index);
    }
    chunk.schema.columns = indices
        .iter()
        .map(|&i| chunk.schema.columns[i].clone())
        .collect();
    chunk.columns = indices.iter().map(|&i| chunk.columns[i].clone()).collect();
    Ok(())
}

fn arrow_type(dt: DataType) -> ArrowType {
    match dt {
        DataType::Boolean => ArrowType::Boolean,
        DataType::Integer | DataType::Bigint => ArrowType::Int64,
        DataType::Double | DataType::Decimal => ArrowType::Float64,
        DataType::Date => ArrowType::Date32,
        DataType::Timestamp => ArrowType::Timestamp(TimeUnit::Microsecond, None),
        DataType::Text => ArrowType::Utf8,
    }
}

fn arrow_schema(schema: &Schema) -> Arc<ArrowSchema> {
    let fields: Vec<Field> = schema
        .columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.data_type), true))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn schema_from_arrow(schema: &ArrowSchema) -> Result<Schema, Error> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| Column {
            name: field.name().clone(),
            data_type: data_type_from_arrow(field.data_type()),
        })
        .collect();
    Ok(Schema { columns })
}

fn data_type_from_arrow(at: &ArrowType) -> DataType {
    match at {
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int8 | ArrowType::Int16 | ArrowType::Int32 => DataType::Integer,
        ArrowType::UInt8 | ArrowType::UInt16 | ArrowType::UInt32 => DataType::Integer,
        ArrowType::Int64 | ArrowType::UInt64 => DataType::Bigint,
        ArrowType::Float16 | ArrowType::Float32 | ArrowType::Float64 => DataType::Double,
        ArrowType::Decimal128(..) | ArrowType::Decimal256(..) => DataType::Decimal,
        ArrowType::Date32 | ArrowType::Date64 => DataType::Date,
        ArrowType::Timestamp(..) => DataType::Timestamp,
        _ => DataType::Text,
    }
}

/// Canonical arrow type each family is cast to before extraction.
fn canonical_arrow_type(at: &ArrowType) -> ArrowType {
    arrow_type(data_type_from_arrow(at))
}

fn batch_to_chunk(batch: &RecordBatch) -> Result<DataChunk, Error> {
    let mut columns = Vec::with_capacity(batch.num_columns());
    let mut values = Vec::with_capacity(batch.num_columns());

    for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
        let data_type = data_type_from_arrow(field.data_type());
        columns.push(Column {
            name: field.name().clone(),
            data_type,
        });

        let canonical = canonical_arrow_type(field.data_type());
        let array = arrow::compute::cast(array, &canonical).map_err(arrow_err)?;
        values.push(array_to_values(&array, data_type)?);
    }

    Ok(DataChunk {
        schema: Schema { columns },
        columns: values,
    })
}

fn array_to_values(array: &ArrayRef, data_type: DataType) -> Result<Vec<Value>, Error> {
    let mut out = Vec::with_capacity(array.len());

    macro_rules! extract {
        ($array_ty:ty, $make:expr) => {{
            let typed = array
                .as_any()
                .downcast_ref::<$array_ty>()
                .ok_or_else(|| config_err("parquet", "unexpected array layout"))?;
            for i in 0..typed.len() {
                if typed.is_null(i) {
                    out.push(Value::Null);
                } else {
                    out.push($make(typed.value(i))?);
                }
            }
        }};
    }

    let ok_date = |days: i32| {
        date_from_epoch_days(days)
            .map(Value::Date)
            .ok_or_else(|| config_err("parquet", format!("date out of range: {days}")))
    };
    let ok_timestamp = |micros: i64| {
        timestamp_from_micros(micros)
            .map(Value::Timestamp)
            .ok_or_else(|| config_err("parquet", format!("timestamp out of range: {micros}")))
    };

    match data_type {
        DataType::Boolean => extract!(BooleanArray, |v: bool| Ok::<_, Error>(Value::Boolean(v))),
        DataType::Integer | DataType::Bigint => {
            extract!(Int64Array, |v: i64| Ok::<_, Error>(Value::Integer(v)))
        }
        DataType::Double | DataType::Decimal => {
            extract!(Float64Array, |v: f64| Ok::<_, Error>(Value::Double(v)))
        }
        DataType::Date => extract!(Date32Array, ok_date),
        DataType::Timestamp => extract!(TimestampMicrosecondArray, ok_timestamp),
        DataType::Text => {
            extract!(StringArray, |v: &str| Ok::<_, Error>(Value::Text(
                v.to_string()
            )))
        }
    }

    Ok(out)
}

fn chunk_to_batch(chunk: &DataChunk, schema: Arc<ArrowSchema>) -> Result<RecordBatch, Error> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(chunk.columns.len());

    for (column, values) in chunk.schema.columns.iter().zip(&chunk.columns) {
        let array: ArrayRef = match column.data_type {
            DataType::Boolean => Arc::new(BooleanArray::from(
                values.iter().map(value_as_bool).collect::<Vec<_>>(),
            )),
            DataType::Integer | DataType::Bigint => Arc::new(Int64Array::from(
                values.iter().map(value_as_i64).collect::<Vec<_>>(),
            )),
            DataType::Double | DataType::Decimal => Arc::new(Float64Array::from(
                values.iter().map(value_as_f64).collect::<Vec<_>>(),
            )),
            DataType::Date => Arc::new(Date32Array::from(
                values.iter().map(value_as_days).collect::<Vec<_>>(),
            )),
            DataType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
                values.iter().map(value_as_micros).collect::<Vec<_>>(),
            )),
            DataType::Text => Arc::new(StringArray::from(
                values.iter().map(value_as_text).collect::<Vec<_>>(),
            )),
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays).map_err(arrow_err)
}

fn value_as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Boolean(b) => Some(*b),
        _ => None,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(*i),
        _ => None,
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Double(f) => Some(*f),
        Value::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

fn value_as_days(v: &Value) -> Option<i32> {
    match v {
        Value::Date(d) => Some(epoch_days(*d)),
        _ => None,
    }
}

fn value_as_micros(v: &Value) -> Option<i64> {
    match v {
        Value::Timestamp(ts) => Some(timestamp_micros(*ts)),
        Value::Date(d) => Some(timestamp_micros(d.and_hms_opt(0, 0, 0)?)),
        _ => None,
    }
}

fn value_as_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        other => Some(other.render()),
    }
}

fn parquet_err(e: parquet::errors::ParquetError) -> Error {
    Error::new(Reason::ConnectionFailed {
        details: format!("parquet: {e}"),
    })
}

fn arrow_err(e: arrow::error::ArrowError) -> Error {
    Error::new(Reason::ConnectionFailed {
        details: format!("arrow: {e}"),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn sample_chunk() -> DataChunk {
        let mut chunk = DataChunk::empty(Schema::new(vec![
            ("id", DataType::Bigint),
            ("score", DataType::Double),
            ("name", DataType::Text),
            ("day", DataType::Date),
        ]));
        chunk.push_row(vec![
            Value::Integer(1),
            Value::Double(9.5),
            Value::Text("ada".to_string()),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
        ]);
        chunk.push_row(vec![Value::Integer(2), Value::Null, Value::Null, Value::Null]);
        chunk
    }

    #[test]
    fn encode_then_decode_preserves_values() {
        let chunk = sample_chunk();
        let mut buffer = Vec::new();
        let written = encode_parquet(&mut buffer, std::slice::from_ref(&chunk)).unwrap();
        assert_eq!(written, 2);

        let chunks = decode_parquet(bytes::Bytes::from(buffer), 1024).unwrap();
        assert_eq!(chunks.len(), 1);
        let decoded = &chunks[0];
        assert_eq!(decoded.schema.names(), vec!["id", "score", "name", "day"]);
        assert_eq!(decoded.columns[0][0], Value::Integer(1));
        assert_eq!(decoded.columns[1][1], Value::Null);
        assert_eq!(
            decoded.columns[3][0],
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
    }

    #[test]
    fn file_connector_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        let params = serde_json::json!({"path": path.to_str().unwrap()});
        let mut conn = ParquetConnector::configure(&params, &CancelToken::new()).unwrap();

        conn.write(&[sample_chunk()], LoadMode::Replace, &[]).unwrap();

        let schema = conn.describe().unwrap();
        assert_eq!(schema.columns[0].data_type, DataType::Bigint);

        let chunks = conn.read(&ReadOptions::default()).unwrap();
        assert_eq!(chunks[0].row_count(), 2);
    }

    #[test]
    fn column_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        {
            let params = serde_json::json!({"path": path.to_str().unwrap()});
            let mut conn = ParquetConnector::configure(&params, &CancelToken::new()).unwrap();
            conn.write(&[sample_chunk()], LoadMode::Replace, &[]).unwrap();
        }

        let params = serde_json::json!({
            "path": path.to_str().unwrap(),
            "columns": ["name", "id"],
        });
        let mut conn = ParquetConnector::configure(&params, &CancelToken::new()).unwrap();
        let chunks = conn.read(&ReadOptions::default()).unwrap();
        assert_eq!(chunks[0].schema.names(), vec!["name", "id"]);
    }
}
