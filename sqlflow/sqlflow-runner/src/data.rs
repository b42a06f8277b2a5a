//! Columnar batches exchanged between connectors and the engine.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Logical column types. Engine- and connector-specific type names are
/// normalised into these before any compatibility decision.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Integer,
    Bigint,
    Double,
    Decimal,
    Date,
    Timestamp,
    Text,
}

impl DataType {
    /// The widening lattice: integer → bigint → {double, decimal},
    /// date → timestamp, anything → text.
    pub fn widens_to(self, target: DataType) -> bool {
        use DataType::*;
        self == target
            || target == Text
            || matches!(
                (self, target),
                (Integer, Bigint)
                    | (Integer, Double)
                    | (Integer, Decimal)
                    | (Bigint, Double)
                    | (Bigint, Decimal)
                    | (Date, Timestamp)
            )
    }

    /// Column declaration for `CREATE TABLE`.
    pub fn sql_decl(self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Integer => "INTEGER",
            DataType::Bigint => "BIGINT",
            DataType::Double => "DOUBLE",
            DataType::Decimal => "DECIMAL(18,3)",
            DataType::Date => "DATE",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Text => "VARCHAR",
        }
    }

    /// Normalise an engine/driver type name (`BIGINT`, `timestamp with time
    /// zone`, `NUMERIC(10,2)`, …).
    pub fn from_engine_decl(decl: &str) -> DataType {
        let decl = decl.to_ascii_uppercase();
        if decl.contains("BOOL") {
            DataType::Boolean
        } else if decl.contains("BIGINT") || decl.contains("HUGEINT") || decl.contains("INT8") {
            DataType::Bigint
        } else if decl.contains("INT") {
            DataType::Integer
        } else if decl.contains("DECIMAL") || decl.contains("NUMERIC") {
            DataType::Decimal
        } else if decl.contains("DOUBLE") || decl.contains("FLOAT") || decl.contains("REAL") {
            DataType::Double
        } else if decl.contains("TIMESTAMP") || decl.contains("DATETIME") {
            DataType::Timestamp
        } else if decl.contains("DATE") {
            DataType::Date
        } else {
            DataType::Text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new<S: Into<String>>(columns: Vec<(S, DataType)>) -> Schema {
        Schema {
            columns: columns
                .into_iter()
                .map(|(name, data_type)| Column {
                    name: name.into(),
                    data_type,
                })
                .collect(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Bigint),
            Value::Double(_) => Some(DataType::Double),
            Value::Text(_) => Some(DataType::Text),
            Value::Date(_) => Some(DataType::Date),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// Text rendering, as written to CSV output.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Double(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Date(d) => d.to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        }
    }

    /// Parse a text cell, most specific type first.
    pub fn parse(text: &str) -> Value {
        if text.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = text.parse::<i64>() {
            return Value::Integer(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            return Value::Double(f);
        }
        match text {
            "true" | "TRUE" | "True" => return Value::Boolean(true),
            "false" | "FALSE" | "False" => return Value::Boolean(false),
            _ => {}
        }
        Value::Text(text.to_string())
    }
}

/// Days since 1970-01-01, the encoding both DuckDB and Arrow use for dates.
pub(crate) fn date_from_epoch_days(days: i32) -> Option<NaiveDate> {
    // chrono counts from 0001-01-01; 1970-01-01 is day 719163
    NaiveDate::from_num_days_from_ce_opt(days + 719_163)
}

pub(crate) fn epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - 719_163
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

pub(crate) fn timestamp_micros(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

/// A columnar batch with a schema header. `columns[i]` holds the values of
/// `schema.columns[i]`, all of equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    pub schema: Schema,
    pub columns: Vec<Vec<Value>>,
}

impl DataChunk {
    pub fn empty(schema: Schema) -> DataChunk {
        let columns = vec![Vec::new(); schema.columns.len()];
        DataChunk { schema, columns }
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
    }

    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c[index].clone()).collect()
    }

    /// Unify the declared schema with the values actually present, so text
    /// sources end up with usable column types.
    pub fn infer_types(&mut self) {
        for (i, column) in self.columns.iter().enumerate() {
            let mut inferred: Option<DataType> = None;
            for value in column {
                let Some(dt) = value.data_type() else {
                    continue;
                };
                inferred = Some(match inferred {
                    None => dt,
                    Some(prev) if prev == dt => prev,
                    Some(prev) if prev.widens_to(dt) => dt,
                    Some(prev) if dt.widens_to(prev) => prev,
                    Some(_) => DataType::Text,
                });
            }
            if let Some(dt) = inferred {
                self.schema.columns[i].data_type = dt;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn widening_follows_the_promotion_table() {
        assert!(DataType::Integer.widens_to(DataType::Bigint));
        assert!(DataType::Integer.widens_to(DataType::Decimal));
        assert!(DataType::Bigint.widens_to(DataType::Double));
        assert!(DataType::Date.widens_to(DataType::Timestamp));
        assert!(DataType::Boolean.widens_to(DataType::Text));
        assert!(DataType::Integer.widens_to(DataType::Integer));

        assert!(!DataType::Bigint.widens_to(DataType::Integer));
        assert!(!DataType::Timestamp.widens_to(DataType::Date));
        assert!(!DataType::Text.widens_to(DataType::Integer));
        assert!(!DataType::Double.widens_to(DataType::Decimal));
    }

    #[test]
    fn engine_decl_normalisation() {
        assert_eq!(DataType::from_engine_decl("BIGINT"), DataType::Bigint);
        assert_eq!(DataType::from_engine_decl("INTEGER"), DataType::Integer);
        assert_eq!(DataType::from_engine_decl("NUMERIC(10,2)"), DataType::Decimal);
        assert_eq!(
            DataType::from_engine_decl("timestamp with time zone"),
            DataType::Timestamp
        );
        assert_eq!(DataType::from_engine_decl("DATE"), DataType::Date);
        assert_eq!(DataType::from_engine_decl("VARCHAR"), DataType::Text);
        assert_eq!(DataType::from_engine_decl("character varying"), DataType::Text);
    }

    #[test]
    fn value_parsing_prefers_specific_types() {
        assert_eq!(Value::parse(""), Value::Null);
        assert_eq!(Value::parse("42"), Value::Integer(42));
        assert_eq!(Value::parse("4.5"), Value::Double(4.5));
        assert_eq!(Value::parse("true"), Value::Boolean(true));
        assert_eq!(Value::parse("US"), Value::Text("US".to_string()));
    }

    #[test]
    fn chunk_type_inference_unifies_columns() {
        let mut chunk = DataChunk::empty(Schema::new(vec![
            ("a", DataType::Text),
            ("b", DataType::Text),
        ]));
        chunk.push_row(vec![Value::Integer(1), Value::Text("x".to_string())]);
        chunk.push_row(vec![Value::Double(1.5), Value::Null]);
        chunk.infer_types();

        assert_eq!(chunk.schema.columns[0].data_type, DataType::Double);
        assert_eq!(chunk.schema.columns[1].data_type, DataType::Text);
    }
}
