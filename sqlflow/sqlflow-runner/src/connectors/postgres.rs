//! PostgreSQL connector over the synchronous `postgres` client.
//!
//! Values cross the wire as text parameters with explicit casts generated
//! from the table schema, so nothing is ever interpolated into SQL.

use postgres::{Client, NoTls};
use sqlflow::ast::LoadMode;
use sqlflow::safety::{build_where_eq, quote_identifier, quote_schema_table, validate_identifier};
use sqlflow::{Error, Reason};

use crate::data::{Column, DataChunk, DataType, Schema, Value};
use crate::resilience::{CancelToken, Resilience, ResilienceConfig};

use super::{
    config_err, optional_str, optional_u64, required_str, Connector, ConnectorKind, Destination,
    ReadOptions, Source, TestStatus, WriteResult,
};

pub struct PostgresConnector {
    host: String,
    port: u16,
    dbname: String,
    user: String,
    password: String,
    table: Option<String>,
    query: Option<String>,
    schema_name: Option<String>,
    client: Option<Client>,
    resilience: Resilience,
}

impl PostgresConnector {
    pub fn configure(
        params: &serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<PostgresConnector, Error> {
        let table = optional_str(params, "table");
        let query = optional_str(params, "query");
        if table.is_none() && query.is_none() {
            return Err(config_err("postgres", "one of `table` or `query` is required"));
        }
        if let Some(table) = &table {
            validate_identifier(table)?;
        }
        let schema_name = optional_str(params, "schema");
        if let Some(schema) = &schema_name {
            validate_identifier(schema)?;
        }

        Ok(PostgresConnector {
            host: required_str(params, "host", "postgres")?,
            port: optional_u64(params, "port").unwrap_or(5432) as u16,
            dbname: required_str(params, "dbname", "postgres")?,
            user: required_str(params, "user", "postgres")?,
            password: optional_str(params, "password").unwrap_or_default(),
            table,
            query,
            schema_name,
            client: None,
            resilience: Resilience::new(ResilienceConfig::from_params(params), cancel.clone()),
        })
    }

    fn endpoint(&self) -> String {
        format!("postgres:{}:{}/{}", self.host, self.port, self.dbname)
    }

    fn connect(&mut self) -> Result<&mut Client, Error> {
        if self.client.is_none() {
            let mut config = postgres::Config::new();
            config
                .host(&self.host)
                .port(self.port)
                .dbname(&self.dbname)
                .user(&self.user)
                .password(&self.password)
                .connect_timeout(self.resilience.config().request_timeout);

            let client = config.connect(NoTls).map_err(classify_pg_error)?;
            self.client = Some(client);
        }
        Ok(self.client.as_mut().unwrap())
    }

    fn drop_connection(&mut self) {
        self.client = None;
    }

    fn qualified_table(&self) -> Result<String, Error> {
        let table = self
            .table
            .as_deref()
            .ok_or_else(|| config_err("postgres", "this operation requires a `table` param"))?;
        Ok(quote_schema_table(self.schema_name.as_deref(), table))
    }

    fn select_sql(&self) -> Result<String, Error> {
        match (&self.query, &self.table) {
            (Some(query), _) => Ok(query.clone()),
            (None, Some(_)) => Ok(format!("SELECT * FROM {}", self.qualified_table()?)),
            (None, None) => Err(config_err("postgres", "nothing to read")),
        }
    }

    fn fetch(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        batch_size: usize,
    ) -> Result<Vec<DataChunk>, Error> {
        let client = self.connect()?;
        let rows = client.query(sql, params).map_err(classify_pg_error)?;

        let mut chunks = Vec::new();
        let mut current: Option<DataChunk> = None;

        for row in &rows {
            let chunk = current.get_or_insert_with(|| {
                DataChunk::empty(Schema {
                    columns: row
                        .columns()
                        .iter()
                        .map(|c| Column {
                            name: c.name().to_string(),
                            data_type: pg_data_type(c.type_()),
                        })
                        .collect(),
                })
            });

            let mut values = Vec::with_capacity(row.len());
            for (i, column) in row.columns().iter().enumerate() {
                values.push(pg_value(row, i, column.type_())?);
            }
            chunk.push_row(values);

            if chunk.row_count() >= batch_size {
                chunks.push(current.take().unwrap());
            }
        }
        if let Some(chunk) = current {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

impl Connector for PostgresConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Postgres
    }

    fn test_connection(&mut self) -> TestStatus {
        let probe = (|| -> Result<(), Error> {
            let client = self.connect()?;
            client
                .simple_query("SELECT 1")
                .map_err(classify_pg_error)?;
            Ok(())
        })();
        match probe {
            Ok(()) => TestStatus {
                ok: true,
                message: format!("connected to {}", self.endpoint()),
            },
            Err(e) => TestStatus {
                ok: false,
                message: e.reason.to_string(),
            },
        }
    }
}

impl Source for PostgresConnector {
    fn describe(&mut self) -> Result<Schema, Error> {
        let table = self
            .table
            .clone()
            .ok_or_else(|| config_err("postgres", "`describe` requires a `table` param"))?;
        let schema_name = self.schema_name.clone().unwrap_or_else(|| "public".to_string());

        let sql = "SELECT column_name, data_type FROM information_schema.columns \
                   WHERE table_name = $1 AND table_schema = $2 ORDER BY ordinal_position";

        let client = self.connect()?;
        let rows = client
            .query(sql, &[&table, &schema_name])
            .map_err(classify_pg_error)?;
        if rows.is_empty() {
            return Err(config_err(
                "postgres",
                format!("table `{schema_name}.{table}` does not exist"),
            ));
        }

        Ok(Schema {
            columns: rows
                .iter()
                .map(|row| Column {
                    name: row.get(0),
                    data_type: DataType::from_engine_decl(row.get::<_, String>(1).as_str()),
                })
                .collect(),
        })
    }

    fn read(&mut self, options: &ReadOptions) -> Result<Vec<DataChunk>, Error> {
        let sql = self.select_sql()?;
        let batch_size = options.batch_size;
        let endpoint = self.endpoint();

        with_recovery(self, &endpoint, move |conn| {
            conn.fetch(&sql, &[], batch_size)
        })
    }

    fn read_incremental(
        &mut self,
        cursor_field: &str,
        cursor_value: &Value,
        options: &ReadOptions,
    ) -> Result<Vec<DataChunk>, Error> {
        let table = self.qualified_table()?;
        let (fragment, param) = build_where_eq(cursor_field, ">", cursor_value.render())?;
        // the shared fragment uses `?`; postgres wants numbered placeholders
        let fragment = fragment.replace('?', &cast_placeholder(1, cursor_value));
        let sql = format!("SELECT * FROM {table} WHERE {fragment}");

        let batch_size = options.batch_size;
        let endpoint = self.endpoint();
        with_recovery(self, &endpoint, move |conn| {
            conn.fetch(&sql, &[&param], batch_size)
        })
    }
}

impl Destination for PostgresConnector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        mode: LoadMode,
        merge_keys: &[String],
    ) -> Result<WriteResult, Error> {
        let Some(first) = chunks.first() else {
            return Ok(WriteResult { rows_written: 0 });
        };
        let schema = first.schema.clone();
        let table = self.qualified_table()?;
        let endpoint = self.endpoint();

        if matches!(mode, LoadMode::Merge | LoadMode::Upsert) && merge_keys.is_empty() {
            return Err(config_err("postgres", "MERGE writes require merge keys"));
        }
        for key in merge_keys {
            validate_identifier(key)?;
            if schema.column(key).is_none() {
                return Err(Error::new(Reason::MissingMergeKey {
                    key: key.clone(),
                    table: "the incoming data".to_string(),
                }));
            }
        }

        let create_sql = create_table_sql(&table, &schema);
        let insert_sql = insert_sql(&table, &schema, mode, merge_keys);
        let chunks = chunks.to_vec();
        let mode_is_replace = mode == LoadMode::Replace;

        with_recovery(self, &endpoint, move |conn| {
            let client = conn.connect()?;
            let mut tx = client.transaction().map_err(classify_pg_error)?;

            tx.batch_execute(&create_sql).map_err(classify_pg_error)?;
            if mode_is_replace {
                tx.batch_execute(&format!("TRUNCATE TABLE {table}"))
                    .map_err(classify_pg_error)?;
            }

            let statement = tx.prepare(&insert_sql).map_err(classify_pg_error)?;
            let mut rows_written = 0u64;
            for chunk in &chunks {
                for i in 0..chunk.row_count() {
                    let row = chunk.row(i);
                    let params: Vec<Option<String>> = row
                        .iter()
                        .map(|v| match v {
                            Value::Null => None,
                            other => Some(other.render()),
                        })
                        .collect();
                    let params_refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
                        params.iter().map(|p| p as _).collect();
                    tx.execute(&statement, &params_refs)
                        .map_err(classify_pg_error)?;
                    rows_written += 1;
                }
            }

            tx.commit().map_err(classify_pg_error)?;
            Ok(WriteResult { rows_written })
        })
    }
}

/// Route a call through the resilience wrapper, tearing the connection down
/// when an attempt asks for a reconnect.
fn with_recovery<T>(
    conn: &mut PostgresConnector,
    endpoint: &str,
    mut op: impl FnMut(&mut PostgresConnector) -> Result<T, Error>,
) -> Result<T, Error> {
    // the resilience wrapper and the connection live in the same struct, so
    // move the wrapper out for the duration of the call
    let mut resilience = std::mem::replace(
        &mut conn.resilience,
        Resilience::new(ResilienceConfig::default(), CancelToken::new()),
    );
    let result = resilience.call_attempts(endpoint, |attempt| {
        if attempt.reconnect {
            conn.drop_connection();
        }
        op(conn)
    });
    conn.resilience = resilience;
    result
}

/// `$1` with a cast to the cursor value's wire type.
fn cast_placeholder(index: usize, value: &Value) -> String {
    let cast = match value.data_type() {
        Some(DataType::Bigint) | Some(DataType::Integer) => "BIGINT",
        Some(DataType::Double) => "DOUBLE PRECISION",
        Some(DataType::Date) => "DATE",
        Some(DataType::Timestamp) => "TIMESTAMP",
        Some(DataType::Boolean) => "BOOLEAN",
        _ => "TEXT",
    };
    format!("CAST(${index} AS {cast})")
}

fn pg_decl(dt: DataType) -> &'static str {
    match dt {
        DataType::Boolean => "BOOLEAN",
        DataType::Integer => "INTEGER",
        DataType::Bigint => "BIGINT",
        DataType::Double => "DOUBLE PRECISION",
        DataType::Decimal => "NUMERIC(18,3)",
        DataType::Date => "DATE",
        DataType::Timestamp => "TIMESTAMP",
        DataType::Text => "TEXT",
    }
}

fn create_table_sql(table: &str, schema: &Schema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_identifier(&c.name), pg_decl(c.data_type)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table} ({columns})")
}

/// Parameterised insert; MERGE becomes `ON CONFLICT … DO UPDATE` (the target
/// needs a unique constraint over the merge keys, as is usual for upserts).
fn insert_sql(table: &str, schema: &Schema, mode: LoadMode, merge_keys: &[String]) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = schema
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("CAST(${} AS {})", i + 1, pg_decl(c.data_type)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");

    if matches!(mode, LoadMode::Merge | LoadMode::Upsert) {
        let conflict_keys = merge_keys
            .iter()
            .map(|k| quote_identifier(k))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = schema
            .columns
            .iter()
            .filter(|c| !merge_keys.contains(&c.name))
            .map(|c| {
                format!(
                    "{col} = EXCLUDED.{col}",
                    col = quote_identifier(&c.name)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({conflict_keys}) DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({conflict_keys}) DO UPDATE SET {updates}"
            ));
        }
    }
    sql
}

fn pg_data_type(ty: &postgres::types::Type) -> DataType {
    use postgres::types::Type;
    match *ty {
        Type::BOOL => DataType::Boolean,
        Type::INT2 | Type::INT4 => DataType::Integer,
        Type::INT8 => DataType::Bigint,
        Type::FLOAT4 | Type::FLOAT8 => DataType::Double,
        Type::NUMERIC => DataType::Decimal,
        Type::DATE => DataType::Date,
        Type::TIMESTAMP | Type::TIMESTAMPTZ => DataType::Timestamp,
        _ => DataType::Text,
    }
}

fn pg_value(row: &postgres::Row, i: usize, ty: &postgres::types::Type) -> Result<Value, Error> {
    use postgres::types::Type;

    fn get<'a, T: postgres::types::FromSql<'a>>(
        row: &'a postgres::Row,
        i: usize,
    ) -> Result<Option<T>, Error> {
        row.try_get(i).map_err(|e| {
            Error::new(Reason::EngineInternal {
                details: format!("postgres decode: {e}"),
            })
        })
    }

    Ok(match *ty {
        Type::BOOL => get::<bool>(row, i)?.map_or(Value::Null, Value::Boolean),
        Type::INT2 => get::<i16>(row, i)?.map_or(Value::Null, |v| Value::Integer(v as i64)),
        Type::INT4 => get::<i32>(row, i)?.map_or(Value::Null, |v| Value::Integer(v as i64)),
        Type::INT8 => get::<i64>(row, i)?.map_or(Value::Null, Value::Integer),
        Type::FLOAT4 => get::<f32>(row, i)?.map_or(Value::Null, |v| Value::Double(v as f64)),
        Type::FLOAT8 => get::<f64>(row, i)?.map_or(Value::Null, Value::Double),
        Type::DATE => get::<chrono::NaiveDate>(row, i)?.map_or(Value::Null, Value::Date),
        Type::TIMESTAMP => {
            get::<chrono::NaiveDateTime>(row, i)?.map_or(Value::Null, Value::Timestamp)
        }
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, i)?
            .map_or(Value::Null, |v| Value::Timestamp(v.naive_utc())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            get::<String>(row, i)?.map_or(Value::Null, Value::Text)
        }
        ref other => {
            return Err(config_err(
                "postgres",
                format!("unsupported column type `{other}`; cast it in the query"),
            ))
        }
    })
}

fn classify_pg_error(e: postgres::Error) -> Error {
    let text = e.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("password") || lowered.contains("authentication") {
        Error::new(Reason::AuthFailed { details: text })
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        Error::new(Reason::Timeout { after_secs: 30 })
    } else if e.as_db_error().is_none() {
        // no server response: connection-level failure, worth a retry
        Error::new(Reason::ConnectionFailed { details: text })
    } else {
        Error::new(Reason::EngineInternal { details: text })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            ("id", DataType::Bigint),
            ("name", DataType::Text),
        ])
    }

    #[test]
    fn requires_table_or_query() {
        let err = PostgresConnector::configure(
            &serde_json::json!({"host": "db", "dbname": "x", "user": "u"}),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err.reason, Reason::ConnectorConfig { .. }));
    }

    #[test]
    fn rejects_malicious_table_names() {
        let err = PostgresConnector::configure(
            &serde_json::json!({
                "host": "db", "dbname": "x", "user": "u",
                "table": "users; DROP TABLE t",
            }),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err.reason, Reason::InvalidIdentifier { .. }));
    }

    #[test]
    fn insert_sql_parameterises_and_casts() {
        let sql = insert_sql("\"t\"", &schema(), LoadMode::Append, &[]);
        assert_eq!(
            sql,
            "INSERT INTO \"t\" (\"id\", \"name\") VALUES (CAST($1 AS BIGINT), CAST($2 AS TEXT))"
        );
    }

    #[test]
    fn merge_sql_upserts_on_conflict() {
        let sql = insert_sql("\"t\"", &schema(), LoadMode::Merge, &["id".to_string()]);
        assert!(sql.ends_with(
            "ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""
        ));
    }

    #[test]
    fn cursor_predicate_is_parameterised() {
        let (fragment, param) = build_where_eq("updated_at", ">", "2024-01-01").unwrap();
        assert_eq!(fragment, "\"updated_at\" > ?");
        assert_eq!(param, "2024-01-01");
        assert_eq!(
            cast_placeholder(1, &Value::Timestamp(chrono::NaiveDateTime::default())),
            "CAST($1 AS TIMESTAMP)"
        );
    }
}
