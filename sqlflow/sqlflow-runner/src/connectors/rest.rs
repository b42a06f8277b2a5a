//! REST connector: JSON over HTTP, one row per object.

use sqlflow::ast::LoadMode;
use sqlflow::{Error, Reason};

use crate::data::{DataChunk, DataType, Schema, Value};
use crate::resilience::{CancelToken, Resilience, ResilienceConfig};

use super::{
    config_err, optional_str, required_str, Connector, ConnectorKind, Destination, ReadOptions,
    Source, TestStatus, WriteResult,
};

pub struct RestConnector {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
    agent: ureq::Agent,
    resilience: Resilience,
}

impl RestConnector {
    pub fn configure(params: &serde_json::Value, cancel: &CancelToken) -> Result<RestConnector, Error> {
        let url = required_str(params, "url", "rest")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(config_err("rest", format!("`url` must be http(s): {url}")));
        }

        let headers = match params.get("headers") {
            None => Vec::new(),
            Some(serde_json::Value::Object(members)) => members
                .iter()
                .map(|(k, v)| {
                    let value = v
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| v.to_string());
                    (k.clone(), value)
                })
                .collect(),
            Some(_) => return Err(config_err("rest", "`headers` must be an object")),
        };

        let config = ResilienceConfig::from_params(params);
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();

        Ok(RestConnector {
            url,
            method: optional_str(params, "method").unwrap_or_else(|| "GET".to_string()),
            headers,
            body: optional_str(params, "body"),
            agent,
            resilience: Resilience::new(config, cancel.clone()),
        })
    }

    fn host(&self) -> String {
        self.url
            .split('/')
            .nth(2)
            .unwrap_or(&self.url)
            .to_string()
    }

    fn request(&self, method: &str) -> ureq::Request {
        let mut request = self.agent.request(method, &self.url);
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }
        request
    }

    fn fetch_rows(&mut self, batch_size: usize) -> Result<Vec<DataChunk>, Error> {
        let request = self.request(&self.method.clone());
        let body = self.body.clone();

        let payload = self.resilience.call(&format!("rest:{}", self.host()), || {
            let request = request.clone();
            let response = match &body {
                Some(body) => request.send_string(body),
                None => request.call(),
            }
            .map_err(classify_http_error)?;
            response
                .into_json::<serde_json::Value>()
                .map_err(|e| config_err("rest", format!("response is not JSON: {e}")))
        })?;

        rows_from_json(payload, batch_size)
    }
}

impl Connector for RestConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Rest
    }

    fn test_connection(&mut self) -> TestStatus {
        let url = self.url.clone();
        let probe = self
            .resilience
            .call(&format!("rest:{}", self.host()), || {
                self.agent
                    .request("HEAD", &url)
                    .call()
                    .map_err(classify_http_error)
            });
        match probe {
            Ok(_) => TestStatus {
                ok: true,
                message: format!("{url} is reachable"),
            },
            Err(e) => TestStatus {
                ok: false,
                message: e.reason.to_string(),
            },
        }
    }
}

impl Source for RestConnector {
    fn describe(&mut self) -> Result<Schema, Error> {
        let chunks = self.fetch_rows(64)?;
        Ok(chunks
            .into_iter()
            .next()
            .map(|c| c.schema)
            .unwrap_or_default())
    }

    fn read(&mut self, options: &ReadOptions) -> Result<Vec<DataChunk>, Error> {
        self.fetch_rows(options.batch_size)
    }
}

impl Destination for RestConnector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        _mode: LoadMode,
        _merge_keys: &[String],
    ) -> Result<WriteResult, Error> {
        let mut rows_written = 0u64;
        let host = self.host();

        for chunk in chunks {
            let rows: Vec<serde_json::Value> = (0..chunk.row_count())
                .map(|i| {
                    let members = chunk
                        .schema
                        .columns
                        .iter()
                        .zip(chunk.row(i))
                        .map(|(column, value)| (column.name.clone(), json_from_value(value)))
                        .collect();
                    serde_json::Value::Object(members)
                })
                .collect();

            let request = self.request("POST");
            self.resilience.call(&format!("rest:{host}"), || {
                request
                    .clone()
                    .send_json(serde_json::Value::Array(rows.clone()))
                    .map_err(classify_http_error)
            })?;
            rows_written += chunk.row_count() as u64;
        }

        Ok(WriteResult { rows_written })
    }
}

/// Accepts a bare array, `{"data": [...]}`, or a single object.
fn rows_from_json(payload: serde_json::Value, batch_size: usize) -> Result<Vec<DataChunk>, Error> {
    let rows = match payload {
        serde_json::Value::Array(rows) => rows,
        serde_json::Value::Object(mut members) => match members.remove("data") {
            Some(serde_json::Value::Array(rows)) => rows,
            Some(other) => vec![other],
            None => vec![serde_json::Value::Object(members)],
        },
        other => {
            return Err(config_err(
                "rest",
                format!("expected rows, got {}", json_kind(&other)),
            ))
        }
    };

    let mut names: Vec<String> = Vec::new();
    for row in &rows {
        if let serde_json::Value::Object(members) = row {
            for key in members.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
    }

    let mut chunks = Vec::new();
    let mut current: Option<DataChunk> = None;

    for row in rows {
        let serde_json::Value::Object(members) = row else {
            return Err(config_err(
                "rest",
                format!("expected an object per row, got {}", json_kind(&row)),
            ));
        };

        let chunk = current.get_or_insert_with(|| {
            DataChunk::empty(Schema::new(
                names.iter().map(|n| (n.clone(), DataType::Text)).collect(),
            ))
        });

        chunk.push_row(
            names
                .iter()
                .map(|name| members.get(name).map_or(Value::Null, value_from_json))
                .collect(),
        );

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

fn value_from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        nested => Value::Text(nested.to_string()),
    }
}

fn json_from_value(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::Integer(i) => serde_json::Value::from(i),
        Value::Double(f) => serde_json::json!(f),
        Value::Text(s) => serde_json::Value::String(s),
        Value::Date(d) => serde_json::Value::String(d.to_string()),
        Value::Timestamp(ts) => serde_json::Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn classify_http_error(e: ureq::Error) -> Error {
    match e {
        ureq::Error::Status(code, response) => {
            let details = format!("{} {}", code, response.status_text());
            match code {
                401 | 403 => Error::new(Reason::AuthFailed { details }),
                408 | 429 => Error::new(Reason::Timeout { after_secs: 30 }),
                500..=599 => Error::new(Reason::ConnectionFailed { details }),
                _ => config_err("rest", details),
            }
        }
        ureq::Error::Transport(transport) => Error::new(Reason::ConnectionFailed {
            details: transport.to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rows_from_a_bare_array() {
        let chunks = rows_from_json(
            serde_json::json!([
                {"id": 1, "name": "ada"},
                {"id": 2, "name": "grace", "extra": true},
            ]),
            1024,
        )
        .unwrap();

        let chunk = &chunks[0];
        assert_eq!(chunk.schema.names(), vec!["id", "name", "extra"]);
        assert_eq!(chunk.columns[0][1], Value::Integer(2));
        // missing cells are null
        assert_eq!(chunk.columns[2][0], Value::Null);
        assert_eq!(chunk.columns[2][1], Value::Boolean(true));
    }

    #[test]
    fn rows_from_a_data_envelope() {
        let chunks = rows_from_json(
            serde_json::json!({"data": [{"v": 1.5}]}),
            1024,
        )
        .unwrap();
        assert_eq!(chunks[0].columns[0][0], Value::Double(1.5));
    }

    #[test]
    fn scalar_payloads_are_rejected() {
        let err = rows_from_json(serde_json::json!(42), 1024).unwrap_err();
        assert!(matches!(err.reason, Reason::ConnectorConfig { .. }));
    }

    #[test]
    fn nested_values_flatten_to_text() {
        let chunks = rows_from_json(
            serde_json::json!([{"tags": ["a", "b"]}]),
            1024,
        )
        .unwrap();
        assert_eq!(
            chunks[0].columns[0][0],
            Value::Text("[\"a\",\"b\"]".to_string())
        );
    }

    #[test]
    fn url_is_validated() {
        let err = RestConnector::configure(
            &serde_json::json!({"url": "ftp://example.com"}),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err.reason, Reason::ConnectorConfig { .. }));
    }
}
