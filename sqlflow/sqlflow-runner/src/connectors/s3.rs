//! S3 connector over `object_store`, run on a private current-thread tokio
//! runtime so the executor stays synchronous.
//!
//! Payloads are CSV or Parquet, picked by the object key's extension.

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::{ObjectStore, PutPayload};
use sqlflow::ast::LoadMode;
use sqlflow::{Error, Reason};

use crate::data::{DataChunk, Schema};
use crate::resilience::{CancelToken, Resilience, ResilienceConfig};

use super::{
    config_err, optional_str, required_str, Connector, ConnectorKind, Destination, ReadOptions,
    Source, TestStatus, WriteResult,
};

pub struct S3Connector {
    bucket: String,
    key: String,
    endpoint_url: Option<String>,
    region: String,
    access_key: String,
    secret_key: String,
    runtime: tokio::runtime::Runtime,
    resilience: Resilience,
}

pub(crate) fn parse_s3_uri(uri: &str) -> Result<(String, String), Error> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| config_err("s3", format!("expected an s3:// uri, got `{uri}`")))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| config_err("s3", format!("`{uri}` is missing an object key")))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(config_err("s3", format!("`{uri}` is missing a bucket or key")));
    }
    Ok((bucket.to_string(), key.to_string()))
}

impl S3Connector {
    pub fn configure(params: &serde_json::Value, cancel: &CancelToken) -> Result<S3Connector, Error> {
        let key = optional_str(params, "key")
            .or_else(|| optional_str(params, "path"))
            .ok_or_else(|| config_err("s3", "missing required param `path` (or `key`)"))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| config_err("s3", format!("cannot start io runtime: {e}")))?;

        Ok(S3Connector {
            bucket: required_str(params, "bucket", "s3")?,
            key,
            endpoint_url: optional_str(params, "endpoint_url"),
            region: optional_str(params, "region").unwrap_or_else(|| "us-east-1".to_string()),
            access_key: required_str(params, "access_key", "s3")?,
            secret_key: required_str(params, "secret_key", "s3")?,
            runtime,
            resilience: Resilience::new(ResilienceConfig::from_params(params), cancel.clone()),
        })
    }

    fn store(&self) -> Result<impl ObjectStore, Error> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_access_key_id(&self.access_key)
            .with_secret_access_key(&self.secret_key);
        if let Some(endpoint) = &self.endpoint_url {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        builder
            .build()
            .map_err(|e| config_err("s3", e.to_string()))
    }

    fn endpoint(&self) -> String {
        format!("s3:{}", self.bucket)
    }

    fn get_object(&mut self) -> Result<Bytes, Error> {
        let store = self.store()?;
        let path = object_store::path::Path::from(self.key.as_str());
        let runtime = &self.runtime;

        self.resilience.call(&format!("s3:{}", self.bucket), || {
            runtime.block_on(async {
                let result = store.get(&path).await.map_err(classify_s3_error)?;
                result.bytes().await.map_err(classify_s3_error)
            })
        })
    }

    fn put_object(&mut self, bytes: Bytes) -> Result<(), Error> {
        let store = self.store()?;
        let path = object_store::path::Path::from(self.key.as_str());
        let runtime = &self.runtime;

        self.resilience.call(&format!("s3:{}", self.bucket), || {
            let payload = PutPayload::from(bytes.clone());
            runtime.block_on(async {
                store
                    .put(&path, payload)
                    .await
                    .map(|_| ())
                    .map_err(classify_s3_error)
            })
        })
    }

    fn decode(&self, bytes: Bytes, batch_size: usize) -> Result<Vec<DataChunk>, Error> {
        if self.key.ends_with(".parquet") {
            super::parquet::decode_parquet(bytes, batch_size)
        } else {
            super::csv::decode_csv(bytes.as_ref(), true, b',', batch_size)
        }
    }
}

impl Connector for S3Connector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::S3
    }

    fn test_connection(&mut self) -> TestStatus {
        match self.get_object() {
            Ok(bytes) => TestStatus {
                ok: true,
                message: format!("s3://{}/{} ({} bytes)", self.bucket, self.key, bytes.len()),
            },
            Err(e) => TestStatus {
                ok: false,
                message: e.reason.to_string(),
            },
        }
    }
}

impl Source for S3Connector {
    fn describe(&mut self) -> Result<Schema, Error> {
        let bytes = self.get_object()?;
        let chunks = self.decode(bytes, 128)?;
        Ok(chunks
            .into_iter()
            .next()
            .map(|c| c.schema)
            .unwrap_or_default())
    }

    fn read(&mut self, options: &ReadOptions) -> Result<Vec<DataChunk>, Error> {
        let bytes = self.get_object()?;
        self.decode(bytes, options.batch_size)
    }
}

impl Destination for S3Connector {
    fn write(
        &mut self,
        chunks: &[DataChunk],
        mode: LoadMode,
        _merge_keys: &[String],
    ) -> Result<WriteResult, Error> {
        if mode != LoadMode::Replace {
            return Err(config_err(
                "s3",
                "s3 destinations only support REPLACE writes",
            ));
        }

        let mut rows_written = 0u64;
        for chunk in chunks {
            rows_written += chunk.row_count() as u64;
        }

        let mut buffer = Vec::new();
        if self.key.ends_with(".parquet") {
            super::parquet::encode_parquet(&mut buffer, chunks)?;
        } else {
            super::csv::encode_csv(&mut buffer, chunks, b',', true)?;
        }

        self.put_object(Bytes::from(buffer))?;
        Ok(WriteResult { rows_written })
    }
}

fn classify_s3_error(e: object_store::Error) -> Error {
    if matches!(e, object_store::Error::NotFound { .. }) {
        return config_err("s3", e.to_string());
    }
    let details = e.to_string();
    let lowered = details.to_lowercase();
    if lowered.contains("forbidden")
        || lowered.contains("access denied")
        || lowered.contains("invalidaccesskey")
        || lowered.contains("signature")
    {
        Error::new(Reason::AuthFailed { details })
    } else {
        Error::new(Reason::ConnectionFailed { details })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uri_parsing() {
        assert_eq!(
            parse_s3_uri("s3://events/2024/day.csv").unwrap(),
            ("events".to_string(), "2024/day.csv".to_string())
        );
        parse_s3_uri("s3://bucket-only").unwrap_err();
        parse_s3_uri("http://not-s3").unwrap_err();
    }

    #[test]
    fn credentials_are_required() {
        let err = S3Connector::configure(
            &serde_json::json!({"bucket": "b", "path": "k.csv"}),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err.reason, Reason::ConnectorConfig { .. }));
    }
}
