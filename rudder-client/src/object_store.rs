//! Artifact object store
//!
//! Artifacts live in a single bucket of an S3-compatible store (path-style
//! addressing, usually an in-cluster MinIO), keyed by `{job}-{id}[.tar]`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Default region sent to stores that ignore it
pub const DEFAULT_REGION: &str = "us-east-1";

/// Object-store errors
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store backend error: {0}")]
    Backend(String),

    #[error("object store io error: {0}")]
    Io(String),
}

/// Minimal object-store client abstraction
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes a single object
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;

    /// Reads a single object
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Connection settings for the artifact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// `host:port` or a full URL
    pub host: String,
    pub bucket: String,
    pub region: String,
}

impl StorageConfig {
    pub fn new(host: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            bucket: bucket.into(),
            region: DEFAULT_REGION.to_string(),
        }
    }

    /// Endpoint URL; bare hosts are reached over plain HTTP
    pub fn endpoint_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("http://{}", self.host)
        }
    }
}

/// S3-backed object store
///
/// Credentials come from the standard AWS provider chain, which inside a job
/// Pod means the `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` variables.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(config: &StorageConfig) -> Self {
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint_url())
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        debug!("Uploading {} bytes to {}/{}", body.len(), self.bucket, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| ObjectStoreError::Backend(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        debug!("Downloading {}/{}", self.bucket, key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service) if service.is_no_such_key() => {
                    ObjectStoreError::NotFound(key.to_string())
                }
                _ => ObjectStoreError::Backend(DisplayErrorContext(&err).to_string()),
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| ObjectStoreError::Io(err.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }
}

/// In-memory store, used by tests and local dry runs
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match self.objects.lock() {
            Ok(objects) => objects.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.objects
            .lock()
            .map_err(|e| ObjectStoreError::Io(e.to_string()))?
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .lock()
            .map_err(|e| ObjectStoreError::Io(e.to_string()))?
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let config = StorageConfig::new("storage-hl-svc.default.svc.cluster.local:9000", "build-artifacts");
        assert_eq!(
            config.endpoint_url(),
            "http://storage-hl-svc.default.svc.cluster.local:9000"
        );
        assert_eq!(config.region, DEFAULT_REGION);

        let config = StorageConfig::new("https://minio.example.com", "b");
        assert_eq!(config.endpoint_url(), "https://minio.example.com");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryObjectStore::new();
        store.put("svc-abcd1234.tar", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("svc-abcd1234.tar").await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            store.get("missing").await,
            Err(ObjectStoreError::NotFound(_))
        ));
        assert_eq!(store.keys(), vec!["svc-abcd1234.tar"]);
    }
}
