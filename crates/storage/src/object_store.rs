//! Object storage interface (S3 compatible).
//!
//! The same client type serves the tile bucket and the public Sentinel-2
//! scene buckets; the latter are read with requester-pays semantics.

use bytes::Bytes;
use object_store::{aws::AmazonS3Builder, memory::InMemory, path::Path, ClientOptions, ObjectStore};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use sentinel_common::{SentinelError, SentinelResult};

/// Configuration for object storage connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// S3/MinIO endpoint URL; `None` uses the AWS endpoint for the region
    pub endpoint: Option<String>,
    /// Bucket name
    pub bucket: String,
    /// Access key ID; `None` falls back to the AWS environment
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    /// AWS region
    pub region: String,
    /// Allow HTTP (for local MinIO)
    pub allow_http: bool,
    /// Send `x-amz-request-payer: requester` with every request
    #[serde(default)]
    pub requester_pays: bool,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: Some("http://minio:9000".to_string()),
            bucket: "sentinel-tiles".to_string(),
            access_key_id: Some("minioadmin".to_string()),
            secret_access_key: Some("minioadmin".to_string()),
            region: "us-east-1".to_string(),
            allow_http: true,
            requester_pays: false,
        }
    }
}

impl ObjectStorageConfig {
    /// Configuration for one of the public Sentinel-2 buckets on AWS.
    pub fn public_bucket(bucket: &str, region: &str, requester_pays: bool) -> Self {
        Self {
            endpoint: None,
            bucket: bucket.to_string(),
            access_key_id: None,
            secret_access_key: None,
            region: region.to_string(),
            allow_http: false,
            requester_pays,
        }
    }
}

/// Object storage client.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectStorage {
    /// Create a new object storage client from config.
    pub fn new(config: &ObjectStorageConfig) -> SentinelResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }
        if config.requester_pays {
            let mut headers = HeaderMap::new();
            headers.insert("x-amz-request-payer", HeaderValue::from_static("requester"));
            builder = builder.with_client_options(ClientOptions::new().with_default_headers(headers));
        }

        let store = builder
            .build()
            .map_err(|e| SentinelError::storage(format!("Failed to create S3 client: {}", e)))?;

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
        })
    }

    /// An in-process store, used by tests and local runs.
    pub fn in_memory(bucket: &str) -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Write bytes to a path in the bucket.
    #[instrument(skip(self, data), fields(bucket = %self.bucket, path = %path))]
    pub async fn put(&self, path: &str, data: Bytes) -> SentinelResult<()> {
        let location = Path::from(path);
        debug!(size = data.len(), "Writing object");

        self.store
            .put(&location, data.into())
            .await
            .map_err(|e| SentinelError::storage(format!("Failed to write {}: {}", path, e)))?;

        Ok(())
    }

    /// Read bytes from a path. A missing object is a `NotFound` error.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn get(&self, path: &str) -> SentinelResult<Bytes> {
        self.get_opt(path)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("{}/{}", self.bucket, path)))
    }

    /// Read bytes from a path, `None` if the object does not exist.
    pub async fn get_opt(&self, path: &str) -> SentinelResult<Option<Bytes>> {
        let location = Path::from(path);

        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => {
                return Err(SentinelError::storage(format!(
                    "Failed to read {}: {}",
                    path, e
                )))
            }
        };

        let bytes = result
            .bytes()
            .await
            .map_err(|e| SentinelError::storage(format!("Failed to read bytes: {}", e)))?;

        debug!(size = bytes.len(), "Read object");
        Ok(Some(bytes))
    }

    /// Read and deserialize a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SentinelResult<T> {
        let bytes = self.get(path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SentinelError::malformed(format!("Invalid JSON at {}: {}", path, e)))
    }

    /// Check if an object exists.
    pub async fn exists(&self, path: &str) -> SentinelResult<bool> {
        let location = Path::from(path);

        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(SentinelError::storage(format!(
                "Failed to check {}: {}",
                path, e
            ))),
        }
    }

    /// List objects with a given prefix.
    pub async fn list(&self, prefix: &str) -> SentinelResult<Vec<String>> {
        use futures::TryStreamExt;

        let prefix_path = Path::from(prefix);
        let mut paths = Vec::new();

        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| SentinelError::storage(format!("List failed: {}", e)))?
        {
            paths.push(meta.location.to_string());
        }

        Ok(paths)
    }

    /// Delete an object.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn delete(&self, path: &str) -> SentinelResult<()> {
        let location = Path::from(path);

        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(SentinelError::storage(format!(
                "Failed to delete {}: {}",
                path, e
            ))),
        }
    }

    /// Download an object into a local file.
    pub async fn download_to(&self, path: &str, target: &std::path::Path) -> SentinelResult<u64> {
        let bytes = self.get(path).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let storage = ObjectStorage::in_memory("test");
        storage
            .put("tiles/32/T/MR/info.json", Bytes::from_static(b"{\"a\": 1}"))
            .await
            .unwrap();

        assert!(storage.exists("tiles/32/T/MR/info.json").await.unwrap());
        assert!(!storage.exists("tiles/32/T/MS/info.json").await.unwrap());

        let value: serde_json::Value = storage.get_json("tiles/32/T/MR/info.json").await.unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let storage = ObjectStorage::in_memory("test");
        assert!(storage.get_opt("nope").await.unwrap().is_none());
        assert!(matches!(
            storage.get("nope").await,
            Err(SentinelError::NotFound(_))
        ));
        storage.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let storage = ObjectStorage::in_memory("test");
        for key in ["tiles/1/a.tif", "tiles/1/b.tif", "tiles/2/c.tif"] {
            storage.put(key, Bytes::from_static(b"x")).await.unwrap();
        }
        let mut keys = storage.list("tiles/1").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tiles/1/a.tif", "tiles/1/b.tif"]);
    }
}
