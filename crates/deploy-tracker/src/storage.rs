//! Object-storage backends for deployment artifacts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{StorageMode, StorageSettings};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store write failed: {0}")]
    Write(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store operation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub key: String,
    pub location: String,
}

/// Object-storage port. Every call is a single network round trip with a
/// finite timeout; `delete` of an absent key succeeds, which compensation
/// in the workflow relies on.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<PutOutcome, StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Generate a time-limited read URL. Generation can succeed for an
    /// absent key; absence surfaces when the URL is accessed.
    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;
}

/// Build the configured backend. Mock mode keeps objects in memory and is
/// what tests and local development run against.
pub async fn build_store(settings: &StorageSettings) -> Arc<dyn ArtifactStore> {
    match settings.mode {
        StorageMode::S3 => {
            info!(bucket=%settings.bucket, endpoint=?settings.endpoint, "storage backend: s3");
            Arc::new(S3ArtifactStore::from_settings(settings).await)
        }
        StorageMode::Mock => {
            info!(bucket=%settings.bucket, "storage backend: mock");
            Arc::new(MemoryArtifactStore::new(&settings.base_url))
        }
    }
}

/// Run one backend call under a finite deadline.
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StorageError::Timeout(limit))?
}

fn classify_sdk<E>(e: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let msg = format!("{}", DisplayErrorContext(&e));
    match e {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::Unavailable(msg)
        }
        _ => StorageError::Write(msg),
    }
}

pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    endpoint: String,
    op_timeout: Duration,
}

impl S3ArtifactStore {
    pub async fn from_settings(settings: &StorageSettings) -> Self {
        use aws_config::BehaviorVersion;
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()));
        if let (Some(access), Some(secret)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "deploy-tracker",
            ));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint {
            // Path-style addressing for MinIO / Scality compatibility.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", settings.region));
        Self { client, endpoint, op_timeout: settings.op_timeout }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<PutOutcome, StorageError> {
        bounded(self.op_timeout, async {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type(content_type)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(classify_sdk)?;
            Ok(PutOutcome {
                key: key.to_string(),
                location: format!("{}/{}{}", self.endpoint.trim_end_matches('/'), bucket, key),
            })
        })
        .await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        bounded(self.op_timeout, async {
            let out = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                        StorageError::NotFound(key.to_string())
                    } else {
                        classify_sdk(e)
                    }
                })?;
            let data = out
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            Ok(data.into_bytes().to_vec())
        })
        .await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        // S3 DeleteObject on an absent key returns success, which is exactly
        // the semantics compensation needs.
        bounded(self.op_timeout, async {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(classify_sdk)?;
            Ok(())
        })
        .await
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        bounded(self.op_timeout, async {
            let config = PresigningConfig::builder()
                .expires_in(ttl)
                .build()
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            let presigned = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(classify_sdk)?;
            Ok(presigned.uri().to_string())
        })
        .await
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory backend for mock mode and tests.
pub struct MemoryArtifactStore {
    base_url: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryArtifactStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn object_id(bucket: &str, key: &str) -> String {
        format!("{bucket}:{key}")
    }

    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(&Self::object_id(bucket, key))
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<PutOutcome, StorageError> {
        let mut objects = self.objects.write().await;
        if objects
            .insert(
                Self::object_id(bucket, key),
                StoredObject { bytes, content_type: content_type.to_string() },
            )
            .is_some()
        {
            warn!(bucket, key, "overwriting existing object");
        }
        Ok(PutOutcome {
            key: key.to_string(),
            location: format!("{}/{}{}", self.base_url, bucket, key),
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(&Self::object_id(bucket, key))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(&Self::object_id(bucket, key));
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "{}/{}{}?X-Amz-Expires={}",
            self.base_url,
            bucket,
            key,
            ttl.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryArtifactStore {
        MemoryArtifactStore::new("http://localhost:9000")
    }

    #[tokio::test]
    async fn put_then_get_returns_bytes() {
        let s = store();
        s.put("b", "/svc/1/a.pdf", b"data".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(s.get("b", "/svc/1/a.pdf").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn re_put_overwrites() {
        let s = store();
        s.put("b", "/k", b"one".to_vec(), "application/pdf").await.unwrap();
        s.put("b", "/k", b"two".to_vec(), "application/pdf").await.unwrap();
        assert_eq!(s.get("b", "/k").await.unwrap(), b"two");
        assert_eq!(s.object_count().await, 1);
    }

    #[tokio::test]
    async fn get_absent_is_not_found() {
        let s = store();
        assert!(matches!(
            s.get("b", "/missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_absent_is_success() {
        let s = store();
        s.delete("b", "/never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn stalled_backend_call_maps_to_timeout() {
        let limit = Duration::from_millis(20);
        let out = bounded(limit, std::future::pending::<Result<(), StorageError>>()).await;
        assert!(matches!(out, Err(StorageError::Timeout(d)) if d == limit));
    }

    #[tokio::test]
    async fn signed_url_generated_even_for_absent_key() {
        let s = store();
        let url = s
            .signed_url("b", "/missing.pdf", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.contains("/b/missing.pdf"));
        assert!(url.contains("3600"));
    }
}
