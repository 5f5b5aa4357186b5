//! Blob Store Adapters
//!
//! - [`S3BlobStore`]: any S3-compatible bucket (AWS, MinIO, GCS interop)
//! - [`LocalDirBlobStore`]: a directory on local disk, for development
//!
//! # Google Cloud Storage
//!
//! GCS is reached through its XML interoperability API. Set
//! `RECORDER_FALLBACK_ENDPOINT=https://storage.googleapis.com`, use `auto`
//! as the region, and put an HMAC key pair (Cloud Storage settings,
//! Interoperability tab) in `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`.
//! Service account JSON credentials are not accepted.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use crate::application::ports::{BlobStoreError, BlobStorePort};

// =============================================================================
// S3
// =============================================================================

/// S3 bucket settings.
#[derive(Clone)]
pub struct S3Settings {
    /// Bucket name.
    pub bucket: String,
    /// Custom endpoint for S3-compatible stores, e.g.
    /// `https://storage.googleapis.com` for GCS with HMAC keys. Path-style
    /// addressing is used when set.
    pub endpoint: Option<String>,
    /// Region.
    pub region: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &"[REDACTED]")
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build a client from static credentials.
    #[must_use]
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            None,
            None,
            "market-recorder",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStorePort for S3BlobStore {
    async fn put(&self, key: &str, body: Bytes) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| BlobStoreError::Remote(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

// =============================================================================
// Local Directory
// =============================================================================

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalDirBlobStore {
    root: PathBuf,
}

impl LocalDirBlobStore {
    /// Store objects under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStorePort for LocalDirBlobStore {
    async fn put(&self, key: &str, body: Bytes) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial object.
        let partial = target.with_extension("partial");
        tokio::fs::write(&partial, &body).await?;
        tokio::fs::rename(&partial, &target).await?;
        Ok(())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Keys are relative paths without `.` or `..` segments.
fn validate_key(key: &str) -> Result<(), BlobStoreError> {
    let path = Path::new(key);
    let valid = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(BlobStoreError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("trade/BTC_USDT/20240501T120000.000Z.parquet").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("trade/../../etc").is_err());
        assert!(validate_key("./trade").is_err());
    }

    #[tokio::test]
    async fn local_store_writes_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirBlobStore::new(dir.path());

        store
            .put("trade/BTC_USDT/a.parquet", Bytes::from_static(b"PAR1"))
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("trade/BTC_USDT/a.parquet")).unwrap();
        assert_eq!(written, b"PAR1");
        assert!(!dir.path().join("trade/BTC_USDT/a.partial").exists());
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirBlobStore::new(dir.path());
        let err = store.put("../x", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BlobStoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn s3_settings_debug_redacts_secrets() {
        let settings = S3Settings {
            bucket: "recorder-fallback".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
            region: "us-east-1".to_string(),
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "hunter2".to_string(),
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("AKIA123"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(S3BlobStore::new(&settings).location(), "s3://recorder-fallback");
    }
}
