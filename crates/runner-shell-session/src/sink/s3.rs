//! S3 object store for session archives.

use std::io;

use async_trait::async_trait;
use object_store::{
    ObjectStore as _, PutPayload, RetryConfig,
    aws::{AmazonS3, AmazonS3Builder},
    path::Path,
};
use runner_shell_core::RunnerContext;

use super::ObjectStore;

/// Connection settings for [`S3Store`].
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    /// S3-compatible endpoint; AWS when `None`.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Retries per request; the client default when `None`.
    pub max_retries: Option<usize>,
}

impl S3Settings {
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Settings from the runner context, with the archive prefix.
    ///
    /// `None` unless both `S3_BUCKET` and `S3_PREFIX` are set.
    #[must_use]
    pub fn from_context(ctx: &RunnerContext) -> Option<(Self, String)> {
        let (bucket, prefix) = ctx.s3_archive()?;
        let settings = Self {
            bucket: bucket.to_string(),
            endpoint: ctx.s3_endpoint.clone(),
            region: ctx.aws_region.clone(),
            access_key_id: ctx.aws_access_key_id.clone(),
            secret_access_key: ctx.aws_secret_access_key.clone(),
            max_retries: None,
        };
        Some((settings, prefix.to_string()))
    }
}

/// [`ObjectStore`] backed by an S3 bucket.
#[derive(Debug)]
pub struct S3Store {
    client: AmazonS3,
    bucket: String,
}

impl S3Store {
    /// Build a client; no request is made until the first `get` or `put`.
    ///
    /// Credentials not given in `settings` are resolved the usual AWS way
    /// (web identity, instance metadata).
    ///
    /// # Errors
    /// Returns error if the settings are rejected by the client builder.
    pub fn new(settings: S3Settings) -> io::Result<Self> {
        let mut builder = AmazonS3Builder::new().with_bucket_name(&settings.bucket);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(region) = &settings.region {
            builder = builder.with_region(region);
        }
        if let Some(key_id) = &settings.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &settings.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(max_retries) = settings.max_retries {
            builder = builder.with_retry(RetryConfig {
                max_retries,
                ..RetryConfig::default()
            });
        }

        let client = builder.build().map_err(io::Error::other)?;
        tracing::debug!(bucket = %settings.bucket, endpoint = ?settings.endpoint, "S3 archive store ready");
        Ok(Self {
            client,
            bucket: settings.bucket,
        })
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn location(key: &str) -> Path {
    Path::from(key)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let object = match self.client.get(&location(key)).await {
            Ok(object) => object,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(io::Error::other(e)),
        };
        let body = object.bytes().await.map_err(io::Error::other)?;
        Ok(Some(body.to_vec()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> io::Result<()> {
        self.client
            .put(&location(key), PutPayload::from(body))
            .await
            .map_err(io::Error::other)?;
        Ok(())
    }
}
