//! S3-compatible object store backend (AWS S3, MinIO, ...).

use std::path::Path;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};

use crate::error::{ConveyorError, Result};

use super::ObjectStore;

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Settings {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Custom endpoint for MinIO or other S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Path-style addressing, required by MinIO
    #[serde(default)]
    pub path_style: bool,
}

/// S3-backed [`ObjectStore`].
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Build a client from explicit settings.
    pub fn new(settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "conveyor",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .force_path_style(settings.path_style);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        tracing::info!(
            region = %settings.region,
            endpoint = settings.endpoint.as_deref().unwrap_or("aws"),
            "initialized S3 object store"
        );

        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    /// Wrap an already-configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[tracing::instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                ConveyorError::ObjectStore(anyhow!("failed to get {bucket}/{key}: {e}"))
            })?;

        let data = response.body.collect().await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!("failed to read body of {bucket}/{key}: {e}"))
        })?;
        Ok(data.into_bytes().to_vec())
    }

    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!("failed to put {bucket}/{key}: {e}"))
        })?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!(
                "failed to open {} for upload: {e}",
                path.display()
            ))
        })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                ConveyorError::ObjectStore(anyhow!("failed to put {bucket}/{key}: {e}"))
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                ConveyorError::ObjectStore(anyhow!("failed to delete {bucket}/{key}: {e}"))
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let text = e.to_string();
                if text.contains("NotFound") || text.contains("404") {
                    Ok(false)
                } else {
                    Err(ConveyorError::ObjectStore(anyhow!(
                        "failed to check {bucket}/{key}: {e}"
                    )))
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn copy(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()> {
        let copy_source = format!("{bucket}/{key}");

        self.client
            .copy_object()
            .bucket(dest_bucket)
            .copy_source(&copy_source)
            .key(dest_key)
            .send()
            .await
            .map_err(|e| {
                ConveyorError::ObjectStore(anyhow!(
                    "failed to copy {bucket}/{key} to {dest_bucket}/{dest_key}: {e}"
                ))
            })?;
        Ok(())
    }
}
