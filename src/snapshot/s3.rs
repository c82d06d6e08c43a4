// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! S3-compatible snapshot storage.
//!
//! Works against AWS proper and MinIO-style endpoints. With no access key
//! configured the client runs unsigned (anonymous mode), which suits
//! public read-only buckets. The snapshot tag rides as object metadata.

use super::{SnapshotStorage, HASH_HEADER_KEY};
use crate::config::S3StoreConfig;
use crate::db::backup::file_hash;
use crate::error::{MarmotError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Budget for the startup bucket-existence probe.
const BUCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct S3Storage {
    client: Client,
    bucket: String,
    dir_path: String,
}

impl S3Storage {
    /// Build the client and make sure the bucket exists.
    pub async fn connect(cfg: &S3StoreConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if cfg.access_key.is_empty() && cfg.secret.is_empty() {
            loader = loader.no_credentials();
        } else {
            let session_token = if cfg.session_token.is_empty() {
                None
            } else {
                Some(cfg.session_token.clone())
            };
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                cfg.access_key.clone(),
                cfg.secret.clone(),
                session_token,
                None,
                "marmot-config",
            ));
        }

        let sdk_config = loader.load().await;
        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(true);
        if !cfg.endpoint.is_empty() {
            let scheme = if cfg.use_ssl { "https" } else { "http" };
            builder = builder.endpoint_url(format!("{}://{}", scheme, cfg.endpoint));
        }
        let client = Client::from_conf(builder.build());

        let storage = Self {
            client,
            bucket: cfg.bucket.clone(),
            dir_path: cfg.path.clone(),
        };
        storage.ensure_bucket().await?;
        Ok(storage)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let probe = tokio::time::timeout(
            BUCKET_PROBE_TIMEOUT,
            self.client.head_bucket().bucket(&self.bucket).send(),
        )
        .await
        .map_err(|_| MarmotError::Storage("bucket probe timed out".to_string()))?;

        if probe.is_ok() {
            return Ok(());
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("create bucket: {}", e)))?;
        info!(bucket = %self.bucket, "Created snapshot bucket");
        Ok(())
    }

    fn object_key(&self, name: &str) -> String {
        if self.dir_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.dir_path, name)
        }
    }
}

#[async_trait]
impl SnapshotStorage for S3Storage {
    async fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        let tag = file_hash(local_path)?;
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| MarmotError::Storage(format!("read {}: {}", local_path.display(), e)))?;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(name))
            .metadata(HASH_HEADER_KEY, tag.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("put object: {}", e)))?;

        info!(
            file_name = %name,
            bucket = %self.bucket,
            etag = result.e_tag().unwrap_or_default(),
            tag = %tag,
            "Snapshot saved to S3"
        );
        Ok(())
    }

    async fn download(&self, local_path: &Path, name: &str) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(name))
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error().map(|s| s.is_no_such_key()) == Some(true) {
                    return Err(MarmotError::NoSnapshotFound);
                }
                return Err(MarmotError::Storage(format!("get object: {}", e)));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| MarmotError::Storage(format!("read body: {}", e)))?
            .into_bytes();
        tokio::fs::write(local_path, &data).await?;

        info!(
            file_name = %name,
            bucket = %self.bucket,
            size = data.len(),
            "Snapshot downloaded from S3"
        );
        Ok(())
    }

    async fn head_tag(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(name))
            .send()
            .await;

        match response {
            Ok(head) => Ok(head
                .metadata()
                .and_then(|m| m.get(HASH_HEADER_KEY))
                .cloned()),
            Err(e) => {
                if e.as_service_error().map(|s| s.is_not_found()) == Some(true) {
                    return Ok(None);
                }
                Err(MarmotError::Storage(format!("head object: {}", e)))
            }
        }
    }
}
