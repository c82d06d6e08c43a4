// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WebDAV snapshot storage.
//!
//! Configuration rides in a single URL whose query parameters carry the
//! out-of-band pieces: `dir` (target collection), `login` and `secret`
//! (basic-auth credentials). The parameters are stripped before the URL
//! is used as the server base.
//!
//! Uploads go to a node-unique temporary name first and are then moved
//! over the final object name, so readers never observe a half-written
//! snapshot.

use super::SnapshotStorage;
use crate::config::WebDavStoreConfig;
use crate::error::{MarmotError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::Path;
use tracing::info;
use url::Url;

const QUERY_PARAM_DIR: &str = "dir";
const QUERY_PARAM_LOGIN: &str = "login";
const QUERY_PARAM_SECRET: &str = "secret";

pub struct WebDavStorage {
    http: reqwest::Client,
    base: Url,
    dir: String,
    login: String,
    secret: String,
    node_name: String,
}

impl WebDavStorage {
    /// Parse the configured URL and verify the server is reachable.
    pub async fn connect(cfg: &WebDavStoreConfig, node_name: &str) -> Result<Self> {
        let mut url = Url::parse(&cfg.url)
            .map_err(|e| MarmotError::Config(format!("webdav url: {}", e)))?;

        let mut dir = String::from("/");
        let mut login = String::new();
        let mut secret = String::new();
        let mut remaining: Vec<(String, String)> = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                QUERY_PARAM_DIR => dir = value.into_owned(),
                QUERY_PARAM_LOGIN => login = value.into_owned(),
                QUERY_PARAM_SECRET => secret = value.into_owned(),
                _ => remaining.push((key.into_owned(), value.into_owned())),
            }
        }
        if login.is_empty() || secret.is_empty() {
            return Err(MarmotError::Config(
                "webdav url must carry login and secret parameters".to_string(),
            ));
        }

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (key, value) in &remaining {
                pairs.append_pair(key, value);
            }
            drop(pairs);
        }

        let storage = Self {
            http: reqwest::Client::new(),
            base: url,
            dir,
            login,
            secret,
            node_name: node_name.to_string(),
        };

        // OPTIONS doubles as a connectivity and auth probe.
        let response = storage
            .http
            .request(reqwest::Method::OPTIONS, storage.base.clone())
            .basic_auth(&storage.login, Some(&storage.secret))
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("webdav connect: {}", e)))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(MarmotError::Storage("webdav authentication failed".to_string()));
        }

        Ok(storage)
    }

    fn object_url(&self, name: &str) -> Result<Url> {
        let path = format!(
            "{}/{}",
            self.dir.trim_matches('/'),
            name.trim_start_matches('/')
        );
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| MarmotError::Storage(format!("webdav path: {}", e)))
    }

    /// Create the target collection; 405/409 mean it already exists.
    async fn make_storage_path(&self) -> Result<()> {
        let dir_url = self
            .base
            .join(self.dir.trim_matches('/'))
            .map_err(|e| MarmotError::Storage(format!("webdav path: {}", e)))?;

        let response = self
            .http
            .request(
                reqwest::Method::from_bytes(b"MKCOL").expect("valid method"),
                dir_url,
            )
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("webdav mkcol: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => Ok(()),
            status => Err(MarmotError::Storage(format!("webdav mkcol: {}", status))),
        }
    }
}

#[async_trait]
impl SnapshotStorage for WebDavStorage {
    async fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        self.make_storage_path().await?;

        let data = tokio::fs::read(local_path).await?;
        let temp_name = format!(
            "{}-{}-temp-{}",
            self.node_name,
            chrono::Utc::now().timestamp_millis(),
            name
        );
        let temp_url = self.object_url(&temp_name)?;
        let final_url = self.object_url(name)?;

        let response = self
            .http
            .put(temp_url.clone())
            .basic_auth(&self.login, Some(&self.secret))
            .body(data)
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("webdav put: {}", e)))?;
        if !response.status().is_success() {
            return Err(MarmotError::Storage(format!(
                "webdav put: {}",
                response.status()
            )));
        }

        let response = self
            .http
            .request(
                reqwest::Method::from_bytes(b"MOVE").expect("valid method"),
                temp_url,
            )
            .basic_auth(&self.login, Some(&self.secret))
            .header("Destination", final_url.as_str())
            .header("Overwrite", "T")
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("webdav move: {}", e)))?;
        if !response.status().is_success() {
            return Err(MarmotError::Storage(format!(
                "webdav move: {}",
                response.status()
            )));
        }

        info!(file_name = %name, webdav_path = %final_url, "Snapshot saved to WebDAV");
        Ok(())
    }

    async fn download(&self, local_path: &Path, name: &str) -> Result<()> {
        let url = self.object_url(name)?;
        let response = self
            .http
            .get(url.clone())
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await
            .map_err(|e| MarmotError::Storage(format!("webdav get: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(MarmotError::NoSnapshotFound);
        }
        if !response.status().is_success() {
            return Err(MarmotError::Storage(format!(
                "webdav get: {}",
                response.status()
            )));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| MarmotError::Storage(format!("webdav read: {}", e)))?;
        tokio::fs::write(local_path, &data).await?;

        info!(file_name = %name, webdav_path = %url, "Snapshot downloaded from WebDAV");
        Ok(())
    }
}
