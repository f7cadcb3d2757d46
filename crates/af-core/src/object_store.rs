// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Blob storage for snapshots and bundles

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use tracing::debug;

use crate::config::{ObjectStoreConfig, ObjectStoreKind};
use crate::{Error, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Build the configured object store
pub fn from_config(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.kind {
        ObjectStoreKind::Fs => Ok(Arc::new(FsObjectStore::new(&config.root))),
        ObjectStoreKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                Error::ObjectStore("object-store.url is required for the http store".into())
            })?;
            Ok(Arc::new(HttpObjectStore::new(url, config.key.clone())?))
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(Error::ObjectStore(format!("invalid object key: {:?}", key)));
    }
    Ok(())
}

/// Objects as files below a root directory
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(key, bytes = bytes.len(), "Writing object");
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Objects behind a plain HTTP PUT/GET endpoint
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    http_client: HttpClient,
    base_url: String,
    key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, key: Option<String>) -> Result<Self> {
        let http_client = HttpClient::builder().user_agent("af-core/0.1").build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        })
    }

    fn url_for(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.url_for(key)?;
        let response = self
            .authorize(self.http_client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ObjectStore(format!("PUT {} returned {}", key, status)));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url_for(key)?;
        let response = self.authorize(self.http_client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(Error::ObjectStore(format!("GET {} returned {}", key, status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_put_get() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert_eq!(store.get("snapshots/o/t/latest.json").await.unwrap(), None);

        store
            .put("snapshots/o/t/latest.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(
            store.get("snapshots/o/t/latest.json").await.unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.put("../outside", vec![], "text/plain").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[test]
    fn test_http_store_requires_url() {
        let config = ObjectStoreConfig {
            kind: ObjectStoreKind::Http,
            ..Default::default()
        };
        assert!(matches!(from_config(&config), Err(Error::ObjectStore(_))));
    }
}
