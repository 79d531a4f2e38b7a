//! Filesystem object store and the upload callback client.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::pipeline::{is_path_segment, ObjectStore, StoreError};
use crate::protocol::TaskResult;

/// Stores each stream under `<root>/<reference>/`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, reference: &str) -> Result<PathBuf, StoreError> {
        if !is_path_segment(reference) {
            return Err(StoreError::InvalidKey(reference.to_string()));
        }
        Ok(self.root.join(reference))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, reference: &str, file: &Path) -> Result<TaskResult, StoreError> {
        let dir = self.dir_for(reference)?;
        tokio::fs::create_dir_all(&dir).await?;

        let name = file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "stream".into());
        let dest = dir.join(name);
        let size_bytes = tokio::fs::copy(file, &dest).await?;

        Ok(TaskResult {
            url: format!("file://{}", dest.display()),
            size_bytes,
        })
    }

    async fn delete(&self, reference: &str) -> Result<(), StoreError> {
        let dir = self.dir_for(reference)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Posts finished results to the coordinator's callback endpoint.
#[derive(Debug, Clone, Default)]
pub struct CallbackClient {
    client: reqwest::Client,
}

impl CallbackClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn post(&self, url: &str, token: &str, result: &TaskResult) -> Result<(), StoreError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(result)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::CallbackRejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_and_delete() {
        let dir = tempdir().unwrap();
        let encoded = dir.path().join("t1.mkv");
        std::fs::write(&encoded, vec![0u8; 64]).unwrap();

        let store = FsObjectStore::new(dir.path().join("streams"));
        let result = store.put("abc", &encoded).await.unwrap();

        assert_eq!(result.size_bytes, 64);
        assert!(result.url.starts_with("file://"));
        assert!(dir.path().join("streams/abc/t1.mkv").exists());

        store.delete("abc").await.unwrap();
        assert!(!dir.path().join("streams/abc").exists());
        // Deleting twice is fine
        store.delete("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_reference_cannot_escape_root() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store.put("../etc", &dir.path().join("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
