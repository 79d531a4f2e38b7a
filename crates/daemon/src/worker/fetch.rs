//! Source download over HTTP or from local files.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use super::pipeline::{FetchError, Fetcher};

#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_file(path: &str, dest: &Path) -> Result<u64, FetchError> {
        match tokio::fs::copy(path, dest).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_http(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            Self::fetch_file(path, dest).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url, dest).await
        } else {
            Err(FetchError::Malformed(url.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_url_is_copied() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("in.ts");
        std::fs::write(&source, b"stream bytes").unwrap();

        let dest = dir.path().join("out");
        let url = format!("file://{}", source.display());
        let bytes = HttpFetcher::default().fetch(&url, &dest).await.unwrap();

        assert_eq!(bytes, 12);
        assert_eq!(std::fs::read(&dest).unwrap(), b"stream bytes");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let url = format!("file://{}", dir.path().join("missing").display());
        let err = HttpFetcher::default()
            .fetch(&url, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_malformed() {
        let dir = tempdir().unwrap();
        let err = HttpFetcher::default()
            .fetch("lbry://abc", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }
}
