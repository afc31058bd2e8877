//! HTTP transport for GBFS documents and the systems catalog.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tracing::debug;

/// Issues a GET for `url` and returns the body. Non-2xx statuses are errors.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes> {
    let req = reqwest::Request::new(
        reqwest::Method::GET,
        url.parse().with_context(|| format!("invalid url '{url}'"))?,
    );

    let resp = client
        .execute(req)
        .await
        .with_context(|| format!("GET {url} failed"))?;

    let status = resp.status();
    if !status.is_success() {
        bail!("GET {url} returned status {status}");
    }

    let body = resp.bytes().await?;
    debug!(url, bytes = body.len(), "Fetched document");
    Ok(body)
}

/// Loads a document from a local file path or fetches it over HTTP.
pub async fn load_source<C: HttpClient + ?Sized>(client: &C, source: &str) -> Result<Bytes> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes(client, source).await
    } else {
        let bytes = std::fs::read(source).with_context(|| format!("failed to read {source}"))?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_source_reads_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"data\":{}}").unwrap();

        let client = BasicClient::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let bytes = load_source(&client, &path).await.unwrap();

        assert_eq!(&bytes[..], b"{\"data\":{}}");
    }

    #[tokio::test]
    async fn test_load_source_missing_file_is_error() {
        let client = BasicClient::new().unwrap();
        let result = load_source(&client, "/definitely/not/here.json").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_bytes_rejects_invalid_url() {
        let client = BasicClient::new().unwrap();
        let result = fetch_bytes(&client, "not a url").await;
        assert!(result.is_err());
    }
}
