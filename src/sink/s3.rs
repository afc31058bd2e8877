//! S3 destination read by Athena.
//!
//! Each table lives under `<dataset>/<table>/` in the bucket as gzip
//! compressed JSON-lines objects partitioned by load date
//! (`date=YYYY-MM-DD/`), the layout an Athena external table with a JSON
//! SerDe reads directly. Appends add an object; merge and replace rewrite
//! the table as one object and then delete the objects it supersedes.

use anyhow::{Context, Result};
use aws_sdk_s3::config::{Credentials as AwsCredentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::{Row, Sink, WriteDisposition, merge_rows, validate_table};
use crate::config::{Credentials, Settings};

/// Minimal object-store surface the sink needs.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn get(&self, key: &str) -> Result<Bytes>;
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// [`ObjectStore`] backed by one S3 bucket.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Builds a client from static credentials and checks the bucket is
    /// reachable.
    pub async fn connect(credentials: &Credentials, settings: &Settings) -> Result<Self> {
        let provider = AwsCredentials::new(
            credentials.aws_access_key_id.clone(),
            credentials.aws_secret_access_key.clone(),
            None,
            None,
            "gbfs_ingest",
        );
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(provider)
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&config);

        client
            .head_bucket()
            .bucket(&settings.s3_bucket)
            .send()
            .await
            .with_context(|| format!("S3 bucket '{}' is not reachable", settings.s3_bucket))?;

        info!(bucket = %settings.s3_bucket, region = %settings.region, "S3 bucket reachable");
        Ok(Self::new(client, &settings.s3_bucket))
    }

    pub fn new(client: aws_sdk_s3::Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("failed to list s3://{}/{prefix}", self.bucket))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
        }
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to get s3://{}/{key}", self.bucket))?;
        Ok(resp.body.collect().await?.into_bytes())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("failed to put s3://{}/{key}", self.bucket))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to delete s3://{}/{key}", self.bucket))?;
        Ok(())
    }
}

pub struct S3Sink<S = S3Store> {
    store: S,
    dataset: String,
    seq: AtomicU64,
}

impl S3Sink<S3Store> {
    pub async fn connect(credentials: &Credentials, settings: &Settings, dataset: &str) -> Result<Self> {
        let store = S3Store::connect(credentials, settings).await?;
        info!(dataset, "S3 destination ready");
        Ok(Self::new(store, dataset))
    }
}

impl<S: ObjectStore> S3Sink<S> {
    pub fn new(store: S, dataset: &str) -> Self {
        Self {
            store,
            dataset: dataset.to_string(),
            seq: AtomicU64::new(0),
        }
    }

    fn table_prefix(&self, table: &str) -> String {
        format!("{}/{}/", self.dataset, table)
    }

    async fn read_rows(&self, key: &str) -> Result<Vec<Row>> {
        let body = self.store.get(key).await?;
        decode_jsonl_gz(&body).with_context(|| format!("malformed object {key}"))
    }

    async fn put_rows(&self, table: &str, rows: &[Row]) -> Result<String> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = object_key(&self.dataset, table, Utc::now(), seq);
        self.store.put(&key, encode_jsonl_gz(rows)?).await?;

        debug!(key = %key, rows = rows.len(), "Uploaded object");
        Ok(key)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.store.delete(key).await?;
        }
        Ok(())
    }
}

/// `<dataset>/<table>/date=YYYY-MM-DD/<unix_millis>-<seq>.jsonl.gz`
pub fn object_key(dataset: &str, table: &str, at: DateTime<Utc>, seq: u64) -> String {
    format!(
        "{dataset}/{table}/date={}/{}-{seq}.jsonl.gz",
        at.format("%Y-%m-%d"),
        at.timestamp_millis()
    )
}

pub fn encode_jsonl_gz(rows: &[Row]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for row in rows {
        serde_json::to_writer(&mut encoder, row)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

pub fn decode_jsonl_gz(bytes: &[u8]) -> Result<Vec<Row>> {
    let reader = BufReader::new(GzDecoder::new(bytes));
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

#[async_trait::async_trait]
impl<S: ObjectStore> Sink for S3Sink<S> {
    async fn write(
        &self,
        table: &str,
        rows: &[Row],
        disposition: &WriteDisposition,
    ) -> Result<usize> {
        validate_table(table)?;
        let prefix = self.table_prefix(table);

        match disposition {
            WriteDisposition::Append => {
                if rows.is_empty() {
                    return Ok(0);
                }
                self.put_rows(table, rows).await?;
            }
            WriteDisposition::Replace => {
                let stale = self.store.list(&prefix).await?;
                if !rows.is_empty() {
                    self.put_rows(table, rows).await?;
                }
                self.delete_keys(&stale).await?;
                debug!(table, removed = stale.len(), "Replaced table objects");
            }
            WriteDisposition::Merge { primary_key } => {
                if rows.is_empty() {
                    return Ok(0);
                }
                let stale = self.store.list(&prefix).await?;
                let mut existing = Vec::new();
                for key in &stale {
                    existing.extend(self.read_rows(key).await?);
                }
                let merged = merge_rows(existing, rows, primary_key)?;
                self.put_rows(table, &merged).await?;
                self.delete_keys(&stale).await?;
                debug!(table, total = merged.len(), "Merged table objects");
            }
        }

        Ok(rows.len())
    }
}
