//! Runtime settings and destination credentials.
//!
//! Values come from the process environment (after `.env` is loaded by the
//! binary). Credentials follow a fixed lookup order: the two AWS environment
//! variables first, then a JSON credentials file.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_SYSTEMS_CATALOG: &str =
    "https://raw.githubusercontent.com/MobilityData/gbfs/master/systems.csv";

const DEFAULT_REGION: &str = "eu-central-1";
const DEFAULT_BUCKET: &str = "gbfsbikesbucket";
const DEFAULT_CREDENTIALS_FILE: &str = ".creds/key.json";
const DEFAULT_DATA_DIR: &str = "data";

const ACCESS_KEY_VAR: &str = "AWS_ACCESS_KEY_ID";
const SECRET_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";

#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub s3_bucket: String,
    pub credentials_file: PathBuf,
    pub data_dir: PathBuf,
    /// Path or URL of the GBFS `systems.csv` catalog.
    pub systems_catalog: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            region: get("AWS_REGION", DEFAULT_REGION),
            s3_bucket: get("GBFS_S3_BUCKET", DEFAULT_BUCKET),
            credentials_file: get("GBFS_CREDENTIALS_FILE", DEFAULT_CREDENTIALS_FILE).into(),
            data_dir: get("GBFS_DATA_DIR", DEFAULT_DATA_DIR).into(),
            systems_catalog: get("GBFS_SYSTEMS_CSV", DEFAULT_SYSTEMS_CATALOG),
        }
    }
}

/// Static AWS key pair used by the `athena` destination.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Resolves credentials from the environment, falling back to the JSON
    /// file at `path`.
    ///
    /// # Errors
    ///
    /// Fails when neither source provides both keys.
    pub fn load(path: &Path) -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok(), path)
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>, path: &Path) -> Result<Self> {
        let from_env = (
            lookup(ACCESS_KEY_VAR).filter(|v| !v.is_empty()),
            lookup(SECRET_KEY_VAR).filter(|v| !v.is_empty()),
        );
        if let (Some(aws_access_key_id), Some(aws_secret_access_key)) = from_env {
            return Ok(Self {
                aws_access_key_id,
                aws_secret_access_key,
            });
        }

        if !path.exists() {
            bail!(
                "no credentials found: set {ACCESS_KEY_VAR} and {SECRET_KEY_VAR} or provide {}",
                path.display()
            );
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("malformed credentials file {}", path.display()))
    }
}
