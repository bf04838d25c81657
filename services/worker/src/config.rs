//! Worker configuration.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ingestion::{IngestConfig, ToolchainConfig};
use storage::ObjectStorageConfig;

/// Top-level worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Catalog database: a sqlite path or `sqlite::memory:`
    pub database_url: String,

    /// Bucket holding the layer tiles
    pub tiles: ObjectStorageConfig,

    /// Public bucket with L1C products
    pub l1c_bucket: String,

    /// Public bucket with L2A products (requester pays)
    pub l2a_bucket: String,

    /// Region of the public scene buckets
    pub scene_region: String,

    /// Redis URL; the in-process queue is used when unset
    pub redis_url: Option<String>,

    /// Tasks run at once by one worker
    pub concurrency: usize,

    /// Deadline of one task
    pub task_timeout_secs: u64,

    /// Failed ingestions of a scene before it is marked broken
    pub max_scene_retries: u32,

    pub sen2cor_binary: String,
    pub product_download_binary: String,
    pub gdal_translate_binary: String,

    /// Parent of per-scene scratch directories
    pub work_dir: Option<PathBuf>,

    /// First capture day with products in the L2A bucket
    pub l2a_availability_date: NaiveDate,

    /// Directory of `*.json` classifier models
    pub classifier_dir: Option<PathBuf>,

    /// Prometheus exporter listen address
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let toolchain = ToolchainConfig::default();
        Self {
            database_url: "sqlite:///data/sentinel/catalog.db".to_string(),
            tiles: ObjectStorageConfig::default(),
            l1c_bucket: "sentinel-s2-l1c".to_string(),
            l2a_bucket: "sentinel-s2-l2a".to_string(),
            scene_region: "eu-central-1".to_string(),
            redis_url: None,
            concurrency: 4,
            task_timeout_secs: 3600,
            max_scene_retries: 3,
            sen2cor_binary: toolchain.sen2cor_binary,
            product_download_binary: toolchain.product_download_binary,
            gdal_translate_binary: toolchain.gdal_translate_binary,
            work_dir: None,
            l2a_availability_date: IngestConfig::default().l2a_availability_date,
            classifier_dir: None,
            metrics_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let tiles = ObjectStorageConfig {
            endpoint: env_opt("S3_ENDPOINT").or(defaults.tiles.endpoint),
            bucket: env_or("S3_BUCKET", defaults.tiles.bucket)?,
            access_key_id: env_opt("S3_ACCESS_KEY").or(defaults.tiles.access_key_id),
            secret_access_key: env_opt("S3_SECRET_KEY").or(defaults.tiles.secret_access_key),
            region: env_or("S3_REGION", defaults.tiles.region)?,
            allow_http: env_or("S3_ALLOW_HTTP", defaults.tiles.allow_http)?,
            requester_pays: false,
        };

        let config = Self {
            database_url: env_or("DATABASE_URL", defaults.database_url)?,
            tiles,
            l1c_bucket: env_or("L1C_BUCKET", defaults.l1c_bucket)?,
            l2a_bucket: env_or("L2A_BUCKET", defaults.l2a_bucket)?,
            scene_region: env_or("SCENE_REGION", defaults.scene_region)?,
            redis_url: env_opt("REDIS_URL"),
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency)?,
            task_timeout_secs: env_or("TASK_TIMEOUT_SECS", defaults.task_timeout_secs)?,
            max_scene_retries: env_or("MAX_SCENE_RETRIES", defaults.max_scene_retries)?,
            sen2cor_binary: env_or("SEN2COR_BINARY", defaults.sen2cor_binary)?,
            product_download_binary: env_or(
                "PRODUCT_DOWNLOAD_BINARY",
                defaults.product_download_binary,
            )?,
            gdal_translate_binary: env_or("GDAL_TRANSLATE_BINARY", defaults.gdal_translate_binary)?,
            work_dir: env_opt("WORK_DIR").map(PathBuf::from),
            l2a_availability_date: env_or("L2A_AVAILABILITY_DATE", defaults.l2a_availability_date)?,
            classifier_dir: env_opt("CLASSIFIER_DIR").map(PathBuf::from),
            metrics_addr: env_opt("METRICS_ADDR")
                .map(|v| v.parse().with_context(|| format!("Invalid METRICS_ADDR '{}'", v)))
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.task_timeout_secs == 0 {
            anyhow::bail!("task_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn l1c_storage(&self) -> ObjectStorageConfig {
        ObjectStorageConfig::public_bucket(&self.l1c_bucket, &self.scene_region, false)
    }

    pub fn l2a_storage(&self) -> ObjectStorageConfig {
        ObjectStorageConfig::public_bucket(&self.l2a_bucket, &self.scene_region, true)
    }

    pub fn toolchain(&self) -> ToolchainConfig {
        ToolchainConfig {
            sen2cor_binary: self.sen2cor_binary.clone(),
            product_download_binary: self.product_download_binary.clone(),
            gdal_translate_binary: self.gdal_translate_binary.clone(),
        }
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            work_dir: self.work_dir.clone(),
            l2a_availability_date: self.l2a_availability_date,
            ..IngestConfig::default()
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env_opt(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, value, e)),
        None => Ok(default),
    }
}
