use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::annotation::AnnotationOptions;
use crate::error::GenodexError;
use crate::index::Visibility;
use crate::ingest::IngestOptions;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "genodex.json";
pub const INDEX_URL_ENV: &str = "GENODEX_INDEX_URL";
pub const REMOTE_URL_ENV: &str = "GENODEX_REMOTE_URL";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub preload: PreloadSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub negative_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IndexSection {
    pub url: Option<String>,
    pub batch_size: Option<usize>,
    pub visibility: Option<Visibility>,
    pub optimize_writes: Option<bool>,
    pub refresh_every_rows: Option<u64>,
    pub refresh_every_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RemoteSection {
    pub base_url: Option<String>,
    pub subpath: Option<String>,
    pub feature_type: Option<String>,
    pub id_attribute: Option<String>,
    pub alt_attribute: Option<String>,
    pub alt_prefix: Option<String>,
    pub scratch_dir: Option<Utf8PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub connection_base_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PreloadSection {
    pub delay_ms: Option<u64>,
    pub failure_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IngestSection {
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub index_url: String,
    pub index_timeout: Duration,
    pub remote_url: String,
    pub remote_timeout: Duration,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub visibility: Visibility,
    pub optimize_writes: bool,
    pub refresh_every_rows: Option<u64>,
    pub refresh_every: Option<Duration>,
    pub annotations: AnnotationOptions,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    pub fn ingest_options(&self, index: &str) -> IngestOptions {
        IngestOptions {
            index: index.to_string(),
            batch_size: self.batch_size,
            chunk_size: self.chunk_size,
            visibility: self.visibility,
            optimize_writes: self.optimize_writes,
            refresh_every_rows: self.refresh_every_rows,
            refresh_every: self.refresh_every,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `genodex.json` in the working directory when present.
    /// Without either, defaults apply.
    pub fn resolve(path: Option<&Utf8Path>) -> Result<ResolvedConfig, GenodexError> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let default_path = Utf8Path::new(DEFAULT_CONFIG_FILE);
                if default_path.as_std_path().exists() {
                    Self::read(default_path)?
                } else {
                    Config::default()
                }
            }
        };
        let mut resolved = Self::resolve_config(config)?;
        if let Some(url) = env_override(INDEX_URL_ENV) {
            resolved.index_url = url;
        }
        if let Some(url) = env_override(REMOTE_URL_ENV) {
            resolved.remote_url = url;
        }
        Ok(resolved)
    }

    fn read(path: &Utf8Path) -> Result<Config, GenodexError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| GenodexError::ConfigRead(path.as_std_path().to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| GenodexError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, GenodexError> {
        let defaults = AnnotationOptions::default();
        let retry_defaults = RetryPolicy::default();
        let scratch_dir = match config.remote.scratch_dir {
            Some(dir) => dir.into_std_path_buf(),
            None => default_scratch_dir()?,
        };

        let annotations = AnnotationOptions {
            subpath: config.remote.subpath.unwrap_or(defaults.subpath),
            feature_type: config.remote.feature_type.unwrap_or(defaults.feature_type),
            id_attribute: config.remote.id_attribute.unwrap_or(defaults.id_attribute),
            alt_attribute: config.remote.alt_attribute.unwrap_or(defaults.alt_attribute),
            alt_prefix: config.remote.alt_prefix.unwrap_or(defaults.alt_prefix),
            scratch_dir,
            negative_ttl: config.negative_cache_ttl_secs.map(Duration::from_secs),
            preload_delay: config
                .preload
                .delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.preload_delay),
            preload_failure_delay: config
                .preload
                .failure_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.preload_failure_delay),
        };

        let retry = RetryPolicy {
            max_attempts: config
                .retry
                .max_attempts
                .unwrap_or(retry_defaults.max_attempts),
            base_delay: config
                .retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.base_delay),
            connection_base_delay: config
                .retry
                .connection_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.connection_base_delay),
            multiplier: config.retry.multiplier.unwrap_or(retry_defaults.multiplier),
            max_delay: config
                .retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_delay),
        };

        Ok(ResolvedConfig {
            index_url: config
                .index
                .url
                .unwrap_or_else(|| "http://localhost:9200".to_string()),
            index_timeout: Duration::from_secs(config.index.timeout_secs.unwrap_or(120)),
            remote_url: config
                .remote
                .base_url
                .unwrap_or_else(|| "http://localhost:8080/genomes".to_string()),
            remote_timeout: Duration::from_secs(config.remote.timeout_secs.unwrap_or(300)),
            batch_size: config.index.batch_size.unwrap_or(500).max(1),
            chunk_size: config.ingest.chunk_size.unwrap_or(10_000).max(1),
            visibility: config.index.visibility.unwrap_or_default(),
            optimize_writes: config.index.optimize_writes.unwrap_or(true),
            refresh_every_rows: config.index.refresh_every_rows,
            refresh_every: config.index.refresh_every_secs.map(Duration::from_secs),
            annotations,
            retry,
        })
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn default_scratch_dir() -> Result<std::path::PathBuf, GenodexError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".cache").join("genodex").join("scratch"))
        .ok_or_else(|| GenodexError::Filesystem("unable to resolve cache directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.batch_size, 500);
        assert_eq!(resolved.annotations.feature_type, "CDS");
        assert_eq!(resolved.visibility, Visibility::BestEffort);
        assert!(resolved.optimize_writes);
        assert!(resolved.annotations.negative_ttl.is_none());
    }
}
