use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use trove_core::{
    CharmStoreParams, Channel, DEFAULT_STORE_URL, Result, StoreClientBuilder, TroveError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub local_repository: Option<PathBuf>,
    #[serde(default)]
    pub disable_stats: bool,
    #[serde(default)]
    pub min_multipart_upload_size: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Sent as `Trove-Metadata: key=value` headers.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_cache_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("trove"),
        None => PathBuf::from(".trove-cache"),
    }
}

impl Config {
    /// Loads `path` (or `trove.{yaml,toml,json}` in the working directory,
    /// if present) and applies `TROVE_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => ::config::File::with_name(path),
            None => ::config::File::with_name("trove").required(false),
        };
        let settings = ::config::Config::builder()
            .add_source(file)
            .add_source(::config::Environment::with_prefix("TROVE"))
            .build()
            .map_err(|e| TroveError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TroveError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn channel(&self) -> Result<Option<Channel>> {
        self.channel
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(Channel::parse)
            .transpose()
    }

    pub fn client_builder(&self) -> Result<StoreClientBuilder> {
        let mut builder = StoreClientBuilder::new().url(&self.store_url);
        if let Some(user) = &self.user {
            builder = builder.user(user);
        }
        if let Some(password) = &self.password {
            builder = builder.password(password);
        }
        if let Some(channel) = self.channel()? {
            builder = builder.channel(channel);
        }
        if self.disable_stats {
            builder = builder.disable_stats();
        }
        if let Some(size) = self.min_multipart_upload_size {
            builder = builder.min_multipart_upload_size(size);
        }
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        for (key, value) in &self.metadata {
            builder = builder.header("Trove-Metadata", format!("{}={}", key, value));
        }
        Ok(builder)
    }

    pub fn store_params(&self) -> Result<CharmStoreParams> {
        Ok(CharmStoreParams {
            client: self.client_builder()?,
            cache_dir: self.cache_dir.clone(),
        })
    }
}
