use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::core::PipelineSettings;

const TABLE_NAME_ENV: &str = "MAILTRAIL_TABLE_NAME";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Target event table. Left optional here: the pipeline's guard decides
    /// whether an invocation may run without it.
    #[serde(default)]
    pub table_name: Option<String>,
    pub database_url: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,
    #[serde(default)]
    pub report_batch_item_failures: bool,
    #[serde(default = "default_create_table")]
    pub create_table: bool,
    #[serde(default)]
    pub purge: PurgeConfig,
}

impl Config {
    pub fn load(path_arg: Option<PathBuf>) -> Result<Self> {
        let config_path = path_arg.or_else(resolve_config_path).context(
            "config path not found (MAILTRAIL_CONFIG_PATH or mailtrail.yaml/mailtrail.yml)",
        )?;

        let mut config = load_config_yaml(&config_path)?;
        config.apply_env(non_empty_env(TABLE_NAME_ENV));
        config.normalize()?;
        Ok(config)
    }

    fn apply_env(
        &mut self,
        table_name: Option<String>,
    ) {
        if table_name.is_some() {
            self.table_name = table_name;
        }
    }

    fn normalize(&mut self) -> Result<()> {
        self.table_name = normalize_opt(self.table_name.take());
        self.listen = trim_owned(self.listen.clone());
        self.database_url = trim_owned(self.database_url.clone());

        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        if self.database_url.is_empty() {
            bail!("config missing `database_url`");
        }

        self.max_connections = self.max_connections.max(1);
        self.concurrency = self.concurrency.max(1);
        self.max_batch_bytes = self.max_batch_bytes.max(1);
        self.purge.normalize();

        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            table_name: self.table_name.clone(),
            concurrency: self.concurrency,
            report_batch_item_failures: self.report_batch_item_failures,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PurgeConfig {
    #[serde(default = "default_purge_enabled")]
    pub enabled: bool,
    #[serde(
        default = "default_purge_interval",
        deserialize_with = "mailtrail_helpers::de::deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(default = "default_purge_batch_size")]
    pub batch_size: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_purge_enabled(),
            interval: default_purge_interval(),
            batch_size: default_purge_batch_size(),
        }
    }
}

impl PurgeConfig {
    fn normalize(&mut self) {
        self.interval = self.interval.max(Duration::from_secs(1));
        self.batch_size = self.batch_size.max(1);
    }
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("MAILTRAIL_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut dirs = Vec::with_capacity(2);
    if let Some(home) = non_empty_env("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs.push(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    dirs.into_iter()
        .flat_map(|dir| [dir.join("mailtrail.yaml"), dir.join("mailtrail.yml")])
        .find(|candidate| candidate.exists())
}

fn default_listen() -> String {
    "0.0.0.0:2148".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_concurrency() -> usize {
    8
}

fn default_max_batch_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_create_table() -> bool {
    true
}

fn default_purge_enabled() -> bool {
    true
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_purge_batch_size() -> u32 {
    1000
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    normalize_opt(env::var(key).ok())
}
