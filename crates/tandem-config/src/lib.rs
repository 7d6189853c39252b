//! Broker configuration.
//!
//! Defaults, deep-merged with an optional YAML file under the project's
//! planning directory, then env overrides. The pool section is optional:
//! when absent the reviewer pool is disabled and the core broker runs on its
//! own.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const ENV_CONFIG_DIR: &str = "TANDEM_CONFIG_DIR";
pub const ENV_WSL_DISTRO: &str = "TANDEM_WSL_DISTRO";
pub const ENV_REVIEWER_PROMPT: &str = "TANDEM_REVIEWER_PROMPT";
pub const ENV_CODEX_BIN: &str = "TANDEM_CODEX_BIN";

/// Directory under the project root holding the database and config file.
pub const PLANNING_DIR: &str = ".tandem";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DB_FILE: &str = "tandem.db";

/// Reviewer CLI models the pool is allowed to launch.
pub const MODEL_ALLOWLIST: &[&str] = &[
    "gpt-5-codex",
    "gpt-5.1-codex",
    "gpt-5.1-codex-max",
    "o3",
    "o4-mini",
];

pub const EFFORT_ALLOWLIST: &[&str] = &["low", "medium", "high"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip)]
    pub project_dir: PathBuf,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub model: String,
    #[serde(default = "default_effort")]
    pub reasoning_effort: String,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_seconds: u64,
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,
    #[serde(default = "default_spawn_cooldown")]
    pub spawn_cooldown_seconds: u64,
    #[serde(default = "default_scale_check")]
    pub scale_check_seconds: u64,
    /// Workspace the reviewer CLI is pointed at (`-C`); defaults to the
    /// project directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

fn default_effort() -> String {
    "medium".to_string()
}
fn default_max_pool_size() -> u32 {
    3
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_max_ttl() -> u64 {
    3600
}
fn default_claim_timeout() -> u64 {
    600
}
fn default_spawn_cooldown() -> u64 {
    10
}
fn default_scale_check() -> u64 {
    30
}

impl BrokerConfig {
    /// Load configuration for a project directory.
    ///
    /// Layering: built-in defaults, then `.tandem/config.yaml` if present
    /// (later layers override earlier via deep-merge), then validation.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut merged = defaults();

        let config_path = config_dir(project_dir).join(CONFIG_FILE);
        if config_path.exists() {
            let text = std::fs::read_to_string(&config_path)
                .with_context(|| format!("read config {:?}", config_path))?;
            let yaml_val: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parse yaml {:?}", config_path))?;
            let json_val =
                serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
            deep_merge(&mut merged, json_val);
        }

        let mut cfg: BrokerConfig =
            serde_json::from_value(merged).context("config deserialization failed")?;
        cfg.project_dir = project_dir.to_path_buf();

        if let Some(pool) = &cfg.pool {
            validate_pool(pool)?;
        }
        Ok(cfg)
    }

    pub fn db_path(&self) -> PathBuf {
        if let Ok(p) = std::env::var("TANDEM_DB_PATH") {
            return PathBuf::from(p);
        }
        config_dir(&self.project_dir).join(DB_FILE)
    }

    /// Platform data dir for broker/reviewer JSONL logs.
    pub fn log_dir(&self) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| self.project_dir.join(PLANNING_DIR))
            .join("tandem")
            .join("logs")
    }
}

/// `.tandem/` under the project, unless TANDEM_CONFIG_DIR overrides it.
pub fn config_dir(project_dir: &Path) -> PathBuf {
    match std::env::var(ENV_CONFIG_DIR) {
        Ok(p) => PathBuf::from(p),
        Err(_) => project_dir.join(PLANNING_DIR),
    }
}

fn defaults() -> Value {
    json!({
        "host": "127.0.0.1",
        "port": 8321,
        "pool": null,
    })
}

/// Validate the pool section. Called at startup; a bad value is a fatal
/// configuration error, not something to limp along with.
pub fn validate_pool(pool: &PoolConfig) -> Result<()> {
    if !MODEL_ALLOWLIST.contains(&pool.model.as_str()) {
        return Err(anyhow!(
            "pool.model '{}' is not on the allowlist {:?}",
            pool.model,
            MODEL_ALLOWLIST
        ));
    }
    if !EFFORT_ALLOWLIST.contains(&pool.reasoning_effort.as_str()) {
        return Err(anyhow!(
            "pool.reasoning_effort '{}' must be one of {:?}",
            pool.reasoning_effort,
            EFFORT_ALLOWLIST
        ));
    }
    if !(1..=10).contains(&pool.max_pool_size) {
        return Err(anyhow!(
            "pool.max_pool_size {} out of range [1, 10]",
            pool.max_pool_size
        ));
    }
    if pool.idle_timeout_seconds < 60 {
        return Err(anyhow!(
            "pool.idle_timeout_seconds {} below minimum 60",
            pool.idle_timeout_seconds
        ));
    }
    if pool.max_ttl_seconds < 300 {
        return Err(anyhow!(
            "pool.max_ttl_seconds {} below minimum 300",
            pool.max_ttl_seconds
        ));
    }
    if pool.claim_timeout_seconds < 60 {
        return Err(anyhow!(
            "pool.claim_timeout_seconds {} below minimum 60",
            pool.claim_timeout_seconds
        ));
    }
    Ok(())
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}
