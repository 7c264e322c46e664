use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MasterConfig {
    pub data_dir: PathBuf,
    pub http: HttpConf,
    pub heartbeat: HeartbeatConf,
    pub reconcile: ReconcileConf,
    pub correlator: CorrelatorConf,
    pub refresh: RefreshConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String, // ex: "0.0.0.0:8080"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConf {
    pub interval_secs: u64,
    pub fresh_window_secs: i64,
    pub offline_after_misses: u32,
    pub registry_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconcileConf {
    pub interval_secs: u64,
    pub registry_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorrelatorConf {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub call_timeout_secs: u64,
    pub stream_max_len: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RefreshConf {
    pub workers: usize,
    pub deadline_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            http: HttpConf::default(),
            heartbeat: HeartbeatConf::default(),
            reconcile: ReconcileConf::default(),
            correlator: CorrelatorConf::default(),
            refresh: RefreshConf::default(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self {
            interval_secs: 25,
            fresh_window_secs: 30,
            offline_after_misses: 3,
            registry_key: "firewall:heartbeats".into(),
        }
    }
}

impl Default for ReconcileConf {
    fn default() -> Self {
        Self { interval_secs: 60, registry_key: "firewall:portInfo".into() }
    }
}

impl Default for CorrelatorConf {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            retry_delay_ms: 2000,
            call_timeout_secs: 12,
            stream_max_len: 1000,
        }
    }
}

impl Default for RefreshConf {
    fn default() -> Self {
        Self { workers: 8, deadline_secs: 30 }
    }
}

impl HeartbeatConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ReconcileConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl CorrelatorConf {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl RefreshConf {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Parse un YAML de config ; un document vide donne la config par défaut
pub fn parse_config(txt: &str) -> Result<MasterConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(MasterConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

pub async fn load_config() -> MasterConfig {
    let path = std::env::var("FIREWALL_MASTER_CONFIG").unwrap_or_else(|_| "master.yaml".into());
    load_config_from(Path::new(&path)).await
}

/// Fichier absent, illisible ou invalide => config par défaut (avec warning)
pub async fn load_config_from(path: &Path) -> MasterConfig {
    if !path.exists() {
        warn!("[config] no {}, using default config", path.display());
        return MasterConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!("[config] cannot read {}: {e}, using default config", path.display());
            return MasterConfig::default();
        }
    };
    parse_config(&txt).unwrap_or_else(|e| {
        warn!("[config] {e}, using default config");
        MasterConfig::default()
    })
}
