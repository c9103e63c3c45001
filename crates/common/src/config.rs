use serde::{Deserialize, Serialize};

use place_canvas::CanvasConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub store: StoreConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File { data_dir: String },
    Redis { url: String },
}

impl std::fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreConfig::Memory => write!(f, "memory"),
            StoreConfig::File { data_dir } => write!(f, "file:{data_dir}"),
            StoreConfig::Redis { .. } => write!(f, "redis"),
        }
    }
}

pub fn load_config<T: for<'de> Deserialize<'de>>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("read config {path}: {err}"))?;
    let config = toml::from_str(&content)?;
    Ok(config)
}
