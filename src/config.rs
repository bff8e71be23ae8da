use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Result;

/// Node settings, read from a JSON file. Missing fields fall back to the
/// values in `constants`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub wallet_listen: String,
    pub miner_listen: String,
    pub wallet_peers: Vec<String>,
    pub miner_peers: Vec<String>,
    pub max_message_bytes: usize,
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from(DATA_DIR),
            wallet_listen: WALLET_SERVER_ADDR.to_string(),
            miner_listen: MINER_SERVER_ADDR.to_string(),
            wallet_peers: Vec::new(),
            miner_peers: Vec::new(),
            max_message_bytes: MAX_MESSAGE_BYTES,
            max_connections: MAX_CONNECTIONS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        info!("loading config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(p) => Config::load(p),
            None => Ok(Config::default()),
        }
    }
}
