//! Layered settings: built-in defaults, then an optional TOML file, then
//! `POWCHAIN_*` environment variables.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pow::{ProofOfWork, DEFAULT_DIFFICULTY};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "powchain";

pub const ENV_PREFIX: &str = "POWCHAIN";

pub const DEFAULT_GENESIS_PAYLOAD: &str = "Genesis Block";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of the sled database.
    pub db_path: PathBuf,
    /// Leading zero bits required of a block hash. Only used when the chain is created.
    pub difficulty: u32,
    /// Largest nonce tried before mining gives up.
    pub max_nonce: u64,
    pub genesis_payload: String,
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./chain_db"),
            difficulty: DEFAULT_DIFFICULTY,
            max_nonce: u64::MAX,
            genesis_payload: DEFAULT_GENESIS_PAYLOAD.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn proof_of_work(&self) -> Result<ProofOfWork> {
        Ok(ProofOfWork::new(self.difficulty)?.with_max_nonce(self.max_nonce))
    }
}
