use std::fs;
use std::io;
use std::path::Path;

use rift_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PORT: u16 = 25565;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(contents: &str) -> io::Result<Self> {
        let parsed = toml::from_str::<Self>(contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to deserialize server config: {e}"),
            )
        })?;
        Ok(Self {
            port: parsed.port,
            engine: parsed.engine.sanitize(),
        })
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load_or_default(path: Option<&Path>) -> io::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(err) => Err(err),
        }
    }
}
