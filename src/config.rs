use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 65535;
pub const DEFAULT_CACHE_FILE: &str = ".haven/cache.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: String,
    pub probe_timeout_ms: u64,
    pub refresh_interval_secs: u64,
    pub start_attempts: u32,
    pub start_interval_ms: u64,
    /// Where the fallback cache is persisted, relative to the working directory unless
    /// absolute. `None` keeps it in memory for the life of the process.
    pub cache_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: server_for_port(DEFAULT_PORT),
            probe_timeout_ms: 2000,
            refresh_interval_secs: 10,
            start_attempts: 10,
            start_interval_ms: 1000,
            cache_file: Some(PathBuf::from(DEFAULT_CACHE_FILE)),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Decode(format!("config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("probe_timeout_ms", self.probe_timeout_ms == 0),
            ("refresh_interval_secs", self.refresh_interval_secs == 0),
            ("start_attempts", self.start_attempts == 0),
        ];
        for (field, is_zero) in zero {
            if is_zero {
                return Err(Error::Validation(format!("{} must be greater than zero", field)));
            }
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Config {
        self.server = server_for_port(port);
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn start_interval(&self) -> Duration {
        Duration::from_millis(self.start_interval_ms)
    }
}

pub fn server_for_port(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Parse a user-entered port, accepting only 1024-65535.
pub fn parse_port(input: &str) -> Result<u16> {
    let invalid = || {
        Error::Validation(format!(
            "please enter a valid port number ({}-{}), got {:?}",
            MIN_PORT, MAX_PORT, input
        ))
    };
    let port: u32 = input.trim().parse().map_err(|_| invalid())?;
    if port < MIN_PORT as u32 || port > MAX_PORT as u32 {
        return Err(invalid());
    }
    Ok(port as u16)
}
