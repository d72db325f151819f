//! Daemon configuration.
//!
//! Resolution chain per setting: CLI flag > env var > `relay.toml` in the
//! project directory > built-in default.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;
pub const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8900";

/// Optional `relay.toml` at the project root.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub heartbeat_secs: Option<u64>,
    pub health_addr: Option<String>,
    pub claude_path: Option<String>,
}

/// Load `relay.toml` if present. A missing file is not an error; a
/// malformed one is.
pub fn load_config_file(project_dir: &Path) -> Result<Option<ConfigFile>> {
    let path = project_dir.join("relay.toml");
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(config))
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub heartbeat_secs: u64,
    pub health_addr: SocketAddr,
    pub claude_path: String,
}

impl DaemonConfig {
    /// Merge CLI values over the config file over defaults. `claude_path`
    /// arrives already env-resolved (CLAUDE_PATH).
    pub fn resolve(
        cli_heartbeat: Option<u64>,
        cli_health_addr: Option<SocketAddr>,
        env_claude_path: String,
        file: Option<ConfigFile>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();

        let heartbeat_secs = cli_heartbeat
            .or(file.heartbeat_secs)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);

        let health_addr = match cli_health_addr {
            Some(addr) => addr,
            None => file
                .health_addr
                .as_deref()
                .unwrap_or(DEFAULT_HEALTH_ADDR)
                .parse()
                .context("invalid health_addr in relay.toml")?,
        };

        // CLAUDE_PATH env wins over the file unless it is the bare default.
        let claude_path = if env_claude_path != relay_store::RelayConfig::DEFAULT_AGENT {
            env_claude_path
        } else {
            file.claude_path.unwrap_or(env_claude_path)
        };

        Ok(Self {
            heartbeat_secs,
            health_addr,
            claude_path,
        })
    }
}
