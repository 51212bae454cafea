use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

use sprava_gateway::PresenceMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub presence_mode: PresenceMode,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("SPRAVA_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = lookup("SPRAVA_PORT")
            .unwrap_or_else(|| "8000".into())
            .parse()
            .context("SPRAVA_PORT must be a port number")?;
        let db_path = PathBuf::from(lookup("SPRAVA_DB_PATH").unwrap_or_else(|| "sprava.db".into()));
        let presence_mode = match lookup("SPRAVA_PRESENCE_MODE") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => PresenceMode::default(),
        };

        Ok(Self {
            host,
            port,
            db_path,
            presence_mode,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
