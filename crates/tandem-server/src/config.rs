use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Secrets that ship in sample `.env` files and must never reach a server.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "changeme", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = get("TANDEM_JWT_SECRET").context("TANDEM_JWT_SECRET is not set")?;
        let trimmed = jwt_secret.trim();
        if trimmed.is_empty() || PLACEHOLDER_SECRETS.contains(&trimmed) {
            bail!("TANDEM_JWT_SECRET is a placeholder; set a real secret");
        }

        let db_path = PathBuf::from(get("TANDEM_DB_PATH").unwrap_or_else(|| "tandem.db".into()));
        let host = get("TANDEM_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match get("TANDEM_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("TANDEM_PORT '{}' is not a port number", raw))?,
            None => 3000,
        };

        Ok(Self {
            jwt_secret,
            db_path,
            host,
            port,
        })
    }
}
