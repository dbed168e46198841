//! Process configuration, read from the environment or a `.env` file.

use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, bail};

const DEFAULT_DATABASE_URL: &str = "sqlite://chatrelay.db?mode=rwc";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,
    /// Presence events buffered per connection before a slow one lags.
    pub presence_buffer: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let config = Config {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned()),
            bind_addr: parse(&lookup, "BIND_ADDR", DEFAULT_BIND_ADDR)?,
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", "16")?,
            presence_buffer: parse(&lookup, "PRESENCE_BUFFER", "64")?,
        };

        if config.db_max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be at least 1");
        }
        if config.presence_buffer == 0 {
            bail!("PRESENCE_BUFFER must be at least 1");
        }
        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_owned());
    raw.parse()
        .with_context(|| format!("invalid {key}: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_addr, "0.0.0.0:5000".parse().unwrap());
        assert_eq!(config.db_max_connections, 16);
        assert_eq!(config.presence_buffer, 64);
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("DB_MAX_CONNECTIONS", "2"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.db_max_connections, 2);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config(&[("BIND_ADDR", "nowhere")]).is_err());
        assert!(config(&[("PRESENCE_BUFFER", "-1")]).is_err());
        assert!(config(&[("PRESENCE_BUFFER", "0")]).is_err());
        assert!(config(&[("DB_MAX_CONNECTIONS", "0")]).is_err());
    }
}
