//! Configuration for the collector process.
//!
//! Loaded once at startup from a `.env`-style file in the directory named
//! by `PULSEONE_HOME` (or `--config`), following this codebase's existing
//! `Config::from_env` convention of nested sub-structs per concern.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub history: HistoryConfig,
    pub metrics_port: u16,
    pub log_level: String,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub active_selector: String,
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
}

impl CacheConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub database: String,
}

impl HistoryConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Process exit codes, per the CLI/environment contract.
pub mod exit_codes {
    pub const CLEAN_SHUTDOWN: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const SCHEMA_ERROR: i32 = 2;
    pub const STARTUP_ERROR: i32 = 3;
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_dir = env::var("PULSEONE_HOME")
            .ok()
            .or_else(|| Self::config_flag_from_args())
            .map(PathBuf::from);

        if let Some(dir) = &config_dir {
            let env_file = dir.join(".env");
            dotenv::from_path(&env_file).ok();
        } else {
            dotenv::dotenv().ok();
        }

        Ok(Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            database: DatabaseConfig {
                active_selector: env::var("ACTIVE_DATABASE").unwrap_or_else(|_| "sqlite".to_string()),
                sqlite_path: env::var("SQLITE_PATH").unwrap_or_else(|_| "sqlite://collector.db".to_string()),
            },
            cache: CacheConfig {
                host: env::var("CACHE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("CACHE_PORT").unwrap_or_else(|_| "6379".to_string()).parse().context("CACHE_PORT")?,
            },
            history: HistoryConfig {
                host: env::var("HISTORY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("HISTORY_PORT").unwrap_or_else(|_| "8086".to_string()).parse().context("HISTORY_PORT")?,
                token: env::var("HISTORY_TOKEN").ok(),
                database: env::var("HISTORY_DATABASE").unwrap_or_else(|_| "collector".to_string()),
            },
            metrics_port: env::var("METRICS_PORT").unwrap_or_else(|_| "9090".to_string()).parse().context("METRICS_PORT")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_path: env::var("LOG_PATH").ok().map(PathBuf::from),
        })
    }

    fn config_flag_from_args() -> Option<String> {
        let args: Vec<String> = env::args().collect();
        args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_url_combines_host_and_port() {
        let cfg = CacheConfig { host: "redis.local".into(), port: 6380 };
        assert_eq!(cfg.url(), "redis://redis.local:6380");
    }

    #[test]
    fn history_url_combines_host_and_port() {
        let cfg = HistoryConfig { host: "influx.local".into(), port: 8087, token: None, database: "db".into() };
        assert_eq!(cfg.url(), "http://influx.local:8087");
    }
}
