use crate::error::AppError;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_DATABASE_PATH: &str = "data/stock-opname.db";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = lookup("DATABASE_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                tracing::warn!("DATABASE_PATH not set, using {}", DEFAULT_DATABASE_PATH);
                PathBuf::from(DEFAULT_DATABASE_PATH)
            });

        let host = lookup("HOST")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|e| AppError::Config(format!("invalid PORT {raw:?}: {e}")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            database_path,
            host,
            port,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid bind address: {e}")))
    }
}
