use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

// Environment variables read once at startup.
pub const ENV_BIND_ADDR: &str = "OLLACHAT_BIND_ADDR";
pub const ENV_DATABASE_PATH: &str = "OLLACHAT_DB_PATH";
pub const ENV_OLLAMA_URL: &str = "OLLAMA_API_URL";

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Runtime settings for the server binary, resolved from the environment
/// with defaults that suit a local developer setup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub ollama_url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = match std::env::var(ENV_BIND_ADDR) {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid {}: {}", ENV_BIND_ADDR, raw))?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 3000)),
        };

        let database_path = std::env::var(ENV_DATABASE_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ollachat.sqlite"));

        let ollama_url = std::env::var(ENV_OLLAMA_URL)
            .unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bind_addr,
            database_path,
            ollama_url,
        })
    }
}
