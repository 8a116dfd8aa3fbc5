//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on values that don't parse.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

/// Which side of the queue this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Single process owning the store, no remote workers.
    Local,
    /// Owns the store and serves it to remote workers over HTTP.
    Server,
    /// Holds no store; every queue operation goes to `GENQ_SERVER_URL`.
    Worker,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Server => "server",
            Mode::Worker => "worker",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "server" => Ok(Mode::Server),
            "worker" => Ok(Mode::Worker),
            other => Err(Error::Config(format!(
                "GENQ_MODE must be local, server or worker, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub mode: Mode,
    pub database_url: SecretString,
    pub server_url: Option<String>,
    pub auth_token: Option<SecretString>,
    pub bind: SocketAddr,
    pub files_dir: PathBuf,
    pub flows_dir: PathBuf,
    pub webhook_timeout: Duration,
    pub net_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mode = match var("GENQ_MODE") {
            Some(mode) => mode.parse()?,
            None => Mode::Local,
        };

        let server_url = var("GENQ_SERVER_URL").filter(|u| !u.is_empty());
        if mode == Mode::Worker && server_url.is_none() {
            return Err(Error::Config(
                "GENQ_SERVER_URL is required when GENQ_MODE=worker".into(),
            ));
        }

        Ok(Self {
            mode,
            database_url: SecretString::from(
                var("DATABASE_URL").unwrap_or_else(|| "sqlite://genq.db".to_string()),
            ),
            server_url,
            auth_token: var("GENQ_AUTH_TOKEN")
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            bind: parsed_var(&var, "GENQ_BIND")?
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8288))),
            files_dir: var("GENQ_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("genq-files")),
            flows_dir: var("GENQ_FLOWS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("flows")),
            webhook_timeout: Duration::from_secs(
                parsed_var(&var, "GENQ_WEBHOOK_TIMEOUT_SECS")?.unwrap_or(3),
            ),
            net_timeout: Duration::from_secs(parsed_var(&var, "GENQ_NET_TIMEOUT_SECS")?.unwrap_or(15)),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parsed_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}
