//! Process configuration
//!
//! All configuration is read once from the environment at the composition
//! root and plumbed through construction. No module reads env vars on its
//! own and no import-time side effects exist.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Default listen address when `LISTEN_ADDR` is unset
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8382";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DATA_DIR is required but not set")]
    MissingDataDir,

    #[error("DATA_DIR is not a usable directory: {0}")]
    BadDataDir(String),

    #[error("Invalid LISTEN_ADDR: {0}")]
    BadListenAddr(String),
}

/// Server configuration, resolved from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory for server-owned state (host keys, `.opk/` config)
    pub data_dir: PathBuf,
    /// Address the HTTP/WebSocket edge binds to
    pub listen_addr: SocketAddr,
    /// Public origin browsers reach us at, e.g. `https://term.example.com`.
    /// Used to build the proxied OPK chooser/callback URLs.
    pub public_origin: String,
    /// Bearer token for the internal activity-log sink
    pub internal_auth_token: Option<String>,
    /// URL of the activity-log sink; activity logging is disabled when unset
    pub activity_log_url: Option<String>,
}

impl ServerConfig {
    /// Read configuration from the environment.
    ///
    /// `DATA_DIR` is required; everything else has a workable default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingDataDir)?;

        if let Err(e) = std::fs::create_dir_all(&data_dir) {
            return Err(ConfigError::BadDataDir(format!(
                "{}: {}",
                data_dir.display(),
                e
            )));
        }

        let listen_addr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::BadListenAddr(e.to_string()))?;

        let public_origin = std::env::var("PUBLIC_ORIGIN")
            .unwrap_or_else(|_| format!("http://{}", listen_addr));

        Ok(Self {
            data_dir,
            listen_addr,
            public_origin: public_origin.trim_end_matches('/').to_string(),
            internal_auth_token: std::env::var("INTERNAL_AUTH_TOKEN").ok(),
            activity_log_url: std::env::var("ACTIVITY_LOG_URL").ok(),
        })
    }

    /// Construct directly (used by tests and embedders)
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            listen_addr: DEFAULT_LISTEN_ADDR.parse().expect("default addr parses"),
            public_origin: format!("http://{}", DEFAULT_LISTEN_ADDR),
            internal_auth_token: None,
            activity_log_url: None,
        }
    }

    /// Directory for per-user host-key files
    pub fn hostkeys_dir(&self) -> PathBuf {
        self.data_dir.join("hostkeys")
    }

    /// The OPK configuration directory (`$DATA_DIR/.opk`)
    pub fn opk_dir(&self) -> PathBuf {
        self.data_dir.join(".opk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_has_no_trailing_slash() {
        let cfg = ServerConfig::with_data_dir(PathBuf::from("/tmp/x"));
        assert!(!cfg.public_origin.ends_with('/'));
    }

    #[test]
    fn derived_dirs() {
        let cfg = ServerConfig::with_data_dir(PathBuf::from("/data"));
        assert_eq!(cfg.hostkeys_dir(), PathBuf::from("/data/hostkeys"));
        assert_eq!(cfg.opk_dir(), PathBuf::from("/data/.opk"));
    }
}
