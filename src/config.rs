//! Server configuration
//!
//! Built from command-line arguments and environment variables:
//! - arg 1: bind address (default `127.0.0.1:8080`)
//! - arg 2: credential file (default: in-memory accounts)
//! - `CHAT_HISTORY_LIMIT`: keep only the most recent N broadcast lines

use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Environment variable bounding the history log
pub const HISTORY_LIMIT_VAR: &str = "CHAT_HISTORY_LIMIT";

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: String,
    /// JSON credential file, or None for in-memory accounts
    pub credentials_path: Option<PathBuf>,
    /// Maximum history lines, or None for unbounded
    pub history_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            credentials_path: None,
            history_limit: None,
        }
    }
}

impl ServerConfig {
    /// Read the process arguments and environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_parts(env::args().skip(1), env::var(HISTORY_LIMIT_VAR).ok())
    }

    /// Build from positional arguments (program name excluded) and the raw
    /// history limit value
    pub fn from_parts<I>(args: I, history_limit: Option<String>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let bind_addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let credentials_path = args.next().map(PathBuf::from);

        let history_limit = match history_limit {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => Some(limit),
                _ => return Err(ConfigError::InvalidHistoryLimit(raw)),
            },
            None => None,
        };

        Ok(Self {
            bind_addr,
            credentials_path,
            history_limit,
        })
    }
}
