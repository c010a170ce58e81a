// ========================================
// config.rs - Connection and capture configuration
// ========================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

use crate::error::{CaptureError, Result};

pub const ENV_DATABASE: &str = "ROWTRAIL_DATABASE";
pub const ENV_MAX_CONNECTIONS: &str = "ROWTRAIL_MAX_CONNECTIONS";
pub const ENV_BUSY_TIMEOUT_SECS: &str = "ROWTRAIL_BUSY_TIMEOUT_SECS";
pub const ENV_REFRESH_ON_CONNECT: &str = "ROWTRAIL_REFRESH_ON_CONNECT";

const DEFAULT_FILE_NAME: &str = "rowtrail.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    /// `:memory:` (or `sqlite::memory:`) selects an in-memory database;
    /// anything else is a file path, with an optional `sqlite://` prefix.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            ":memory:" | "sqlite::memory:" => DatabaseLocation::Memory,
            path => DatabaseLocation::File(PathBuf::from(path.trim_start_matches("sqlite://"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub database: DatabaseLocation,
    /// Ignored for in-memory databases, which always use one connection.
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Regenerate triggers of bindings whose table columns changed.
    pub refresh_on_connect: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::File(default_database_path()),
            max_connections: 4,
            busy_timeout: Duration::from_secs(15),
            refresh_on_connect: true,
        }
    }
}

impl CaptureConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database: DatabaseLocation::Memory,
            max_connections: 1,
            ..Self::default()
        }
    }

    /// Defaults overridden by `ROWTRAIL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = env::var(ENV_DATABASE) {
            if !raw.trim().is_empty() {
                config.database = DatabaseLocation::parse(&raw);
            }
        }

        if let Ok(raw) = env::var(ENV_MAX_CONNECTIONS) {
            let n: u32 = raw.trim().parse().map_err(|_| {
                CaptureError::Config(format!("{} must be a positive integer, got '{}'", ENV_MAX_CONNECTIONS, raw))
            })?;
            if n == 0 {
                return Err(CaptureError::Config(format!("{} must be at least 1", ENV_MAX_CONNECTIONS)));
            }
            config.max_connections = n;
        }

        if let Ok(raw) = env::var(ENV_BUSY_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                CaptureError::Config(format!("{} must be a number of seconds, got '{}'", ENV_BUSY_TIMEOUT_SECS, raw))
            })?;
            config.busy_timeout = Duration::from_secs(secs);
        }

        if let Ok(raw) = env::var(ENV_REFRESH_ON_CONNECT) {
            config.refresh_on_connect = parse_flag(&raw).ok_or_else(|| {
                CaptureError::Config(format!("{} must be true/false, got '{}'", ENV_REFRESH_ON_CONNECT, raw))
            })?;
        }

        Ok(config)
    }

    pub(crate) fn effective_max_connections(&self) -> u32 {
        match self.database {
            // Each connection to :memory: is its own database.
            DatabaseLocation::Memory => 1,
            DatabaseLocation::File(_) => self.max_connections.max(1),
        }
    }
}

/// `<data dir>/rowtrail.db`, falling back to the working directory when the
/// platform has no home directory.
pub fn default_database_path() -> PathBuf {
    ProjectDirs::from("org", "rowtrail", "rowtrail")
        .map(|dirs| dirs.data_dir().join(DEFAULT_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_NAME))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
