use std::path::PathBuf;

use thiserror::Error;

/// Fatal misconfiguration discovered while assembling a [`ServerConfig`](crate::config::ServerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field 'device'")]
    MissingDevice,
    #[error("missing required field 'socket'")]
    MissingSocket,
    #[error(
        "invalid baudrate {0}; must be one of 50, 75, 110, 134, 150, 200, 300, 600, 1200, \
         1800, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400"
    )]
    InvalidBaudrate(u32),
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Recoverable broker errors surfaced from [`submit`](crate::broker::Core::submit)
/// and friends. None of these are fatal to the daemon.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to queue command: allocation failed")]
    QueueAllocationFailed,
}
