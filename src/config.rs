use std::path::{Path, PathBuf};

use serde::Deserialize;
use serialport::{DataBits, Parity, StopBits};

use crate::cli::{DataBitsOpt, ParityOpt, Serve, StopBitsOpt};
use crate::error::ConfigError;

/// The fixed set of baud rates the original controller's serial stack accepts.
/// Anything outside this set is a fatal configuration error.
const ALLOWED_BAUDRATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400,
];

/// Serial framing settings captured once at startup and reapplied verbatim
/// on every reopen, playing the role of the original's `struct termios`.
#[derive(Debug, Clone, Copy)]
pub struct SerialSettings {
    pub baudrate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

/// Fully resolved daemon configuration: the values an external config
/// loader would hand to the core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub serial_device_path: PathBuf,
    pub serial_settings: SerialSettings,
    pub socket_path: PathBuf,
    pub hook_device_reset: Option<PathBuf>,
    pub foreground: bool,
}

/// Shape of an optional TOML config file, mirroring the `device` /
/// `baudrate` / `socket` / `hooks.reset` keys the original read via UCL.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    device: Option<PathBuf>,
    baudrate: Option<u32>,
    socket: Option<PathBuf>,
    hooks: Option<FileHooks>,
}

#[derive(Debug, Deserialize, Default)]
struct FileHooks {
    reset: Option<PathBuf>,
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source,
    })
}

impl ServerConfig {
    /// Merges CLI flags over an optional config file; CLI values win.
    pub fn from_cli(serve: &Serve) -> Result<Self, ConfigError> {
        let file = match &serve.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };

        let serial_device_path = serve
            .serial
            .clone()
            .or(file.device)
            .ok_or(ConfigError::MissingDevice)?;

        let socket_path = serve
            .socket
            .clone()
            .or(file.socket)
            .ok_or(ConfigError::MissingSocket)?;

        let baudrate = serve.baud.or(file.baudrate).unwrap_or(115_200);
        if !ALLOWED_BAUDRATES.contains(&baudrate) {
            return Err(ConfigError::InvalidBaudrate(baudrate));
        }

        let hook_device_reset = serve
            .reset_hook
            .clone()
            .or_else(|| file.hooks.and_then(|h| h.reset));

        Ok(ServerConfig {
            serial_device_path,
            serial_settings: SerialSettings {
                baudrate,
                data_bits: DataBits::from(serve.data_bits.clone()),
                parity: Parity::from(serve.parity.clone()),
                stop_bits: StopBits::from(serve.stop_bits.clone()),
            },
            socket_path,
            hook_device_reset,
            foreground: serve.foreground,
        })
    }
}
