use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serialport::{DataBits, Parity, StopBits};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available serial ports
    Ports {
        /// Include non-USB ports as well
        #[arg(long)]
        all: bool,
        /// Show detailed metadata
        #[arg(long)]
        verbose: bool,
    },
    /// Run the broker daemon
    Serve(Serve),
}

#[derive(Parser, Clone, Debug)]
pub struct Serve {
    /// Serial device node to broker access to (e.g. /dev/ttyUSB0). Required
    /// unless supplied via --config.
    #[arg(long)]
    pub serial: Option<PathBuf>,

    /// Baud rate; must be one of the fixed set the device firmware supports.
    #[arg(long)]
    pub baud: Option<u32>,

    /// Filesystem path for the client-facing Unix domain socket. Required
    /// unless supplied via --config.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Data bits
    #[arg(long, value_enum, default_value_t = DataBitsOpt::Eight)]
    pub data_bits: DataBitsOpt,

    /// Parity
    #[arg(long, value_enum, default_value_t = ParityOpt::None)]
    pub parity: ParityOpt,

    /// Stop bits
    #[arg(long, value_enum, default_value_t = StopBitsOpt::One)]
    pub stop_bits: StopBitsOpt,

    /// Executable invoked with no arguments during port reset
    #[arg(long)]
    pub reset_hook: Option<PathBuf>,

    /// Optional TOML config file; CLI flags override values it supplies
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also log to stderr instead of only the configured subscriber target
    #[arg(long)]
    pub foreground: bool,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum DataBitsOpt {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBitsOpt> for DataBits {
    fn from(v: DataBitsOpt) -> Self {
        match v {
            DataBitsOpt::Five => DataBits::Five,
            DataBitsOpt::Six => DataBits::Six,
            DataBitsOpt::Seven => DataBits::Seven,
            DataBitsOpt::Eight => DataBits::Eight,
        }
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum ParityOpt {
    None,
    Odd,
    Even,
}

impl From<ParityOpt> for Parity {
    fn from(v: ParityOpt) -> Self {
        match v {
            ParityOpt::None => Parity::None,
            ParityOpt::Odd => Parity::Odd,
            ParityOpt::Even => Parity::Even,
        }
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum StopBitsOpt {
    One,
    Two,
}

impl From<StopBitsOpt> for StopBits {
    fn from(v: StopBitsOpt) -> Self {
        match v {
            StopBitsOpt::One => StopBits::One,
            StopBitsOpt::Two => StopBits::Two,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_defaults() {
        let cli = Cli::parse_from([
            "koruza-brokerd",
            "serve",
            "--serial",
            "/dev/ttyUSB0",
            "--socket",
            "/tmp/koruza.sock",
        ]);
        match cli.command.unwrap() {
            Commands::Serve(s) => {
                assert_eq!(s.serial, Some(PathBuf::from("/dev/ttyUSB0")));
                assert_eq!(s.baud, None);
                assert_eq!(s.socket, Some(PathBuf::from("/tmp/koruza.sock")));
                assert!(matches!(s.data_bits, DataBitsOpt::Eight));
                assert!(matches!(s.parity, ParityOpt::None));
                assert!(matches!(s.stop_bits, StopBitsOpt::One));
                assert!(s.reset_hook.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let cli = Cli::parse_from([
            "koruza-brokerd",
            "serve",
            "--serial",
            "/dev/ttyUSB9",
            "--baud",
            "57600",
            "--socket",
            "/tmp/other.sock",
            "--data-bits",
            "seven",
            "--parity",
            "even",
            "--stop-bits",
            "two",
            "--reset-hook",
            "/usr/local/bin/reset",
        ]);
        match cli.command.unwrap() {
            Commands::Serve(s) => {
                assert_eq!(s.baud, Some(57_600));
                assert!(matches!(s.data_bits, DataBitsOpt::Seven));
                assert!(matches!(s.parity, ParityOpt::Even));
                assert!(matches!(s.stop_bits, StopBitsOpt::Two));
                assert_eq!(s.reset_hook, Some(PathBuf::from("/usr/local/bin/reset")));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn parse_ports() {
        let cli = Cli::parse_from(["koruza-brokerd", "ports", "--all"]);
        match cli.command.unwrap() {
            Commands::Ports { all, verbose } => {
                assert!(all);
                assert!(!verbose);
            }
            _ => panic!("expected ports"),
        }
    }
}
