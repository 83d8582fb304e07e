mod broker;
mod cli;
mod config;
mod connection;
mod device_port;
mod error;
mod hook;
mod listener;
mod serial;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::broker::Broker;
use crate::cli::{Cli, Commands};
use crate::config::ServerConfig;
use crate::serial::list_available_ports;
use serialport::SerialPortType;

fn print_ports(all: bool, verbose: bool) {
    let ports = list_available_ports(all);
    if ports.is_empty() {
        println!("<no ports>");
        return;
    }
    for p in ports {
        if verbose {
            match p.port_type {
                SerialPortType::UsbPort(info) => {
                    println!(
                        "{}\tUSB vid:pid {:04x}:{:04x}\t{:?}\t{:?}",
                        p.port_name, info.vid, info.pid, info.product, info.manufacturer,
                    );
                }
                other => {
                    println!("{}\t{:?}", p.port_name, other);
                }
            }
        } else {
            println!("{}", p.port_name);
        }
    }
}

fn serve(serve: cli::Serve) -> Result<()> {
    let config = ServerConfig::from_cli(&serve).context("loading configuration")?;

    // --foreground only changes where logs go, stderr for an interactive
    // run versus stdout otherwise; it has no effect on broker behavior.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);
    if config.foreground {
        subscriber.with_writer(std::io::stderr).try_init().ok();
    } else {
        subscriber.with_writer(std::io::stdout).try_init().ok();
    }

    let broker = Broker::open(
        config.serial_device_path.clone(),
        config.serial_settings,
        config.hook_device_reset.clone(),
    )
    .with_context(|| format!("opening serial device {}", config.serial_device_path.display()))?;

    listener::run(&config.socket_path, broker)
        .with_context(|| format!("listening on {}", config.socket_path.display()))
}

fn main() -> Result<()> {
    // The broker writes to client sockets that may have already hung up;
    // without this, that write raises SIGPIPE and kills the process instead
    // of returning an EPIPE the writer thread can log and handle.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Ports { all, verbose }) => {
            print_ports(all, verbose);
            Ok(())
        }
        Some(Commands::Serve(args)) => serve(args),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    }
}
