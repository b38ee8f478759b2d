use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{alpaca::envelope::Envelope, config::Config};

/// The command line interface for the SV241 Alpaca gateway.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Serve Alpaca on this port instead of the configured one
    #[arg(long)]
    pub port: Option<u16>,

    /// Use this serial port instead of the configured one
    #[arg(long)]
    pub serial: Option<String>,

    /// Talk to a simulated SV241 instead of a serial port
    #[arg(long)]
    pub mock: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// List the serial ports on this machine.
    ListPorts,
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example Alpaca response.
    Envelope,

    /// Show an example Alpaca error response.
    ErrorEnvelope,
}

/// Run a subcommand, printing to stdout.
pub fn handle_command(command: Commands) -> Result<(), crate::error::Error> {
    match command {
        Commands::Examples(example) => {
            let output = match example {
                Examples::Config => Config::example().serialize_pretty(),
                Examples::Envelope => pretty(&Envelope::example()),
                Examples::ErrorEnvelope => pretty(&Envelope::example_error()),
            };

            println!("{output}");
        }
        Commands::ListPorts => {
            let ports = serialport::available_ports()
                .map_err(|e| crate::error::Error::Server(format!("Could not list ports: {e}")))?;

            if ports.is_empty() {
                println!("No serial ports found");
            }

            for port in ports {
                match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => println!(
                        "{} (USB {:04x}:{:04x}{})",
                        port.port_name,
                        usb.vid,
                        usb.pid,
                        usb.product.map(|p| format!(", {p}")).unwrap_or_default()
                    ),
                    _ => println!("{}", port.port_name),
                }
            }
        }
    }

    Ok(())
}

fn pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("Could not serialize: {e}"))
}
