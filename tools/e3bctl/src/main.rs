//! e3bctl - Eth3Bus gateway command line tool
//!
//! Sends requests to devices behind an Eth3Bus gateway and watches the
//! traffic it forwards.

mod commands;
mod logging;
mod shutdown;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use eth3bus::{BusConfig, BusConnection, Command};

use crate::commands::{parse_address, parse_command};

#[derive(Parser)]
#[command(name = "e3bctl")]
#[command(about = "Eth3Bus gateway control tool")]
#[command(long_about = "Eth3Bus gateway control tool

Examples:
  e3bctl --host 192.168.1.35 enumerate      # Discover devices
  e3bctl read 0x31 1                        # Read register 1 of device 49
  e3bctl write 49 3 5                       # Write 5 to register 3
  e3bctl send 49 read-eeprom 2              # Any command, waits for ACK
  e3bctl send 49 write 3 5 --no-ack         # Fire-and-forget
  e3bctl watch --json                       # Stream every packet

Configuration comes from --config (YAML) and ETH3BUS_* environment variables.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// YAML configuration file
    #[arg(short, long, global = true, env = "ETH3BUS_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway host (overrides configuration)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Gateway port (overrides configuration)
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast a discovery request and wait for both acknowledgments
    Enumerate,

    /// Acknowledged READ of a device register
    Read {
        /// Device address (decimal or 0x hex)
        #[arg(value_parser = parse_address)]
        address: u16,
        /// Register
        register: u8,
    },

    /// Acknowledged WRITE of a device register
    Write {
        /// Device address (decimal or 0x hex)
        #[arg(value_parser = parse_address)]
        address: u16,
        /// Register
        register: u8,
        /// Value
        value: u8,
    },

    /// Send any command
    Send {
        /// Device address (decimal or 0x hex)
        #[arg(value_parser = parse_address)]
        address: u16,
        /// Command name (read, write-eeprom, ...) or numeric code
        #[arg(value_parser = parse_command)]
        command: Command,
        #[arg(default_value_t = 0)]
        data1: u8,
        #[arg(default_value_t = 0)]
        data2: u8,
        /// Don't wait for an ACK/NACK
        #[arg(long)]
        no_ack: bool,
    },

    /// Print every packet the gateway forwards until Ctrl+C
    Watch {
        /// One JSON object per line
        #[arg(long)]
        json: bool,
        /// Re-enumerate every N seconds (default: configured period)
        #[arg(long, value_name = "SECS")]
        enumerate_every: Option<u64>,
        /// Enumerate once at startup only
        #[arg(long, conflicts_with = "enumerate_every")]
        once: bool,
    },

    /// Print the effective configuration as YAML
    Config,
}

fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = BusConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    logging::init(cli.verbose, !cli.no_color)?;

    let config = load_config(&cli)?;

    if let Commands::Config = cli.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let bus = BusConnection::new(config.clone()).context("Failed to start bus connection")?;

    let result = match cli.command {
        Commands::Enumerate => commands::enumerate(&bus).await,
        Commands::Read { address, register } => commands::read(&bus, address, register).await,
        Commands::Write {
            address,
            register,
            value,
        } => commands::write(&bus, address, register, value).await,
        Commands::Send {
            address,
            command,
            data1,
            data2,
            no_ack,
        } => commands::send(&bus, address, command, data1, data2, no_ack).await,
        Commands::Watch {
            json,
            enumerate_every,
            once,
        } => {
            let period = if once {
                None
            } else {
                Some(
                    enumerate_every
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| config.enumeration_period()),
                )
            };
            commands::watch(&bus, &config, json, period).await
        },
        Commands::Config => Ok(()),
    };

    bus.shutdown().await;
    result
}
