//! Subcommand handlers and output formatting

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use colored::*;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eth3bus::{BusConfig, BusConnection, Command, DeviceRecord, Packet};

use crate::shutdown::stop_signal;

/// Accepts `49`, `0x31` or `0X0031`
pub fn parse_address(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid bus address '{s}': {e}"))
}

/// Command name or numeric code
pub fn parse_command(s: &str) -> Result<Command, String> {
    s.parse::<Command>().map_err(|e| e.to_string())
}

/// Address → device label; zones sharing an address are joined
pub fn device_names(records: &[DeviceRecord]) -> HashMap<u16, String> {
    let mut names: HashMap<u16, String> = HashMap::new();
    for record in records {
        names
            .entry(record.address)
            .and_modify(|label| {
                label.push_str(", ");
                label.push_str(&record.name);
            })
            .or_insert_with(|| record.name.clone());
    }
    names
}

/// One line of `watch --json` output
#[derive(Debug, Serialize)]
struct PacketEvent<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<&'a str>,
    #[serde(flatten)]
    packet: &'a Packet,
}

fn print_packet(packet: &Packet, names: &HashMap<u16, String>, json: bool) -> Result<()> {
    let device = names.get(&packet.destination).map(String::as_str);

    if json {
        let event = PacketEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            device,
            packet,
        };
        println!("{}", serde_json::to_string(&event)?);
        return Ok(());
    }

    let command = match packet.command {
        Command::Ack => packet.command.to_string().green(),
        Command::Nack => packet.command.to_string().red(),
        _ => packet.command.to_string().cyan(),
    };
    let label = device.map(|name| format!(" [{name}]")).unwrap_or_default();
    println!(
        "{} {:>12} src={:#06X} dst={:#06X}{} data1={:3} data2={:3}",
        Utc::now().format("%H:%M:%S%.3f").to_string().dimmed(),
        command,
        packet.source,
        packet.destination,
        label.bold(),
        packet.data1,
        packet.data2
    );
    Ok(())
}

fn print_reply(packet: &Packet) {
    println!(
        "{} {} from {:#06X}: data1={} data2={}",
        "✓".green(),
        packet.command,
        packet.destination,
        packet.data1,
        packet.data2
    );
}

pub async fn enumerate(bus: &BusConnection) -> Result<()> {
    bus.enumerate().await.context("Enumeration failed")?;
    println!("{} Enumeration completed", "✓".green());
    Ok(())
}

pub async fn read(bus: &BusConnection, address: u16, register: u8) -> Result<()> {
    let reply = bus
        .read(address, register)
        .await
        .with_context(|| format!("READ {register} from {address:#06X} failed"))?;
    print_reply(&reply);
    Ok(())
}

pub async fn write(bus: &BusConnection, address: u16, register: u8, value: u8) -> Result<()> {
    let reply = bus
        .write(address, register, value)
        .await
        .with_context(|| format!("WRITE {register}={value} to {address:#06X} failed"))?;
    print_reply(&reply);
    Ok(())
}

pub async fn send(
    bus: &BusConnection,
    address: u16,
    command: Command,
    data1: u8,
    data2: u8,
    no_ack: bool,
) -> Result<()> {
    if no_ack {
        bus.send_fire_and_forget(address, command, data1, data2)
            .await
            .with_context(|| format!("{command} to {address:#06X} failed"))?;
        println!("{} {} sent to {:#06X}", "✓".green(), command, address);
    } else {
        let reply = bus
            .send_acknowledged(address, command, data1, data2)
            .await
            .with_context(|| format!("{command} to {address:#06X} failed"))?;
        print_reply(&reply);
    }
    Ok(())
}

/// Print inbound packets until Ctrl+C/SIGTERM
pub async fn watch(
    bus: &BusConnection,
    config: &BusConfig,
    json: bool,
    enumerate_every: Option<Duration>,
) -> Result<()> {
    let names = device_names(&config.devices);
    let mut packets = bus.subscribe();
    let token = CancellationToken::new();

    // The gateway only talks to connected clients; enumeration opens the link
    let periodic = match enumerate_every {
        Some(period) => Some(bus.spawn_periodic_enumeration(period, token.clone())),
        None => {
            if let Err(e) = bus.enumerate().await {
                warn!("Initial enumeration failed: {}", e);
            }
            None
        },
    };

    info!("Watching {} (Ctrl+C to stop)", config.gateway_addr());
    let stop = stop_signal();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            signal = &mut stop => {
                info!("{} received, stopping watch", signal);
                break;
            },
            received = packets.recv() => match received {
                Some(packet) => print_packet(&packet, &names, json)?,
                None => {
                    warn!("Connection closed");
                    break;
                },
            },
        }
    }

    token.cancel();
    if let Some(task) = periodic {
        let _ = task.await;
    }
    Ok(())
}
