//! Eth3Bus packet layout
//!
//! Outbound (client → gateway), 7 bytes:
//!
//! ```text
//! [src_hi][src_lo][dst_hi][dst_lo][cmd][data1][data2]
//! ```
//!
//! Inbound (gateway → client), 9 bytes. The first two bytes belong to the
//! gateway envelope and are ignored here:
//!
//! ```text
//! [ ? ][ ? ][cmd][src_hi][src_lo][dst_hi][dst_lo][data1][data2]
//! ```

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{BusError, Result};

/// Default gateway TCP port
pub const GATEWAY_PORT: u16 = 12347;

/// Size of a client → gateway frame
pub const CLIENT_PACKET_SIZE: usize = 7;

/// Size of a gateway → client frame
pub const SERVER_PACKET_SIZE: usize = 9;

/// Fixed source address used by this client
pub const CLIENT_ADDRESS: u16 = 0xFFFF;

/// Enumeration broadcast destination
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// Address the gateway and bus controller use to acknowledge enumeration
pub const ENUM_ACK_ADDRESS: u16 = 0x00FF;

/// ACKs required before an enumeration counts as complete
pub const ENUM_ACKS_REQUIRED: u8 = 2;

/// Bus command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Command {
    Ack,
    Nack,
    Read,
    Write,
    ReadEeprom,
    WriteEeprom,
    ReadAddr,
    WriteAddr,
    ReadType,
    Enum,
    /// Code outside the known set, passed through untouched
    Other(u8),
}

impl Command {
    /// Wire code
    pub const fn code(self) -> u8 {
        match self {
            Command::Ack => 1,
            Command::Nack => 2,
            Command::Read => 3,
            Command::Write => 4,
            Command::ReadEeprom => 5,
            Command::WriteEeprom => 6,
            Command::ReadAddr => 7,
            Command::WriteAddr => 8,
            Command::ReadType => 9,
            Command::Enum => 10,
            Command::Other(code) => code,
        }
    }

    /// Decode a wire code
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Command::Ack,
            2 => Command::Nack,
            3 => Command::Read,
            4 => Command::Write,
            5 => Command::ReadEeprom,
            6 => Command::WriteEeprom,
            7 => Command::ReadAddr,
            8 => Command::WriteAddr,
            9 => Command::ReadType,
            10 => Command::Enum,
            other => Command::Other(other),
        }
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        Command::from_code(code)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ack => write!(f, "ACK"),
            Command::Nack => write!(f, "NACK"),
            Command::Read => write!(f, "READ"),
            Command::Write => write!(f, "WRITE"),
            Command::ReadEeprom => write!(f, "READ_EEPROM"),
            Command::WriteEeprom => write!(f, "WRITE_EEPROM"),
            Command::ReadAddr => write!(f, "READ_ADDR"),
            Command::WriteAddr => write!(f, "WRITE_ADDR"),
            Command::ReadType => write!(f, "READ_TYPE"),
            Command::Enum => write!(f, "ENUM"),
            Command::Other(code) => write!(f, "CMD_{code}"),
        }
    }
}

impl FromStr for Command {
    type Err = BusError;

    /// Accepts a command name (`read`, `WRITE_EEPROM`, ...) or a numeric code
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(code) = s.parse::<u8>() {
            return Ok(Command::from_code(code));
        }
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "READ" => Ok(Command::Read),
            "WRITE" => Ok(Command::Write),
            "READ_EEPROM" => Ok(Command::ReadEeprom),
            "WRITE_EEPROM" => Ok(Command::WriteEeprom),
            "READ_ADDR" => Ok(Command::ReadAddr),
            "WRITE_ADDR" => Ok(Command::WriteAddr),
            "READ_TYPE" => Ok(Command::ReadType),
            "ENUM" => Ok(Command::Enum),
            _ => Err(BusError::config(format!("Unknown command: {s}"))),
        }
    }
}

/// Parsed bus packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub source: u16,
    pub destination: u16,
    pub command: Command,
    pub data1: u8,
    pub data2: u8,
}

impl Packet {
    /// Packet originating from this client
    pub fn outbound(destination: u16, command: Command, data1: u8, data2: u8) -> Self {
        Self {
            source: CLIENT_ADDRESS,
            destination,
            command,
            data1,
            data2,
        }
    }

    /// Enumeration broadcast
    pub fn enumeration() -> Self {
        Self::outbound(BROADCAST_ADDRESS, Command::Enum, 0, 0)
    }

    /// Encode as a client → gateway frame
    pub fn encode(&self) -> [u8; CLIENT_PACKET_SIZE] {
        let src = self.source.to_be_bytes();
        let dst = self.destination.to_be_bytes();
        [
            src[0],
            src[1],
            dst[0],
            dst[1],
            self.command.code(),
            self.data1,
            self.data2,
        ]
    }

    /// Decode a gateway → client frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() != SERVER_PACKET_SIZE {
            return Err(BusError::invalid_frame(format!(
                "expected {} bytes, got {}",
                SERVER_PACKET_SIZE,
                frame.len()
            )));
        }

        Ok(Self {
            command: Command::from_code(frame[2]),
            source: u16::from_be_bytes([frame[3], frame[4]]),
            destination: u16::from_be_bytes([frame[5], frame[6]]),
            data1: frame[7],
            data2: frame[8],
        })
    }

    /// ACK addressed to `destination`
    pub fn is_ack_for(&self, destination: u16) -> bool {
        self.command == Command::Ack && self.destination == destination
    }

    /// NACK addressed to `destination`
    pub fn is_nack_for(&self, destination: u16) -> bool {
        self.command == Command::Nack && self.destination == destination
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src={} dst={} cmd={} data1={} data2={}",
            self.source, self.destination, self.command, self.data1, self.data2
        )
    }
}

/// Hex dump used in TX/RX trace lines
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
