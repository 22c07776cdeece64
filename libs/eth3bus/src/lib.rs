//! Eth3Bus Gateway Client
//!
//! Async client for the Eth3Bus home-automation field bus, reached through a
//! TCP gateway that speaks fixed-size binary packets.
//!
//! # Architecture
//!
//! - **Framed Socket** (`socket`, `codec`): lazily connected TCP stream split
//!   into fixed 9-byte inbound frames, closed after an idle period
//! - **Command Queue** (`queue`): strict FIFO of pending operations with one
//!   active head, reply matchers and per-operation deadlines
//! - **Bus Connection** (`connection`): packet layout, ACK/NACK and
//!   enumeration protocols, public request API and inbound packet fan-out
//!   (`fanout`, lossless per-subscriber queues)
//! - **Device Router** (`router`): delivers inbound packets to device models
//!   by destination address
//!
//! # Example
//!
//! ```no_run
//! use eth3bus::{BusConfig, BusConnection};
//!
//! # async fn run() -> eth3bus::Result<()> {
//! let bus = BusConnection::new(BusConfig::new("192.168.1.35", eth3bus::GATEWAY_PORT))?;
//! bus.enumerate().await?;
//! let reply = bus.read(49, 1).await?;
//! println!("{reply}");
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod packet;
pub mod queue;
pub mod router;
pub mod socket;

pub use config::BusConfig;
pub use connection::{AckMatcher, BusConnection, EnumerationCooldown, EnumerationMatcher, Outbound};
pub use error::{BusError, Result};
pub use fanout::{PacketFanout, PacketReceiver};
pub use packet::{
    Command, Packet, BROADCAST_ADDRESS, CLIENT_ADDRESS, CLIENT_PACKET_SIZE, ENUM_ACK_ADDRESS,
    GATEWAY_PORT, SERVER_PACKET_SIZE,
};
pub use queue::{CommandQueue, OperationId, PendingOperation, ReplyMatcher, Verdict};
pub use router::{DeviceRecord, DeviceRouter};
pub use socket::{ConnectionState, FramedSocket, SocketEvent};
