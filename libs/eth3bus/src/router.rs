//! Per-device packet routing
//!
//! Device models register by bus address and receive every inbound packet
//! whose destination is that address. Several zones can live behind one
//! address, so there is one route per address, not per record. Routes are
//! unbounded: a device that falls behind keeps its backlog and loses nothing.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::BusConnection;
use crate::packet::Packet;

/// One entry of an installation's device list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Bus address
    pub address: u16,
    /// Zone index behind that address
    pub zone: u8,
    pub device_type: u8,
    pub name: String,
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.zone)
    }
}

/// Routes inbound packets to registered devices by destination address
#[derive(Debug, Clone, Default)]
pub struct DeviceRouter {
    routes: Arc<DashMap<u16, mpsc::UnboundedSender<Packet>>>,
}

impl DeviceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address`, replacing any previous route for it
    pub fn register(&self, address: u16) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.insert(address, tx).is_some() {
            debug!("Route for device {} replaced", address);
        }
        rx
    }

    /// One route per distinct address in `records`
    pub fn register_devices(
        &self,
        records: &[DeviceRecord],
    ) -> HashMap<u16, mpsc::UnboundedReceiver<Packet>> {
        let mut receivers = HashMap::new();
        for record in records {
            if !receivers.contains_key(&record.address) {
                receivers.insert(record.address, self.register(record.address));
            }
        }
        receivers
    }

    pub fn unregister(&self, address: u16) -> bool {
        self.routes.remove(&address).is_some()
    }

    pub fn is_registered(&self, address: u16) -> bool {
        self.routes.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Hand `packet` to the device registered at its destination.
    ///
    /// Returns whether it was delivered. A closed device channel removes the
    /// route.
    pub fn route_inbound_packet(&self, packet: &Packet) -> bool {
        let destination = packet.destination;
        let Some(sender) = self.routes.get(&destination).map(|route| route.value().clone()) else {
            trace!("No route for {}", destination);
            return false;
        };

        if sender.send(*packet).is_ok() {
            return true;
        }
        debug!("Device {} gone, removing route", destination);
        self.routes.remove_if(&destination, |_, tx| tx.is_closed());
        false
    }

    /// Route every packet `bus` receives until the connection shuts down
    pub fn attach(&self, bus: &BusConnection) -> JoinHandle<()> {
        let router = self.clone();
        let mut packets = bus.subscribe();
        let token = bus.cancellation_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = packets.recv() => match received {
                        Some(packet) => {
                            router.route_inbound_packet(&packet);
                        },
                        None => break,
                    },
                }
            }
            debug!("Device router detached");
        })
    }
}
