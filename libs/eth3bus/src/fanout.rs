//! Lossless inbound packet fan-out
//!
//! Every subscriber owns an unbounded queue, so a slow reader only grows its
//! own backlog and never loses packets. Closed subscribers are pruned on the
//! next publish.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::packet::Packet;

/// Receiving side of a packet subscription
pub type PacketReceiver = mpsc::UnboundedReceiver<Packet>;

/// Subscriber registry shared between the connection handles and the driver
#[derive(Debug, Clone, Default)]
pub struct PacketFanout {
    subscribers: Arc<DashMap<u64, mpsc::UnboundedSender<Packet>>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl PacketFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// New subscriber; sees every packet published from now on, in order.
    ///
    /// After [`close`](Self::close) the receiver ends immediately.
    pub fn subscribe(&self) -> PacketReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        if self.closed.load(Ordering::Acquire) {
            self.subscribers.remove(&id);
        }
        rx
    }

    /// Deliver `packet` to every live subscriber. Returns how many got it.
    pub fn publish(&self, packet: &Packet) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, tx| tx.send(*packet).is_ok());
        let delivered = self.subscribers.len();
        if delivered < before {
            trace!("Pruned {} closed subscriber(s)", before - delivered);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Drop every subscriber; their receivers end after draining
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
    }
}
