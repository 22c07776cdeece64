//! Bus connection
//!
//! [`BusConnection`] is a cheap, cloneable handle. All wire work happens in
//! one spawned driver task that owns the [`FramedSocket`] and the
//! [`CommandQueue`]; callers submit operations over a channel and await a
//! one-shot result, so concurrent callers are serialized without locking.
//!
//! Every inbound packet is offered to the active operation and then
//! delivered to all subscribers, whether or not it completed anything.
//! Subscribers never miss packets; a slow one only grows its own backlog.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::fanout::{PacketFanout, PacketReceiver};
use crate::packet::{Command, Packet, ENUM_ACKS_REQUIRED, ENUM_ACK_ADDRESS, SERVER_PACKET_SIZE};
use crate::queue::{
    wait_until, Activation, CommandQueue, PendingOperation, Reply, ReplyMatcher, Verdict,
};
use crate::socket::{ConnectionState, FramedSocket, SocketEvent};

/// What the driver writes when an operation activates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outbound {
    Packet(Packet),
    /// Discovery broadcast, subject to the cooldown
    Enumeration,
}

type Submission = PendingOperation<Outbound>;

// ============================================================================
// Reply matchers
// ============================================================================

/// Completes on an ACK for `destination`, rejects on a NACK for it
#[derive(Debug, Clone, Copy)]
pub struct AckMatcher {
    destination: u16,
}

impl AckMatcher {
    pub fn new(destination: u16) -> Self {
        Self { destination }
    }
}

impl ReplyMatcher for AckMatcher {
    fn check(&mut self, packet: &Packet) -> Verdict {
        if packet.is_ack_for(self.destination) {
            Verdict::Complete(Some(*packet))
        } else if packet.is_nack_for(self.destination) {
            Verdict::Fail(BusError::Rejected {
                destination: self.destination,
            })
        } else {
            Verdict::Ignore
        }
    }
}

/// Counts ACKs on the discovery-acknowledgment address.
///
/// The gateway and the bus controller each acknowledge once.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerationMatcher {
    acks: u8,
}

impl EnumerationMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acks(&self) -> u8 {
        self.acks
    }
}

impl ReplyMatcher for EnumerationMatcher {
    fn check(&mut self, packet: &Packet) -> Verdict {
        if packet.is_ack_for(ENUM_ACK_ADDRESS) {
            self.acks += 1;
            if self.acks >= ENUM_ACKS_REQUIRED {
                info!("Enumeration completed");
                return Verdict::Complete(None);
            }
            Verdict::Ignore
        } else if packet.is_nack_for(ENUM_ACK_ADDRESS) {
            Verdict::Fail(BusError::Rejected {
                destination: ENUM_ACK_ADDRESS,
            })
        } else {
            Verdict::Ignore
        }
    }
}

// ============================================================================
// Enumeration cooldown
// ============================================================================

/// Minimum spacing between discovery broadcasts
#[derive(Debug, Clone)]
pub struct EnumerationCooldown {
    min_interval: Duration,
    last: Option<Instant>,
}

impl EnumerationCooldown {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Time since the last broadcast if it is too recent to send another
    pub fn blocked(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last?);
        (elapsed < self.min_interval).then_some(elapsed)
    }

    /// A broadcast went out at `now`
    pub fn record(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn last(&self) -> Option<Instant> {
        self.last
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a gateway connection
///
/// Clones share the same driver. The driver stops on [`shutdown`] or once
/// every handle is dropped and the queue has drained.
///
/// [`shutdown`]: BusConnection::shutdown
#[derive(Debug, Clone)]
pub struct BusConnection {
    submissions: mpsc::Sender<Submission>,
    packets: PacketFanout,
    state: watch::Receiver<ConnectionState>,
    token: CancellationToken,
    config: Arc<BusConfig>,
}

impl BusConnection {
    /// Validate `config` and start the driver.
    ///
    /// Nothing touches the network until the first request. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;

        let socket = FramedSocket::new(
            config.gateway_addr(),
            SERVER_PACKET_SIZE,
            config.connect_timeout(),
            config.idle_timeout(),
        )
        .with_write_timeout(config.write_timeout());
        let state = socket.subscribe_state();

        let (submit_tx, submit_rx) = mpsc::channel(config.queue_capacity);
        let packets = PacketFanout::new();
        let token = CancellationToken::new();

        let driver = BusDriver {
            socket,
            queue: CommandQueue::new(),
            submissions: submit_rx,
            accepting: true,
            capacity: config.queue_capacity,
            packets: packets.clone(),
            cooldown: EnumerationCooldown::new(config.min_enumeration_interval()),
            token: token.clone(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            submissions: submit_tx,
            packets,
            state,
            token,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Request with an ACK/NACK reply from `destination`
    pub async fn send_acknowledged(
        &self,
        destination: u16,
        command: Command,
        data1: u8,
        data2: u8,
    ) -> Result<Packet> {
        let packet = Packet::outbound(destination, command, data1, data2);
        let reply = self
            .submit(
                Outbound::Packet(packet),
                self.config.ack_timeout(),
                Some(Box::new(AckMatcher::new(destination))),
            )
            .await?;
        reply.ok_or_else(|| BusError::invalid_frame("acknowledged request completed without a reply"))
    }

    /// Request that completes once written, without waiting for a reply
    pub async fn send_fire_and_forget(
        &self,
        destination: u16,
        command: Command,
        data1: u8,
        data2: u8,
    ) -> Result<()> {
        let packet = Packet::outbound(destination, command, data1, data2);
        self.submit(Outbound::Packet(packet), self.config.write_timeout(), None)
            .await
            .map(|_| ())
    }

    /// Broadcast a discovery request and wait for both acknowledgments.
    ///
    /// Within the cooldown window this succeeds without writing anything.
    pub async fn enumerate(&self) -> Result<()> {
        self.submit(
            Outbound::Enumeration,
            self.config.enumeration_timeout(),
            Some(Box::new(EnumerationMatcher::new())),
        )
        .await
        .map(|_| ())
    }

    /// Acknowledged READ of register `data1`
    pub async fn read(&self, destination: u16, data1: u8) -> Result<Packet> {
        self.send_acknowledged(destination, Command::Read, data1, 0)
            .await
    }

    /// Acknowledged WRITE of `data2` to register `data1`
    pub async fn write(&self, destination: u16, data1: u8, data2: u8) -> Result<Packet> {
        self.send_acknowledged(destination, Command::Write, data1, data2)
            .await
    }

    async fn submit(
        &self,
        payload: Outbound,
        timeout: Duration,
        matcher: Option<Box<dyn ReplyMatcher>>,
    ) -> Result<Reply> {
        let (op, reply) = PendingOperation::new(payload, timeout, matcher);
        self.submissions
            .send(op)
            .await
            .map_err(|_| BusError::Closed)?;
        reply.await.map_err(|_| BusError::Closed)?
    }

    /// Every inbound packet, including ones that complete a request
    ///
    /// The receiver ends once the connection has shut down.
    pub fn subscribe(&self) -> PacketReceiver {
        self.packets.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch socket state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.submissions.is_closed()
    }

    /// Token cancelled when the connection shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the driver and wait for it to exit.
    ///
    /// Queued and in-flight requests resolve with [`BusError::Closed`].
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.submissions.closed().await;
    }

    /// Re-enumerate every `period` until `token` or the connection is
    /// cancelled. Failures are logged and retried on the next tick.
    pub fn spawn_periodic_enumeration(
        &self,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = bus.token.cancelled() => break,
                    _ = ticker.tick() => {
                        match bus.enumerate().await {
                            Ok(()) => {},
                            Err(BusError::Closed) => break,
                            Err(e) => warn!("Periodic enumeration failed: {}", e),
                        }
                    }
                }
            }
            debug!("Periodic enumeration stopped");
        })
    }
}

// ============================================================================
// Driver
// ============================================================================

struct BusDriver {
    socket: FramedSocket,
    queue: CommandQueue<Outbound>,
    submissions: mpsc::Receiver<Submission>,
    /// False once every handle has been dropped
    accepting: bool,
    /// Queue length at which submissions stay in the channel
    capacity: usize,
    packets: PacketFanout,
    cooldown: EnumerationCooldown,
    token: CancellationToken,
}

impl BusDriver {
    async fn run(mut self) {
        info!("Bus driver started for {}", self.socket.addr());

        loop {
            self.pump().await;
            if !self.accepting && self.queue.is_empty() {
                break;
            }

            let deadline = self.queue.deadline();
            // A full queue leaves submitters waiting on the channel
            let has_room = self.queue.len() < self.capacity;
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = self.socket.next_event() => self.on_socket_event(event),
                _ = wait_until(deadline) => {
                    self.queue.expire(Instant::now());
                },
                submission = self.submissions.recv(), if self.accepting && has_room => match submission {
                    Some(op) => {
                        self.queue.push(op);
                    },
                    None => self.accepting = false,
                },
            }
        }

        self.stop();
    }

    /// Write queued operations until one is left waiting for a reply
    async fn pump(&mut self) {
        while let Some(activation) = self.queue.activate() {
            match self.execute(&activation).await {
                Ok(true) => self.queue.written(activation.id, Instant::now()),
                Ok(false) => self.queue.finish(activation.id, Ok(None)),
                Err(e) => {
                    warn!("{} failed: {}", activation.id, e);
                    self.queue.finish(activation.id, Err(e));
                },
            }
        }
    }

    /// Put the activation on the wire. `Ok(false)` means nothing was sent.
    async fn execute(&mut self, activation: &Activation<Outbound>) -> Result<bool> {
        let packet = match activation.payload {
            Outbound::Packet(packet) => packet,
            Outbound::Enumeration => {
                if let Some(elapsed) = self.cooldown.blocked(Instant::now()) {
                    debug!("Skip enumeration: {}ms since last one", elapsed.as_millis());
                    return Ok(false);
                }
                info!("Start enumeration");
                Packet::enumeration()
            },
        };

        debug!("SEND {}", packet);
        self.socket
            .write(Bytes::copy_from_slice(&packet.encode()))
            .await?;

        if activation.payload == Outbound::Enumeration {
            self.cooldown.record(Instant::now());
        }
        Ok(true)
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Frame(frame) => match Packet::decode(&frame) {
                Ok(packet) => {
                    debug!("RECV {}", packet);
                    self.queue.check(&packet);
                    self.packets.publish(&packet);
                },
                Err(e) => warn!("Dropping frame: {}", e),
            },
            SocketEvent::Disconnected(err) => {
                if self.queue.cancel(err.clone()) {
                    warn!("Active operation cancelled: {}", err);
                }
            },
        }
    }

    fn stop(&mut self) {
        self.submissions.close();
        while let Ok(op) = self.submissions.try_recv() {
            self.queue.push(op);
        }
        if !self.queue.is_empty() {
            info!("Failing {} queued operation(s)", self.queue.len());
        }
        self.queue.close(BusError::Closed);
        self.socket.close("shutdown");
        self.packets.close();
        info!("Bus driver stopped for {}", self.socket.addr());
    }
}
