//! Framed gateway socket
//!
//! Owns the single TCP connection to the gateway. Connects lazily on the
//! first write, splits inbound bytes into fixed-size frames and closes the
//! connection itself once it has been idle for `idle_timeout` after the last
//! write (the gateway drops idle clients on its own, so the connection is
//! never assumed to persist).

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::codec::FixedFrameCodec;
use crate::error::{BusError, Result};
use crate::packet::hex;
use crate::queue::wait_until;

/// Connection state of the gateway socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum ConnectionState {
    /// No socket; the next write connects
    #[default]
    NotConnected,
    /// TCP handshake in progress
    Connecting,
    /// Socket open, frames flowing
    Connected,
    /// Tearing down the socket
    Closing,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotConnected => write!(f, "NOT_CONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Closing => write!(f, "CLOSING"),
        }
    }
}

/// Something the socket has to report to its owner
#[derive(Debug)]
pub enum SocketEvent {
    /// One complete inbound frame
    Frame(Bytes),
    /// Connection lost (idle timeout, peer close, read error)
    Disconnected(BusError),
}

/// Lazily connected, fixed-frame TCP socket
#[derive(Debug)]
pub struct FramedSocket {
    addr: String,
    frame_len: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
    /// Limit for a single send once connected
    write_timeout: Option<Duration>,
    framed: Option<Framed<TcpStream, FixedFrameCodec>>,
    /// Armed after every completed write, cleared when the next write starts
    idle_deadline: Option<Instant>,
    state: watch::Sender<ConnectionState>,
}

impl FramedSocket {
    pub fn new(
        addr: impl Into<String>,
        frame_len: usize,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            addr: addr.into(),
            frame_len,
            connect_timeout,
            idle_timeout,
            write_timeout: None,
            framed: None,
            idle_deadline: None,
            state,
        }
    }

    /// Bound every send by `limit`; a stalled send drops the connection
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = Some(limit);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    /// Pending idle-disconnect deadline, if any
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state.send_replace(new_state);
        if old_state != new_state {
            debug!("Gateway {}: {} -> {}", self.addr, old_state, new_state);
        }
    }

    async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        debug!("TCP connecting: {}", self.addr);

        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }

                info!("Connected to gateway {}", self.addr);
                // Fresh codec buffer: no partial frame survives a reconnect
                self.framed = Some(Framed::new(stream, FixedFrameCodec::new(self.frame_len)));
                self.set_state(ConnectionState::Connected);
                Ok(())
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", self.addr, e);
                self.set_state(ConnectionState::NotConnected);
                Err(BusError::connect(format!(
                    "Failed to connect to {}: {e}",
                    self.addr
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", self.addr);
                self.set_state(ConnectionState::NotConnected);
                Err(BusError::connect(format!(
                    "Connection to {} timed out",
                    self.addr
                )))
            },
        }
    }

    /// Write one frame, connecting first if needed
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        self.idle_deadline = None;

        if self.framed.is_none() {
            self.connect().await?;
        }
        let Some(framed) = self.framed.as_mut() else {
            return Err(BusError::connect("Not connected"));
        };

        let len = data.len();
        let dump = hex(&data);
        let sent = match self.write_timeout {
            Some(limit) => match timeout(limit, framed.send(data)).await {
                Ok(sent) => sent.map_err(|e| BusError::write(format!("Send to {} failed: {e}", self.addr))),
                Err(_) => Err(BusError::timeout(format!(
                    "Send to {} stalled for {}ms",
                    self.addr,
                    limit.as_millis()
                ))),
            },
            None => framed
                .send(data)
                .await
                .map_err(|e| BusError::write(format!("Send to {} failed: {e}", self.addr))),
        };

        match sent {
            Ok(()) => {
                debug!("TX {}B: [{}]", len, dump);
                self.idle_deadline = Some(Instant::now() + self.idle_timeout);
                Ok(())
            },
            Err(e) => {
                error!("TX: {}", e);
                self.close("write failed");
                Err(e)
            },
        }
    }

    /// Wait for the next inbound frame or connection loss.
    ///
    /// Never resolves while disconnected. Cancel safe.
    pub async fn next_event(&mut self) -> SocketEvent {
        enum Outcome {
            Read(Option<std::io::Result<Bytes>>),
            Idle,
        }

        let idle_deadline = self.idle_deadline;
        let outcome = {
            let Some(framed) = self.framed.as_mut() else {
                return std::future::pending().await;
            };
            tokio::select! {
                frame = framed.next() => Outcome::Read(frame),
                _ = wait_until(idle_deadline) => Outcome::Idle,
            }
        };

        match outcome {
            Outcome::Read(Some(Ok(frame))) => {
                debug!("RX {}B: [{}]", frame.len(), hex(&frame));
                SocketEvent::Frame(frame)
            },
            Outcome::Read(Some(Err(e))) => {
                error!("RX: {}", e);
                self.close("read error");
                SocketEvent::Disconnected(BusError::disconnected(format!("Read error: {e}")))
            },
            Outcome::Read(None) => {
                self.close("closed by peer");
                SocketEvent::Disconnected(BusError::disconnected("Connection closed by gateway"))
            },
            Outcome::Idle => {
                self.close("idle timeout");
                SocketEvent::Disconnected(BusError::disconnected(format!(
                    "Idle for {}ms",
                    self.idle_timeout.as_millis()
                )))
            },
        }
    }

    /// Drop the connection; the next write reconnects from scratch
    pub fn close(&mut self, reason: &str) {
        self.idle_deadline = None;
        if self.framed.is_none() {
            return;
        }

        self.set_state(ConnectionState::Closing);
        self.framed = None;
        info!("Disconnected from gateway {} ({})", self.addr, reason);
        self.set_state(ConnectionState::NotConnected);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    // ========================================================================
    // ConnectionState Tests
    // ========================================================================

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::NotConnected.to_string(), "NOT_CONNECTED");
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    // ========================================================================
    // FramedSocket Tests
    // ========================================================================

    #[tokio::test]
    async fn test_new_socket_is_not_connected() {
        let socket = FramedSocket::new(
            "127.0.0.1:1",
            9,
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        assert!(!socket.is_connected());
        assert_eq!(socket.state(), ConnectionState::NotConnected);
        assert!(socket.idle_deadline().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let (listener, addr) = listener().await;
        drop(listener);

        let mut socket = FramedSocket::new(addr, 9, Duration::from_secs(1), Duration::from_secs(30));
        let err = socket.write(Bytes::from_static(&[1, 2, 3])).await.unwrap_err();

        assert!(matches!(err, BusError::Connect(_)));
        assert_eq!(socket.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_write_connects_and_frames_replies() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 7];
            stream.read_exact(&mut buf).await.unwrap();
            // reply in two chunks: one full frame + the start of another, then the rest
            stream.write_all(&[0, 0, 1, 0, 0, 0, 0x31, 0, 0, 0, 0]).await.unwrap();
            stream.write_all(&[2, 0, 0, 0, 0x31, 0, 0]).await.unwrap();
            buf
        });

        let mut socket = FramedSocket::new(addr, 9, Duration::from_secs(1), Duration::from_secs(30));
        let mut states = socket.subscribe_state();
        socket
            .write(Bytes::from_static(&[0xFF, 0xFF, 0, 0x31, 3, 0, 0]))
            .await
            .unwrap();
        assert!(socket.is_connected());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
        assert!(socket.idle_deadline().is_some());

        let first = socket.next_event().await;
        let second = socket.next_event().await;
        match (first, second) {
            (SocketEvent::Frame(a), SocketEvent::Frame(b)) => {
                assert_eq!(a[2], 1);
                assert_eq!(b[2], 2);
                assert_eq!(b.len(), 9);
            },
            other => panic!("unexpected events: {other:?}"),
        }

        assert_eq!(server.await.unwrap(), [0xFF, 0xFF, 0, 0x31, 3, 0, 0]);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut socket = FramedSocket::new(
            addr,
            9,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        socket.write(Bytes::from_static(&[1])).await.unwrap();

        let event = socket.next_event().await;
        assert!(matches!(event, SocketEvent::Disconnected(BusError::Disconnected(_))));
        assert!(!socket.is_connected());
        assert_eq!(socket.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_peer_close_raises_disconnected() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await.unwrap();
            drop(stream);
        });

        let mut socket = FramedSocket::new(addr, 9, Duration::from_secs(1), Duration::from_secs(30));
        socket.write(Bytes::from_static(&[1])).await.unwrap();

        let event = socket.next_event().await;
        assert!(matches!(event, SocketEvent::Disconnected(_)));
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_stalled_send_times_out_and_drops_connection() {
        let (listener, addr) = listener().await;
        let (release, held) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            // Accept but never read, so the send buffers fill up
            let (stream, _) = listener.accept().await.unwrap();
            let _ = held.await;
            drop(stream);
        });

        let mut socket = FramedSocket::new(addr, 9, Duration::from_secs(1), Duration::from_secs(30))
            .with_write_timeout(Duration::from_millis(100));
        let mut states = socket.subscribe_state();

        let chunk = Bytes::from(vec![0u8; 1 << 20]);
        let mut failure = None;
        for _ in 0..64 {
            if let Err(e) = socket.write(chunk.clone()).await {
                failure = Some(e);
                break;
            }
        }

        let err = failure.expect("send never stalled");
        assert!(matches!(err, BusError::Timeout(_)), "unexpected error: {err}");
        assert!(err.to_string().contains("stalled"));
        assert!(!socket.is_connected());
        assert!(socket.idle_deadline().is_none());
        assert_eq!(*states.borrow_and_update(), ConnectionState::NotConnected);

        let _ = release.send(());
    }
}
