//! Test Common Utilities
//!
//! Scriptable mock gateway for eth3bus integration tests

#![allow(clippy::disallowed_methods)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use eth3bus::{BusConfig, CLIENT_PACKET_SIZE, SERVER_PACKET_SIZE};

pub type ClientFrame = [u8; CLIENT_PACKET_SIZE];
pub type ServerFrame = [u8; SERVER_PACKET_SIZE];

/// Decides the gateway's replies to one client frame
pub type Responder = Arc<dyn Fn(&ClientFrame) -> Vec<ServerFrame> + Send + Sync>;

const ENUM_CODE: u8 = 10;

/// Gateway → client frame
pub fn server_frame(command: u8, source: u16, destination: u16, data1: u8, data2: u8) -> ServerFrame {
    let src = source.to_be_bytes();
    let dst = destination.to_be_bytes();
    [0, 0, command, src[0], src[1], dst[0], dst[1], data1, data2]
}

pub fn ack(destination: u16) -> ServerFrame {
    server_frame(1, 0, destination, 0, 0)
}

pub fn nack(destination: u16) -> ServerFrame {
    server_frame(2, 0, destination, 0, 0)
}

/// Destination of a client frame
pub fn destination(frame: &ClientFrame) -> u16 {
    u16::from_be_bytes([frame[2], frame[3]])
}

pub fn is_enumeration(frame: &ClientFrame) -> bool {
    frame[4] == ENUM_CODE
}

/// ACK every request; answer enumeration with both acknowledgments
pub fn well_behaved() -> Responder {
    Arc::new(|frame: &ClientFrame| {
        if is_enumeration(frame) {
            vec![ack(0xFF), ack(0xFF)]
        } else {
            vec![ack(destination(frame))]
        }
    })
}

/// Never answer
pub fn silent() -> Responder {
    Arc::new(|_: &ClientFrame| Vec::new())
}

/// Test timing: short deadlines, long idle timeout and cooldown
pub fn test_config(addr: SocketAddr) -> BusConfig {
    BusConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connect_timeout_ms: 1_000,
        write_timeout_ms: 200,
        ack_margin_ms: 300,
        enumeration_margin_ms: 300,
        idle_timeout_ms: 30_000,
        min_enumeration_interval_ms: 60_000,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
enum Action {
    Send(ServerFrame),
    /// Back-to-back frames in one write
    Burst(Vec<ServerFrame>),
    Close,
}

/// Mock Eth3Bus gateway
pub struct MockGateway {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<ClientFrame>>>,
    connections: Arc<AtomicUsize>,
    actions: broadcast::Sender<Action>,
}

impl MockGateway {
    /// Listen on an ephemeral port and answer with `responder`
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (actions, _) = broadcast::channel(16);

        let gateway = Self {
            addr,
            received: received.clone(),
            connections: connections.clone(),
            actions: actions.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    stream,
                    responder.clone(),
                    received.clone(),
                    actions.subscribe(),
                ));
            }
        });

        gateway
    }

    pub fn config(&self) -> BusConfig {
        test_config(self.addr)
    }

    /// Frames received so far, in arrival order
    pub fn received(&self) -> Vec<ClientFrame> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` frames have arrived
    pub async fn wait_for_frames(&self, count: usize) -> Vec<ClientFrame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let frames = self.received();
            if frames.len() >= count {
                return frames;
            }
            assert!(
                Instant::now() < deadline,
                "expected {count} frames, got {}",
                frames.len()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Accepted connections so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Push an unsolicited frame to every open connection
    pub fn inject(&self, frame: ServerFrame) {
        let _ = self.actions.send(Action::Send(frame));
    }

    /// Push `frames` to every open connection as a single write
    pub fn inject_all(&self, frames: Vec<ServerFrame>) {
        let _ = self.actions.send(Action::Burst(frames));
    }

    /// Drop every open connection
    pub fn close_connections(&self) {
        let _ = self.actions.send(Action::Close);
    }
}

async fn serve(
    mut stream: TcpStream,
    responder: Responder,
    received: Arc<Mutex<Vec<ClientFrame>>>,
    mut actions: broadcast::Receiver<Action>,
) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 64];

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);

                while pending.len() >= CLIENT_PACKET_SIZE {
                    let frame: ClientFrame = pending[..CLIENT_PACKET_SIZE].try_into().unwrap();
                    pending.drain(..CLIENT_PACKET_SIZE);
                    received.lock().unwrap().push(frame);

                    for reply in responder(&frame) {
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            },
            action = actions.recv() => match action {
                Ok(Action::Send(frame)) => {
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                },
                Ok(Action::Burst(frames)) => {
                    if stream.write_all(&frames.concat()).await.is_err() {
                        return;
                    }
                },
                Ok(Action::Close) | Err(_) => return,
            },
        }
    }
}
