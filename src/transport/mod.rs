//! Transport adapter: wraps a reliable-datagram host (`laminar::Socket`)
//! behind the narrow interface the state machines need — `connect`,
//! `send`, `recv`, `disconnect` — plus a background `service` loop that
//! drives the host's internal I/O and feeds a polled event queue.
//!
//! Channels are an application-level concept layered on top of the
//! underlying socket: each outbound payload is prefixed with a one-byte
//! channel id, which is stripped back off on receive. This keeps channel
//! demultiplexing independent of exactly which reliability primitives the
//! wrapped transport surfaces on its own receive path.

pub mod event;

pub use event::{ChannelId, Event, SendFlags, MAX_CHANNELS};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use laminar::{Packet as LamPacket, Socket, SocketEvent};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// Disconnect code used when the peer disconnect event carries no
/// further information (a clean, explicit disconnect).
pub const DISCONNECT_CLEAN: u32 = 0;
/// Disconnect code used when the host gives up on an unresponsive peer.
pub const DISCONNECT_TIMEOUT: u32 = 1;

pub struct Transport {
    socket: Mutex<Socket>,
    packet_sender: crossbeam_channel::Sender<LamPacket>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    max_channels: ChannelId,
}

impl Transport {
    /// Binds a server host. `max_peers` and `max_channels` are enforced
    /// at the adapter level (the wrapped socket itself has no notion of
    /// either); `max_channels` bounds the prefix byte accepted by `send`.
    pub fn bind(addr: SocketAddr, max_channels: ChannelId) -> Result<Arc<Transport>> {
        let socket = Socket::bind(addr)
            .map_err(|e| Error::TransportInit(format!("failed to bind {addr}: {e}")))?;
        Ok(Self::from_socket(socket, max_channels))
    }

    /// Creates an unbound, outgoing-only host for a client.
    pub fn client(max_channels: ChannelId) -> Result<Arc<Transport>> {
        let socket = Socket::bind("0.0.0.0:0".parse().unwrap())
            .map_err(|e| Error::TransportInit(format!("failed to create client socket: {e}")))?;
        Ok(Self::from_socket(socket, max_channels))
    }

    fn from_socket(socket: Socket, max_channels: ChannelId) -> Arc<Transport> {
        let packet_sender = socket.get_packet_sender();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Transport {
            socket: Mutex::new(socket),
            packet_sender,
            events_tx,
            events_rx: Mutex::new(events_rx),
            max_channels,
        })
    }

    /// Initiates a session with a remote server. The outcome (success or
    /// failure) is delivered asynchronously as a later `Connect` event.
    pub fn connect(&self, addr: SocketAddr) {
        // An empty reliable packet is enough to make the host start
        // tracking this address as a virtual connection.
        let _ = self
            .packet_sender
            .send(LamPacket::reliable_unordered(addr, Vec::new()));
    }

    pub fn send(&self, peer: SocketAddr, bytes: &[u8], channel: ChannelId, flags: SendFlags) -> Result<()> {
        if channel >= self.max_channels {
            return Err(Error::TransportPeer {
                peer: Some(peer),
                reason: format!("channel {channel} exceeds max_channels {}", self.max_channels),
            });
        }
        let mut payload = Vec::with_capacity(bytes.len() + 1);
        payload.push(channel);
        payload.extend_from_slice(bytes);

        let packet = match flags {
            SendFlags::Reliable => LamPacket::reliable_ordered(peer, payload, Some(channel)),
            SendFlags::Unreliable => LamPacket::unreliable(peer, payload),
        };
        self.packet_sender.send(packet).map_err(|e| Error::TransportPeer {
            peer: Some(peer),
            reason: format!("send queue closed: {e}"),
        })
    }

    pub fn disconnect(&self, peer: SocketAddr) {
        let _ = self.events_tx.send(Event::Disconnect {
            peer,
            code: DISCONNECT_CLEAN,
        });
    }

    /// Non-blocking dequeue of the next event, if any. Callers drive their
    /// own event loop around this (typically a `tokio::select!` between
    /// `recv` returning `None` and a short sleep, never a busy spin).
    pub fn recv(&self) -> Option<Event> {
        self.events_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Drives the host: repeatedly polls it and re-publishes whatever it
    /// produces onto the internal event queue. Meant to run as its own
    /// task (`tokio::spawn(transport.service(Duration::from_millis(10)))`),
    /// concurrently with callers of `send`/`recv`.
    pub async fn service(self: Arc<Self>, poll_interval: Duration) {
        loop {
            {
                let mut socket = self.socket.lock().await;
                socket.manual_poll(Instant::now());
                while let Some(event) = socket.recv() {
                    if let Some(event) = translate(event) {
                        if self.events_tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// The narrow "send one frame" surface a pump needs from a transport.
/// Lets pump tests assert on exact `(peer, channel, flags, bytes)` calls
/// against a recording fake instead of a real socket.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, peer: SocketAddr, bytes: &[u8], channel: ChannelId, flags: SendFlags) -> Result<()>;
}

impl FrameSink for Transport {
    fn send_frame(&self, peer: SocketAddr, bytes: &[u8], channel: ChannelId, flags: SendFlags) -> Result<()> {
        self.send(peer, bytes, channel, flags)
    }
}

fn translate(event: SocketEvent) -> Option<Event> {
    match event {
        SocketEvent::Connect(peer) => Some(Event::Connect { peer }),
        SocketEvent::Disconnect(peer) => Some(Event::Disconnect {
            peer,
            code: DISCONNECT_CLEAN,
        }),
        SocketEvent::Timeout(peer) => Some(Event::Disconnect {
            peer,
            code: DISCONNECT_TIMEOUT,
        }),
        SocketEvent::Packet(packet) => {
            let peer = packet.addr();
            let payload = packet.payload();
            let (channel, bytes) = payload.split_first()?;
            Some(Event::Receive {
                peer,
                channel: *channel,
                bytes: bytes.to_vec(),
            })
        }
    }
}
