//! Events surfaced by the transport adapter's internal queue.

use std::net::SocketAddr;

/// A logical multiplexing lane within a peer connection. Channel 0 is
/// data/control, channel 1 is signals/resize; see `MAX_CHANNELS`.
pub type ChannelId = u8;

pub const MAX_CHANNELS: ChannelId = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFlags {
    Reliable,
    Unreliable,
}

impl Default for SendFlags {
    fn default() -> Self {
        SendFlags::Reliable
    }
}

/// One item out of the transport's polled event queue. `Receive` owns its
/// payload buffer for its lifetime; it is simply dropped when the event
/// goes out of scope.
#[derive(Debug, Clone)]
pub enum Event {
    Connect {
        peer: SocketAddr,
    },
    Receive {
        peer: SocketAddr,
        channel: ChannelId,
        bytes: Vec<u8>,
    },
    Disconnect {
        peer: SocketAddr,
        code: u32,
    },
}

impl Event {
    pub fn peer(&self) -> SocketAddr {
        match self {
            Event::Connect { peer } => *peer,
            Event::Receive { peer, .. } => *peer,
            Event::Disconnect { peer, .. } => *peer,
        }
    }
}
