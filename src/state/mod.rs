//! Per-peer connection state machines, client and server.
//!
//! Both sides share the same shape: `Handshake -> ConnConfirm -> Auth ->
//! Connected`, a per-state `Deadline`, and a bounded retry counter in the
//! pre-`Connected` states. The states themselves are plain data-carrying
//! enum variants (see the design note on replacing polymorphic "state"
//! objects with a sum type); `Outcome` is the Keep/Disconnect signal each
//! `on_event`/`on_tick` call returns.

pub mod client;
pub mod server;

use std::time::{Duration, Instant};

/// A state-local deadline, checked on every event delivered while a
/// connection sits in a pre-`Connected` state.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    entered_at: Instant,
    max_duration: Duration,
}

impl Deadline {
    pub fn start(max_duration: Duration) -> Deadline {
        Deadline {
            entered_at: Instant::now(),
            max_duration,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.entered_at.elapsed() >= self.max_duration
    }
}

pub const HANDSHAKE_DEADLINE: Duration = Duration::from_millis(500);
pub const CONN_CONFIRM_DEADLINE: Duration = Duration::from_millis(250);
pub const AUTH_DEADLINE: Duration = Duration::from_millis(250);

pub const MAX_RETRIES_HANDSHAKE: u32 = 3;
pub const MAX_RETRIES_AUTH: u32 = 1;

/// The confirm-magic byte strings, compared on the wire including the
/// trailing NUL (see the design notes on the source's inconsistent use of
/// NUL-terminated magic strings: this spec fixes exact-bytes equality).
pub const CONFIRM_MAGIC: &[u8] = b"CONFIRM\0";
pub const OK_MAGIC: &[u8] = b"OK\0";
pub const AUTH_OK: &[u8] = b"OK\0";
