//! The wire codec: a tagged union of packets, encoded little-endian.
//!
//! Layout (one packet per transport datagram):
//!
//! ```text
//! tag: u8
//! Handshake    -> public_key: [u8; 32]
//! Bytes        -> len: u32, payload: [u8; len]
//! Disconnect   -> len: u32, payload: [u8; len]
//! Signal       -> len: u32, payload: [u8; len]
//! AuthRequest  -> ulen: u32, username: [u8; ulen], plen: u32, password: [u8; plen]
//! AuthResponse -> len: u32, payload: [u8; len]
//! Resize       -> rows: u16, cols: u16, x_pixels: u16, y_pixels: u16
//! ```
//!
//! Unknown tags and truncated buffers are hard errors; they are never
//! silently dropped by the codec itself (callers decide whether to retry
//! or ignore, see the state machines).

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Cursor, Read};

/// Longest byte buffer the codec will accept for a length-prefixed field.
/// Guards against a hostile or corrupted length prefix demanding an
/// allocation far larger than any real packet.
const MAX_FIELD_LEN: u32 = 1 << 20; // 1 MiB, matches the fuzz bound in the spec.

pub const PUBLIC_KEY_LEN: usize = 32;

const TAG_HANDSHAKE: u8 = 0;
const TAG_BYTES: u8 = 1;
const TAG_DISCONNECT: u8 = 2;
const TAG_SIGNAL: u8 = 3;
const TAG_AUTH_REQUEST: u8 = 4;
const TAG_AUTH_RESPONSE: u8 = 5;
const TAG_RESIZE: u8 = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated")]
    Truncated,
    #[error("unknown discriminant {0}")]
    UnknownTag(u8),
    #[error("length prefix {0} exceeds maximum field length")]
    LengthOverflow(u32),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("public key has the wrong length")]
    BadPublicKeyLen,
    #[error("field contains a disallowed NUL byte")]
    EmbeddedNul,
}

/// The kind of a `ShellMessage`, i.e. which top-level wire tag a message
/// payload is carried under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bytes,
    Disconnect,
    Signal,
    AuthResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake {
        public_key: [u8; PUBLIC_KEY_LEN],
    },
    ShellMessage {
        kind: ShellKind,
        payload: Vec<u8>,
    },
    AuthRequest {
        username: String,
        password: String,
    },
    Resize {
        rows: u16,
        cols: u16,
        x_pixels: u16,
        y_pixels: u16,
    },
}

impl Packet {
    pub fn handshake(public_key: [u8; PUBLIC_KEY_LEN]) -> Packet {
        Packet::Handshake { public_key }
    }

    pub fn bytes(payload: impl Into<Vec<u8>>) -> Packet {
        Packet::ShellMessage {
            kind: ShellKind::Bytes,
            payload: payload.into(),
        }
    }

    pub fn disconnect(reason: impl AsRef<str>) -> Packet {
        Packet::ShellMessage {
            kind: ShellKind::Disconnect,
            payload: reason.as_ref().as_bytes().to_vec(),
        }
    }

    pub fn signal(name: signal::SignalName) -> Packet {
        Packet::ShellMessage {
            kind: ShellKind::Signal,
            payload: name.as_str().as_bytes().to_vec(),
        }
    }

    pub fn auth_response(body: impl Into<Vec<u8>>) -> Packet {
        Packet::ShellMessage {
            kind: ShellKind::AuthResponse,
            payload: body.into(),
        }
    }

    /// Validating constructor: usernames and passwords must be UTF-8
    /// with no embedded NUL, since the wire format has no way to
    /// distinguish a NUL byte from a real terminator downstream (PAM,
    /// `execve` environment, etc.)
    pub fn auth_request(username: &str, password: &str) -> Result<Packet, CodecError> {
        if username.as_bytes().contains(&0) || password.as_bytes().contains(&0) {
            return Err(CodecError::EmbeddedNul);
        }
        Ok(Packet::AuthRequest {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn resize(rows: u16, cols: u16, x_pixels: u16, y_pixels: u16) -> Packet {
        Packet::Resize {
            rows,
            cols,
            x_pixels,
            y_pixels,
        }
    }

    /// Whether this packet is allowed to travel in plaintext. Only the
    /// initial key-exchange `Handshake` packet ever does.
    pub fn is_plaintext_allowed(&self) -> bool {
        matches!(self, Packet::Handshake { .. })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::Handshake { public_key } => {
                out.write_u8(TAG_HANDSHAKE).unwrap();
                out.extend_from_slice(public_key);
            }
            Packet::ShellMessage { kind, payload } => {
                let tag = match kind {
                    ShellKind::Bytes => TAG_BYTES,
                    ShellKind::Disconnect => TAG_DISCONNECT,
                    ShellKind::Signal => TAG_SIGNAL,
                    ShellKind::AuthResponse => TAG_AUTH_RESPONSE,
                };
                out.write_u8(tag).unwrap();
                out.write_u32::<LE>(payload.len() as u32).unwrap();
                out.extend_from_slice(payload);
            }
            Packet::AuthRequest { username, password } => {
                out.write_u8(TAG_AUTH_REQUEST).unwrap();
                out.write_u32::<LE>(username.len() as u32).unwrap();
                out.extend_from_slice(username.as_bytes());
                out.write_u32::<LE>(password.len() as u32).unwrap();
                out.extend_from_slice(password.as_bytes());
            }
            Packet::Resize {
                rows,
                cols,
                x_pixels,
                y_pixels,
            } => {
                out.write_u8(TAG_RESIZE).unwrap();
                out.write_u16::<LE>(*rows).unwrap();
                out.write_u16::<LE>(*cols).unwrap();
                out.write_u16::<LE>(*x_pixels).unwrap();
                out.write_u16::<LE>(*y_pixels).unwrap();
            }
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Packet, CodecError> {
        let mut cur = Cursor::new(buf);
        let tag = cur.read_u8().map_err(|_| CodecError::Truncated)?;
        match tag {
            TAG_HANDSHAKE => {
                let mut public_key = [0u8; PUBLIC_KEY_LEN];
                cur.read_exact(&mut public_key)
                    .map_err(|_| CodecError::BadPublicKeyLen)?;
                if cur.position() as usize != buf.len() {
                    return Err(CodecError::BadPublicKeyLen);
                }
                Ok(Packet::Handshake { public_key })
            }
            TAG_BYTES | TAG_DISCONNECT | TAG_SIGNAL | TAG_AUTH_RESPONSE => {
                let payload = read_field(&mut cur)?;
                let kind = match tag {
                    TAG_BYTES => ShellKind::Bytes,
                    TAG_DISCONNECT => ShellKind::Disconnect,
                    TAG_SIGNAL => ShellKind::Signal,
                    _ => ShellKind::AuthResponse,
                };
                Ok(Packet::ShellMessage { kind, payload })
            }
            TAG_AUTH_REQUEST => {
                let username_bytes = read_field(&mut cur)?;
                let password_bytes = read_field(&mut cur)?;
                let username =
                    String::from_utf8(username_bytes).map_err(|_| CodecError::InvalidUtf8)?;
                let password =
                    String::from_utf8(password_bytes).map_err(|_| CodecError::InvalidUtf8)?;
                if username.as_bytes().contains(&0) || password.as_bytes().contains(&0) {
                    return Err(CodecError::EmbeddedNul);
                }
                Ok(Packet::AuthRequest { username, password })
            }
            TAG_RESIZE => {
                let rows = cur.read_u16::<LE>().map_err(|_| CodecError::Truncated)?;
                let cols = cur.read_u16::<LE>().map_err(|_| CodecError::Truncated)?;
                let x_pixels = cur.read_u16::<LE>().map_err(|_| CodecError::Truncated)?;
                let y_pixels = cur.read_u16::<LE>().map_err(|_| CodecError::Truncated)?;
                Ok(Packet::Resize {
                    rows,
                    cols,
                    x_pixels,
                    y_pixels,
                })
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

fn read_field(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let len = cur.read_u32::<LE>().map_err(|_| CodecError::Truncated)?;
    if len > MAX_FIELD_LEN {
        return Err(CodecError::LengthOverflow(len));
    }
    let mut buf = vec![0u8; len as usize];
    cur.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
    Ok(buf)
}

pub mod signal {
    //! The closed set of signal short names carried in `Signal` shell
    //! messages, mirrored on both ends of the tunnel.

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SignalName {
        Hup,
        Int,
        Quit,
        Term,
        Usr1,
        Usr2,
    }

    impl SignalName {
        pub fn as_str(&self) -> &'static str {
            match self {
                SignalName::Hup => "HUP",
                SignalName::Int => "INT",
                SignalName::Quit => "QUIT",
                SignalName::Term => "TERM",
                SignalName::Usr1 => "USR1",
                SignalName::Usr2 => "USR2",
            }
        }

        pub fn from_bytes(bytes: &[u8]) -> Option<SignalName> {
            match bytes {
                b"HUP" => Some(SignalName::Hup),
                b"INT" => Some(SignalName::Int),
                b"QUIT" => Some(SignalName::Quit),
                b"TERM" => Some(SignalName::Term),
                b"USR1" => Some(SignalName::Usr1),
                b"USR2" => Some(SignalName::Usr2),
                _ => None,
            }
        }

        pub fn to_nix(self) -> nix::sys::signal::Signal {
            use nix::sys::signal::Signal::*;
            match self {
                SignalName::Hup => SIGHUP,
                SignalName::Int => SIGINT,
                SignalName::Quit => SIGQUIT,
                SignalName::Term => SIGTERM,
                SignalName::Usr1 => SIGUSR1,
                SignalName::Usr2 => SIGUSR2,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::signal::SignalName;
    use super::*;

    fn round_trip(p: Packet) {
        let bytes = p.serialize();
        let back = Packet::deserialize(&bytes).expect("round trip should decode");
        assert_eq!(p, back);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Packet::handshake([7u8; PUBLIC_KEY_LEN]));
        round_trip(Packet::bytes(b"hello world".to_vec()));
        round_trip(Packet::disconnect("Timeout reached"));
        round_trip(Packet::signal(SignalName::Int));
        round_trip(Packet::auth_response(b"OK\0".to_vec()));
        round_trip(Packet::auth_request("alice", "hunter2").unwrap());
        round_trip(Packet::resize(24, 80, 0, 0));
    }

    #[test]
    fn round_trips_empty_payload() {
        round_trip(Packet::bytes(Vec::new()));
    }

    #[test]
    fn unknown_tag_is_an_error_not_a_panic() {
        let err = Packet::deserialize(&[0xff]).unwrap_err();
        assert_eq!(err, CodecError::UnknownTag(0xff));
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        assert_eq!(Packet::deserialize(&[]).unwrap_err(), CodecError::Truncated);
        // Tag says Handshake but body is short.
        assert_eq!(
            Packet::deserialize(&[TAG_HANDSHAKE, 1, 2, 3]).unwrap_err(),
            CodecError::BadPublicKeyLen
        );
    }

    #[test]
    fn length_prefix_overflow_is_an_error() {
        let mut buf = vec![TAG_BYTES];
        buf.extend_from_slice(&(MAX_FIELD_LEN + 1).to_le_bytes());
        assert_eq!(
            Packet::deserialize(&buf).unwrap_err(),
            CodecError::LengthOverflow(MAX_FIELD_LEN + 1)
        );
    }

    #[test]
    fn invalid_utf8_in_auth_request_is_an_error() {
        let mut buf = vec![TAG_AUTH_REQUEST];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xff, 0xfe]);
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(Packet::deserialize(&buf).unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn auth_request_rejects_embedded_nul() {
        assert_eq!(
            Packet::auth_request("ali\0ce", "pw").unwrap_err(),
            CodecError::EmbeddedNul
        );
    }

    #[test]
    fn fuzz_arbitrary_lengths_never_panics() {
        // Cheap deterministic "fuzz": every tag crossed with a handful of
        // truncated/garbage bodies up to 1 MiB, checking only for absence
        // of panics (the property under test).
        let mut body = vec![0xAAu8; (1 << 20) + 16];
        for tag in 0u8..=255 {
            body[0] = tag;
            let _ = Packet::deserialize(&body[..1]);
            let _ = Packet::deserialize(&body[..9]);
            let _ = Packet::deserialize(&body);
        }
    }

    #[test]
    fn signal_name_round_trips_through_bytes() {
        for name in [
            SignalName::Hup,
            SignalName::Int,
            SignalName::Quit,
            SignalName::Term,
            SignalName::Usr1,
            SignalName::Usr2,
        ] {
            assert_eq!(SignalName::from_bytes(name.as_str().as_bytes()), Some(name));
        }
        assert_eq!(SignalName::from_bytes(b"BOGUS"), None);
    }
}
