//! Crate-wide error taxonomy.
//!
//! Every fallible operation in `cryptshell` returns a `Result<T, Error>`.
//! The variants mirror the behavioral error kinds of the design: some are
//! locally recoverable (a retry counter, a dropped packet), others always
//! surface as a disconnect transition carrying a human-readable reason.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to initialize transport: {0}")]
    TransportInit(String),

    #[error("transport error with peer {peer:?}: {reason}")]
    TransportPeer {
        peer: Option<SocketAddr>,
        reason: String,
    },

    #[error("malformed packet: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("AEAD failure: {0}")]
    Aead(#[from] crate::crypto::cipher::AeadError),

    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("timeout reached")]
    Timeout,

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("failed to spawn pty session: {0}")]
    PtySpawn(String),

    #[error("end of file")]
    IoEof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The human-readable reason to ship to the peer in an encrypted
    /// `ShellMessage::Disconnect`, when one exists to send.
    pub fn disconnect_reason(&self) -> String {
        match self {
            Error::TransportInit(_) | Error::TransportPeer { .. } => self.to_string(),
            Error::Codec(_) | Error::Aead(_) => "Maximum retries exceeded".to_string(),
            Error::KeyAgreement(_) => "Connection is compromised".to_string(),
            Error::Timeout => "Timeout reached".to_string(),
            Error::AuthFailure(msg) => msg.clone(),
            Error::PtySpawn(msg) => msg.clone(),
            Error::IoEof => "End of file".to_string(),
            Error::Io(e) => e.to_string(),
        }
    }
}
