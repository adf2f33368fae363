//! Directional session key derivation.
//!
//! `derive_session_keys` takes an own keypair, a peer's public key and a
//! role, and returns a `(rx, tx)` pair such that `tx` on one side always
//! equals `rx` on the other: X25519 ECDH followed by HKDF-SHA256 with two
//! domain-separated `info` labels, one per direction.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use super::keys::KeyPair;
use crate::codec::PUBLIC_KEY_LEN;

pub const SESSION_KEY_LEN: usize = 32;

const LABEL_CLIENT_TO_SERVER: &[u8] = b"cryptshell client-to-server v1";
const LABEL_SERVER_TO_CLIENT: &[u8] = b"cryptshell server-to-client v1";

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A single directional AEAD key. Opaque, zeroized on drop, never `Debug`.
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

pub struct SessionKeys {
    pub rx: SessionKey,
    pub tx: SessionKey,
}

/// Derives directional session keys from an ECDH shared secret.
///
/// For the client: `tx` is keyed with the client-to-server label, `rx`
/// with server-to-client. For the server it is the mirror image, so that
/// `tx_client == rx_server` and `tx_server == rx_client`.
pub fn derive_session_keys(own: KeyPair, peer_public: &[u8; PUBLIC_KEY_LEN], role: Role) -> SessionKeys {
    let shared = own.diffie_hellman(peer_public);
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut client_to_server = [0u8; SESSION_KEY_LEN];
    let mut server_to_client = [0u8; SESSION_KEY_LEN];
    hk.expand(LABEL_CLIENT_TO_SERVER, &mut client_to_server)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    hk.expand(LABEL_SERVER_TO_CLIENT, &mut server_to_client)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    match role {
        Role::Client => SessionKeys {
            tx: SessionKey(client_to_server),
            rx: SessionKey(server_to_client),
        },
        Role::Server => SessionKeys {
            tx: SessionKey(server_to_client),
            rx: SessionKey(client_to_server),
        },
    }
}
