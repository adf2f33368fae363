//! Ephemeral X25519 keypairs.
//!
//! Generated once per process at startup and destroyed at shutdown; never
//! persisted, never logged, never cloned. See `session_keys` for how a
//! pair plus a peer's public key become directional session keys.

use rand_core::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::codec::PUBLIC_KEY_LEN;

/// An ephemeral key-agreement keypair. `EphemeralSecret` is already
/// non-`Clone`, non-`Debug` and zeroizes on drop; this wrapper just keeps
/// the public half alongside it so callers don't need two handles.
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> KeyPair {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Consumes the secret half to perform Diffie-Hellman with a peer's
    /// public key. `EphemeralSecret::diffie_hellman` already takes `self`
    /// by value, which is the right shape here: an ephemeral secret is
    /// used for exactly one key agreement.
    pub(crate) fn diffie_hellman(self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> SharedSecret {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        SharedSecret(shared.to_bytes())
    }
}

/// The raw ECDH output, zeroized on drop. Never leaves the crypto module;
/// it is immediately run through HKDF in `session_keys`.
pub(crate) struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
