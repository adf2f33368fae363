//! XChaCha20-Poly1305 AEAD wrapper.
//!
//! A `Cipher` owns a directional session-key pair and exposes
//! `encrypt`/`decrypt` on serialized packets. Every encryption prepends a
//! fresh random 24-byte nonce; the wire layout is `nonce || ciphertext ||
//! tag`. Decryption failures are reported as `AeadError` and are never
//! fatal to the session by themselves — callers decide whether a failed
//! decrypt means "retry" (pre-`Connected`) or "drop the frame and carry
//! on" (steady state).

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};

use super::session_keys::{SessionKey, SessionKeys, SESSION_KEY_LEN};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AeadError {
    #[error("ciphertext shorter than a nonce")]
    Truncated,
    #[error("authentication tag did not verify")]
    TagMismatch,
}

pub struct Cipher {
    rx: XChaCha20Poly1305,
    tx: XChaCha20Poly1305,
}

impl Cipher {
    pub fn new(keys: SessionKeys) -> Cipher {
        Cipher {
            rx: aead_from_key(&keys.rx),
            tx: aead_from_key(&keys.tx),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let mut ciphertext = self
            .tx
            .encrypt(nonce, plaintext)
            .expect("XChaCha20-Poly1305 encryption does not fail for in-range inputs");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.append(&mut ciphertext);
        out
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, AeadError> {
        if frame.len() < NONCE_LEN {
            return Err(AeadError::Truncated);
        }
        let (nonce_bytes, ct) = frame.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        self.rx
            .decrypt(nonce, ct)
            .map_err(|_| AeadError::TagMismatch)
    }
}

fn aead_from_key(key: &SessionKey) -> XChaCha20Poly1305 {
    debug_assert_eq!(key.as_bytes().len(), SESSION_KEY_LEN);
    XChaCha20Poly1305::new(key.as_bytes().into())
}
