//! Key agreement and AEAD: everything the state machines need to turn an
//! ephemeral X25519 exchange into an authenticated, encrypted channel.

pub mod cipher;
pub mod keys;
pub mod session_keys;

pub use cipher::{AeadError, Cipher};
pub use keys::KeyPair;
pub use session_keys::{derive_session_keys, Role, SessionKeys};
