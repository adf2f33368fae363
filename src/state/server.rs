//! Server-side per-peer state machine: mirror of the client's
//! `Handshake -> ConnConfirm -> Auth -> Connected`, with the addition that
//! `Auth` cannot complete synchronously — verifying a password against PAM
//! and spawning a PTY are blocking/privileged operations, so `on_receive`
//! only extracts the `AuthRequest` and hands it back to the driver as
//! `ServerAction::Authenticate`; the driver performs the check out of line
//! and reports the outcome back in through `on_auth_result`.

use std::sync::Arc;

use log::{debug, warn};

use crate::codec::signal::SignalName;
use crate::codec::{Packet, ShellKind};
use crate::crypto::{derive_session_keys, Cipher, KeyPair, Role};
use crate::transport::ChannelId;

use super::{
    Deadline, AUTH_DEADLINE, AUTH_OK, CONFIRM_MAGIC, CONN_CONFIRM_DEADLINE, HANDSHAKE_DEADLINE,
    MAX_RETRIES_AUTH, MAX_RETRIES_HANDSHAKE, OK_MAGIC,
};

pub const DATA_CHANNEL: ChannelId = 0;
pub const CONTROL_CHANNEL: ChannelId = 1;

pub enum ServerState {
    Handshake {
        keypair: KeyPair,
        retries: u32,
        deadline: Deadline,
    },
    ConnConfirm {
        cipher: Arc<Cipher>,
        deadline: Deadline,
    },
    Auth {
        cipher: Arc<Cipher>,
        retries: u32,
        deadline: Deadline,
    },
    Connected {
        cipher: Arc<Cipher>,
    },
}

impl ServerState {
    pub fn enter_handshake() -> ServerState {
        ServerState::Handshake {
            keypair: KeyPair::generate(),
            retries: 0,
            deadline: Deadline::start(HANDSHAKE_DEADLINE),
        }
    }

    pub fn cipher(&self) -> Option<Arc<Cipher>> {
        match self {
            ServerState::Handshake { .. } => None,
            ServerState::ConnConfirm { cipher, .. } => Some(cipher.clone()),
            ServerState::Auth { cipher, .. } => Some(cipher.clone()),
            ServerState::Connected { cipher } => Some(cipher.clone()),
        }
    }
}

pub enum ServerAction {
    Keep,
    SendPlain(Packet, ChannelId),
    SendEncrypted(Packet, ChannelId),
    /// Decrypted and parsed an `AuthRequest`; the driver must verify it
    /// against PAM (off the event loop) and call `on_auth_result` with
    /// the outcome.
    Authenticate { username: String, password: String },
    WriteToPty(Vec<u8>),
    SendSignal(SignalName),
    Resize {
        rows: u16,
        cols: u16,
        x_pixels: u16,
        y_pixels: u16,
    },
    Activated,
    Disconnect(String),
}

pub fn on_receive(state: ServerState, bytes: &[u8]) -> (ServerState, ServerAction) {
    match state {
        ServerState::Handshake {
            keypair,
            retries,
            deadline,
        } => match Packet::deserialize(bytes) {
            Ok(Packet::Handshake { public_key }) => {
                let own_public = keypair.public_key();
                let keys = derive_session_keys(keypair, &public_key, Role::Server);
                let cipher = Arc::new(Cipher::new(keys));
                debug!("server: handshake complete, entering ConnConfirm");
                let reply = Packet::handshake(own_public);
                (
                    ServerState::ConnConfirm {
                        cipher,
                        deadline: Deadline::start(CONN_CONFIRM_DEADLINE),
                    },
                    ServerAction::SendPlain(reply, DATA_CHANNEL),
                )
            }
            _ => retry_handshake(keypair, retries, deadline),
        },
        ServerState::ConnConfirm { cipher, deadline } => match cipher.decrypt(bytes) {
            Ok(plaintext) => match Packet::deserialize(&plaintext) {
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Bytes,
                    payload,
                }) if payload == CONFIRM_MAGIC => {
                    debug!("server: client confirmed, awaiting auth");
                    let ok = Packet::bytes(OK_MAGIC.to_vec());
                    (
                        ServerState::Auth {
                            cipher,
                            retries: 0,
                            deadline: Deadline::start(AUTH_DEADLINE),
                        },
                        ServerAction::SendEncrypted(ok, DATA_CHANNEL),
                    )
                }
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Disconnect,
                    payload,
                }) => (
                    ServerState::ConnConfirm { cipher, deadline },
                    ServerAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                ),
                _ => (ServerState::ConnConfirm { cipher, deadline }, ServerAction::Keep),
            },
            Err(e) => {
                warn!("server: failed to decrypt ConnConfirm frame: {e}");
                (ServerState::ConnConfirm { cipher, deadline }, ServerAction::Keep)
            }
        },
        ServerState::Auth { cipher, retries, deadline } => match cipher.decrypt(bytes) {
            Ok(plaintext) => match Packet::deserialize(&plaintext) {
                Ok(Packet::AuthRequest { username, password }) => (
                    ServerState::Auth { cipher, retries, deadline },
                    ServerAction::Authenticate { username, password },
                ),
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Disconnect,
                    payload,
                }) => (
                    ServerState::Auth { cipher, retries, deadline },
                    ServerAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                ),
                _ => (ServerState::Auth { cipher, retries, deadline }, ServerAction::Keep),
            },
            Err(e) => {
                warn!("server: failed to decrypt Auth frame: {e}");
                (ServerState::Auth { cipher, retries, deadline }, ServerAction::Keep)
            }
        },
        ServerState::Connected { cipher } => match cipher.decrypt(bytes) {
            Ok(plaintext) => match Packet::deserialize(&plaintext) {
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Bytes,
                    payload,
                }) => (ServerState::Connected { cipher }, ServerAction::WriteToPty(payload)),
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Signal,
                    payload,
                }) => match SignalName::from_bytes(&payload) {
                    Some(name) => (ServerState::Connected { cipher }, ServerAction::SendSignal(name)),
                    None => (ServerState::Connected { cipher }, ServerAction::Keep),
                },
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Disconnect,
                    payload,
                }) => (
                    ServerState::Connected { cipher },
                    ServerAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                ),
                Ok(Packet::Resize {
                    rows,
                    cols,
                    x_pixels,
                    y_pixels,
                }) => (
                    ServerState::Connected { cipher },
                    ServerAction::Resize {
                        rows,
                        cols,
                        x_pixels,
                        y_pixels,
                    },
                ),
                _ => (ServerState::Connected { cipher }, ServerAction::Keep),
            },
            Err(_) => (ServerState::Connected { cipher }, ServerAction::Keep),
        },
    }
}

/// Completes an in-flight `Authenticate` action. `accepted` carries the
/// PAM verdict; `response` is the raw `AuthResponse` payload: `"OK\0"` on
/// success, a human-readable error string otherwise.
///
/// A rejected attempt is allowed one retry (`MAX_RETRIES_AUTH`), mirroring
/// the client's own retry bound: the connection stays in `Auth` and the
/// driver keeps listening for another `AuthRequest` on it. Only once
/// retries are exhausted does this return a `Disconnect` action.
pub fn on_auth_result(state: ServerState, accepted: bool, response: Vec<u8>) -> (ServerState, ServerAction) {
    match state {
        ServerState::Auth { cipher, retries, deadline } => {
            if accepted {
                debug!("server: authentication succeeded");
                let packet = Packet::auth_response(response);
                (
                    ServerState::Connected { cipher },
                    // The driver sends `packet` encrypted and only then
                    // treats the connection as Activated (starts the PTY
                    // pump); bundling both in one action keeps the two
                    // steps from being reordered by a careless caller.
                    ServerAction::SendEncrypted(packet, DATA_CHANNEL),
                )
            } else if retries < MAX_RETRIES_AUTH {
                debug!("server: authentication failed, awaiting retry");
                let packet = Packet::auth_response(response);
                (
                    ServerState::Auth {
                        cipher,
                        retries: retries + 1,
                        deadline: Deadline::start(AUTH_DEADLINE),
                    },
                    ServerAction::SendEncrypted(packet, DATA_CHANNEL),
                )
            } else {
                (
                    ServerState::Auth { cipher, retries, deadline },
                    ServerAction::Disconnect(String::from_utf8_lossy(&response).into_owned()),
                )
            }
        }
        other => (other, ServerAction::Keep),
    }
}

fn retry_handshake(keypair: KeyPair, retries: u32, deadline: Deadline) -> (ServerState, ServerAction) {
    let next_retries = retries + 1;
    if next_retries > MAX_RETRIES_HANDSHAKE {
        (
            ServerState::Handshake {
                keypair,
                retries: next_retries,
                deadline,
            },
            ServerAction::Disconnect("Maximum retries exceeded".to_string()),
        )
    } else {
        (
            ServerState::Handshake {
                keypair,
                retries: next_retries,
                deadline,
            },
            ServerAction::Keep,
        )
    }
}

pub fn on_tick(state: &ServerState) -> Option<ServerAction> {
    let expired = match state {
        ServerState::Handshake { deadline, .. } => deadline.is_expired(),
        ServerState::ConnConfirm { deadline, .. } => deadline.is_expired(),
        ServerState::Auth { deadline, .. } => deadline.is_expired(),
        ServerState::Connected { .. } => false,
    };
    if expired {
        Some(ServerAction::Disconnect("Timeout reached".into()))
    } else {
        None
    }
}

/// Whether an accepted auth response body is exactly the fixed OK magic,
/// used by the driver to decide which `response` bytes to pass to
/// `on_auth_result`.
pub fn success_response() -> Vec<u8> {
    AUTH_OK.to_vec()
}

pub fn failure_response(username: &str) -> Vec<u8> {
    format!("Failed to authenticate user '{username}'.").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_session_keys, KeyPair, Role};

    fn connconfirm_ciphers() -> (Cipher, Arc<Cipher>) {
        let client_pair = KeyPair::generate();
        let server_pair = KeyPair::generate();
        let client_pk = client_pair.public_key();
        let server_pk = server_pair.public_key();
        let client_keys = derive_session_keys(client_pair, &server_pk, Role::Client);
        let server_keys = derive_session_keys(server_pair, &client_pk, Role::Server);
        (Cipher::new(client_keys), Arc::new(Cipher::new(server_keys)))
    }

    #[test]
    fn handshake_replies_plaintext_and_enters_connconfirm() {
        let state = ServerState::enter_handshake();
        let peer_pk = KeyPair::generate().public_key();
        let packet = Packet::handshake(peer_pk).serialize();
        let (state, action) = on_receive(state, &packet);
        assert!(matches!(state, ServerState::ConnConfirm { .. }));
        assert!(matches!(action, ServerAction::SendPlain(Packet::Handshake { .. }, DATA_CHANNEL)));
    }

    #[test]
    fn handshake_garbage_retries_then_disconnects() {
        let mut state = ServerState::enter_handshake();
        for _ in 0..MAX_RETRIES_HANDSHAKE {
            let (next, action) = on_receive(state, &[0xff]);
            assert!(matches!(action, ServerAction::Keep));
            state = next;
        }
        let (_, action) = on_receive(state, &[0xff]);
        assert!(matches!(action, ServerAction::Disconnect(reason) if reason == "Maximum retries exceeded"));
    }

    #[test]
    fn connconfirm_matches_confirm_magic_and_replies_ok() {
        let (client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ServerState::ConnConfirm {
            cipher: server_cipher,
            deadline: Deadline::start(CONN_CONFIRM_DEADLINE),
        };
        let frame = client_cipher.encrypt(&Packet::bytes(CONFIRM_MAGIC.to_vec()).serialize());
        let (state, action) = on_receive(state, &frame);
        assert!(matches!(state, ServerState::Auth { .. }));
        assert!(matches!(action, ServerAction::SendEncrypted(_, DATA_CHANNEL)));
    }

    #[test]
    fn auth_request_is_handed_to_driver_not_decided_inline() {
        let (client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ServerState::Auth {
            cipher: server_cipher,
            retries: 0,
            deadline: Deadline::start(AUTH_DEADLINE),
        };
        let frame = client_cipher.encrypt(
            &Packet::auth_request("alice", "pw").unwrap().serialize(),
        );
        let (state, action) = on_receive(state, &frame);
        assert!(matches!(state, ServerState::Auth { .. }));
        match action {
            ServerAction::Authenticate { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "pw");
            }
            _ => panic!("expected Authenticate action"),
        }
    }

    #[test]
    fn auth_result_success_activates_connection() {
        let (_client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ServerState::Auth {
            cipher: server_cipher,
            retries: 0,
            deadline: Deadline::start(AUTH_DEADLINE),
        };
        let (state, action) = on_auth_result(state, true, success_response());
        assert!(matches!(state, ServerState::Connected { .. }));
        assert!(matches!(action, ServerAction::SendEncrypted(_, DATA_CHANNEL)));
    }

    #[test]
    fn auth_result_failure_allows_one_retry_then_disconnects() {
        let (_client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ServerState::Auth {
            cipher: server_cipher,
            retries: 0,
            deadline: Deadline::start(AUTH_DEADLINE),
        };
        let (state, action) = on_auth_result(state, false, failure_response("alice"));
        assert!(matches!(state, ServerState::Auth { retries: 1, .. }));
        assert!(matches!(action, ServerAction::SendEncrypted(_, DATA_CHANNEL)));

        let (state, action) = on_auth_result(state, false, failure_response("alice"));
        assert!(matches!(state, ServerState::Auth { retries: 1, .. }));
        assert!(matches!(action, ServerAction::Disconnect(_)));
    }

    #[test]
    fn connected_dispatches_bytes_signal_resize() {
        let (client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ServerState::Connected { cipher: server_cipher };

        let bytes_frame = client_cipher.encrypt(&Packet::bytes(b"ls\n".to_vec()).serialize());
        let (state, action) = on_receive(state, &bytes_frame);
        assert!(matches!(action, ServerAction::WriteToPty(data) if data == b"ls\n"));

        let signal_frame = client_cipher.encrypt(&Packet::signal(SignalName::Int).serialize());
        let (state, action) = on_receive(state, &signal_frame);
        assert!(matches!(action, ServerAction::SendSignal(SignalName::Int)));

        let resize_frame = client_cipher.encrypt(&Packet::resize(24, 80, 0, 0).serialize());
        let (_state, action) = on_receive(state, &resize_frame);
        assert!(matches!(
            action,
            ServerAction::Resize {
                rows: 24,
                cols: 80,
                x_pixels: 0,
                y_pixels: 0
            }
        ));
    }

    #[test]
    fn malformed_ciphertext_in_connected_is_silently_dropped() {
        let (_client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ServerState::Connected { cipher: server_cipher };
        let (state, action) = on_receive(state, &[9, 9, 9]);
        assert!(matches!(state, ServerState::Connected { .. }));
        assert!(matches!(action, ServerAction::Keep));
    }

    #[test]
    fn timeout_fires_after_deadline_elapses() {
        let state = ServerState::Handshake {
            keypair: KeyPair::generate(),
            retries: 0,
            deadline: Deadline::start(std::time::Duration::from_millis(0)),
        };
        std::thread::sleep(std::time::Duration::from_millis(5));
        let action = on_tick(&state).expect("deadline should have expired");
        assert!(matches!(action, ServerAction::Disconnect(reason) if reason == "Timeout reached"));
    }
}
