//! Client-side per-peer state machine: `Handshake -> ConnConfirm -> Auth ->
//! Connected`.

use std::sync::Arc;

use log::{debug, warn};

use crate::codec::signal::SignalName;
use crate::codec::{Packet, ShellKind};
use crate::crypto::{derive_session_keys, Cipher, KeyPair, Role};
use crate::transport::ChannelId;

use super::{
    Deadline, AUTH_DEADLINE, CONFIRM_MAGIC, CONN_CONFIRM_DEADLINE, HANDSHAKE_DEADLINE,
    MAX_RETRIES_AUTH, MAX_RETRIES_HANDSHAKE, OK_MAGIC,
};

pub const DATA_CHANNEL: ChannelId = 0;
pub const CONTROL_CHANNEL: ChannelId = 1;

/// Reads a password from the local terminal. Implemented over a real TTY
/// (echo suppressed by the raw-mode guard) in the binary; tests supply a
/// canned in-memory prompt so the state machine can be exercised without
/// a terminal.
pub trait PasswordPrompt {
    fn prompt(&mut self, message: &str) -> std::io::Result<String>;
}

pub enum ClientState {
    Handshake {
        keypair: KeyPair,
        retries: u32,
        max_retries: u32,
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

impl ClientState {
    /// `max_retries` bounds how many malformed/missing handshake replies
    /// are tolerated before giving up; callers typically pass the CLI's
    /// `--max-retries` (falling back to [`MAX_RETRIES_HANDSHAKE`] when not
    /// overridden).
    pub fn enter_handshake(max_retries: u32) -> ClientState {
        ClientState::Handshake {
            keypair: KeyPair::generate(),
            retries: 0,
            max_retries,
            deadline: Deadline::start(HANDSHAKE_DEADLINE),
        }
    }

    pub fn cipher(&self) -> Option<Arc<Cipher>> {
        match self {
            ClientState::Handshake { .. } => None,
            ClientState::ConnConfirm { cipher, .. } => Some(cipher.clone()),
            ClientState::Auth { cipher, .. } => Some(cipher.clone()),
            ClientState::Connected { cipher } => Some(cipher.clone()),
        }
    }
}

/// What a single `on_event`/`on_tick` call produced. `SendPlain`/
/// `SendEncrypted` tell the driver to push a packet over the transport;
/// `Activated` fires exactly once, when the connection first enters
/// `Connected`, so the driver can start the terminal pumps; `Output`
/// carries decrypted shell bytes to write to STDOUT.
pub enum ClientAction {
    Keep,
    SendPlain(Packet, ChannelId),
    SendEncrypted(Packet, ChannelId),
    PromptPassword,
    Activated,
    Output(Vec<u8>),
    Disconnect(String),
}

/// Handles one `Receive` event's decoded bytes, returning the next state
/// and the action for the driver to execute.
pub fn on_receive(state: ClientState, bytes: &[u8]) -> (ClientState, ClientAction) {
    match state {
        ClientState::Handshake {
            keypair,
            retries,
            max_retries,
            deadline,
        } => match Packet::deserialize(bytes) {
            Ok(Packet::Handshake { public_key }) => {
                let keys = derive_session_keys(keypair, &public_key, Role::Client);
                let cipher = Arc::new(Cipher::new(keys));
                debug!("client: handshake complete, entering ConnConfirm");
                let confirm = Packet::bytes(CONFIRM_MAGIC.to_vec());
                (
                    ClientState::ConnConfirm {
                        cipher,
                        deadline: Deadline::start(CONN_CONFIRM_DEADLINE),
                    },
                    ClientAction::SendEncrypted(confirm, DATA_CHANNEL),
                )
            }
            Ok(Packet::ShellMessage {
                kind: ShellKind::Disconnect,
                payload,
            }) => (
                ClientState::Handshake {
                    keypair,
                    retries,
                    max_retries,
                    deadline,
                },
                ClientAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
            ),
            _ => retry_handshake(keypair, retries, max_retries, deadline),
        },
        ClientState::ConnConfirm { cipher, deadline } => match cipher.decrypt(bytes) {
            Ok(plaintext) => match Packet::deserialize(&plaintext) {
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Bytes,
                    payload,
                }) if payload == OK_MAGIC => {
                    debug!("client: server confirmed, prompting for password");
                    (
                        ClientState::Auth {
                            cipher,
                            retries: 0,
                            deadline: Deadline::start(AUTH_DEADLINE),
                        },
                        ClientAction::PromptPassword,
                    )
                }
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Disconnect,
                    payload,
                }) => (
                    ClientState::ConnConfirm { cipher, deadline },
                    ClientAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                ),
                _ => (ClientState::ConnConfirm { cipher, deadline }, ClientAction::Keep),
            },
            Err(e) => {
                warn!("client: failed to decrypt ConnConfirm frame: {e}");
                (ClientState::ConnConfirm { cipher, deadline }, ClientAction::Keep)
            }
        },
        ClientState::Auth {
            cipher,
            retries,
            deadline,
        } => match cipher.decrypt(bytes) {
            Ok(plaintext) => match Packet::deserialize(&plaintext) {
                Ok(Packet::ShellMessage {
                    kind: ShellKind::AuthResponse,
                    payload,
                }) => {
                    if payload == super::AUTH_OK {
                        debug!("client: authenticated");
                        (ClientState::Connected { cipher }, ClientAction::Activated)
                    } else if retries < MAX_RETRIES_AUTH {
                        let message = String::from_utf8_lossy(&payload).into_owned();
                        eprintln!("{message}");
                        (
                            ClientState::Auth {
                                cipher,
                                retries: retries + 1,
                                deadline: Deadline::start(AUTH_DEADLINE),
                            },
                            ClientAction::PromptPassword,
                        )
                    } else {
                        (
                            ClientState::Auth {
                                cipher,
                                retries,
                                deadline,
                            },
                            ClientAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                        )
                    }
                }
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Disconnect,
                    payload,
                }) => (
                    ClientState::Auth {
                        cipher,
                        retries,
                        deadline,
                    },
                    ClientAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                ),
                _ => (
                    ClientState::Auth {
                        cipher,
                        retries,
                        deadline,
                    },
                    ClientAction::Keep,
                ),
            },
            Err(e) => {
                warn!("client: failed to decrypt Auth frame: {e}");
                (
                    ClientState::Auth {
                        cipher,
                        retries,
                        deadline,
                    },
                    ClientAction::Keep,
                )
            }
        },
        ClientState::Connected { cipher } => match cipher.decrypt(bytes) {
            Ok(plaintext) => match Packet::deserialize(&plaintext) {
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Bytes,
                    payload,
                }) => (ClientState::Connected { cipher }, ClientAction::Output(payload)),
                Ok(Packet::ShellMessage {
                    kind: ShellKind::Disconnect,
                    payload,
                }) => (
                    ClientState::Connected { cipher },
                    ClientAction::Disconnect(String::from_utf8_lossy(&payload).into_owned()),
                ),
                _ => (ClientState::Connected { cipher }, ClientAction::Keep),
            },
            Err(_) => {
                // Hostile or reordered frame; drop silently, session continues.
                (ClientState::Connected { cipher }, ClientAction::Keep)
            }
        },
    }
}

fn retry_handshake(
    keypair: KeyPair,
    retries: u32,
    max_retries: u32,
    deadline: Deadline,
) -> (ClientState, ClientAction) {
    let next_retries = retries + 1;
    if next_retries > max_retries {
        (
            ClientState::Handshake {
                keypair,
                retries: next_retries,
                max_retries,
                deadline,
            },
            ClientAction::Disconnect("Maximum retries exceeded".to_string()),
        )
    } else {
        (
            ClientState::Handshake {
                keypair,
                retries: next_retries,
                max_retries,
                deadline,
            },
            ClientAction::Keep,
        )
    }
}

/// Checks the current state's deadline; called by the driver whenever no
/// event arrived within the polling interval.
pub fn on_tick(state: &ClientState) -> Option<ClientAction> {
    let expired = match state {
        ClientState::Handshake { deadline, .. } => deadline.is_expired(),
        ClientState::ConnConfirm { deadline, .. } => deadline.is_expired(),
        ClientState::Auth { deadline, .. } => deadline.is_expired(),
        ClientState::Connected { .. } => false,
    };
    if expired {
        Some(ClientAction::Disconnect("Timeout reached".to_string()))
    } else {
        None
    }
}

/// Builds the `AuthRequest` packet once a password has been obtained in
/// response to `ClientAction::PromptPassword`.
pub fn build_auth_request(user: &str, password: &str) -> Result<Packet, crate::codec::CodecError> {
    Packet::auth_request(user, password)
}

/// A keymap entry recognized while `Connected`: single raw input bytes
/// that mean something other than "forward as shell data".
pub enum StdinAction {
    Forward(u8),
    Signal(SignalName),
    Eof,
}

pub fn classify_stdin_byte(byte: u8) -> StdinAction {
    match byte {
        0x03 => StdinAction::Signal(SignalName::Int),
        0x1c => StdinAction::Signal(SignalName::Quit),
        0x04 => StdinAction::Eof,
        other => StdinAction::Forward(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_session_keys, KeyPair, Role};

    fn connconfirm_ciphers() -> (Arc<Cipher>, Cipher) {
        let client_pair = KeyPair::generate();
        let server_pair = KeyPair::generate();
        let client_pk = client_pair.public_key();
        let server_pk = server_pair.public_key();
        let client_keys = derive_session_keys(client_pair, &server_pk, Role::Client);
        let server_keys = derive_session_keys(server_pair, &client_pk, Role::Server);
        (Arc::new(Cipher::new(client_keys)), Cipher::new(server_keys))
    }

    #[test]
    fn handshake_to_connconfirm_on_valid_peer_handshake() {
        let state = ClientState::enter_handshake(MAX_RETRIES_HANDSHAKE);
        let peer_pk = KeyPair::generate().public_key();
        let packet = Packet::handshake(peer_pk).serialize();
        let (state, action) = on_receive(state, &packet);
        assert!(matches!(state, ClientState::ConnConfirm { .. }));
        assert!(matches!(action, ClientAction::SendEncrypted(_, DATA_CHANNEL)));
    }

    #[test]
    fn handshake_garbage_retries_then_disconnects() {
        let mut state = ClientState::enter_handshake(MAX_RETRIES_HANDSHAKE);
        for _ in 0..MAX_RETRIES_HANDSHAKE {
            let (next, action) = on_receive(state, &[0xff]);
            assert!(matches!(action, ClientAction::Keep));
            state = next;
        }
        let (_, action) = on_receive(state, &[0xff]);
        assert!(matches!(action, ClientAction::Disconnect(reason) if reason == "Maximum retries exceeded"));
    }

    #[test]
    fn custom_max_retries_overrides_the_shared_default() {
        // A caller-supplied bound (e.g. from --max-retries) is honored
        // independently of MAX_RETRIES_HANDSHAKE.
        let mut state = ClientState::enter_handshake(1);
        let (next, action) = on_receive(state, &[0xff]);
        assert!(matches!(action, ClientAction::Keep));
        state = next;
        let (_, action) = on_receive(state, &[0xff]);
        assert!(matches!(action, ClientAction::Disconnect(_)));
    }

    #[test]
    fn connconfirm_matches_ok_magic_and_prompts_password() {
        let (client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ClientState::ConnConfirm {
            cipher: client_cipher,
            deadline: Deadline::start(CONN_CONFIRM_DEADLINE),
        };
        let frame = server_cipher.encrypt(&Packet::bytes(OK_MAGIC.to_vec()).serialize());
        let (state, action) = on_receive(state, &frame);
        assert!(matches!(state, ClientState::Auth { .. }));
        assert!(matches!(action, ClientAction::PromptPassword));
    }

    #[test]
    fn auth_success_activates_session() {
        let (client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ClientState::Auth {
            cipher: client_cipher,
            retries: 0,
            deadline: Deadline::start(AUTH_DEADLINE),
        };
        let frame = server_cipher.encrypt(&Packet::auth_response(super::super::AUTH_OK.to_vec()).serialize());
        let (state, action) = on_receive(state, &frame);
        assert!(matches!(state, ClientState::Connected { .. }));
        assert!(matches!(action, ClientAction::Activated));
    }

    #[test]
    fn auth_failure_retries_once_then_disconnects() {
        let (client_cipher, server_cipher) = connconfirm_ciphers();
        let state = ClientState::Auth {
            cipher: client_cipher,
            retries: 0,
            deadline: Deadline::start(AUTH_DEADLINE),
        };
        let fail = server_cipher.encrypt(&Packet::auth_response(b"nope".to_vec()).serialize());
        let (state, action) = on_receive(state, &fail);
        assert!(matches!(action, ClientAction::PromptPassword));
        assert!(matches!(state, ClientState::Auth { retries: 1, .. }));

        let fail_again = server_cipher.encrypt(&Packet::auth_response(b"nope".to_vec()).serialize());
        let (_, action) = on_receive(state, &fail_again);
        assert!(matches!(action, ClientAction::Disconnect(_)));
    }

    #[test]
    fn malformed_ciphertext_in_connected_is_silently_dropped() {
        let (client_cipher, _server_cipher) = connconfirm_ciphers();
        let state = ClientState::Connected { cipher: client_cipher };
        let (state, action) = on_receive(state, &[1, 2, 3]);
        assert!(matches!(state, ClientState::Connected { .. }));
        assert!(matches!(action, ClientAction::Keep));
    }

    #[test]
    fn timeout_fires_after_deadline_elapses() {
        let state = ClientState::Handshake {
            keypair: KeyPair::generate(),
            retries: 0,
            max_retries: MAX_RETRIES_HANDSHAKE,
            deadline: Deadline::start(std::time::Duration::from_millis(0)),
        };
        std::thread::sleep(std::time::Duration::from_millis(5));
        let action = on_tick(&state).expect("deadline should have expired");
        assert!(matches!(action, ClientAction::Disconnect(reason) if reason == "Timeout reached"));
    }

    #[test]
    fn stdin_keymap_classifies_control_bytes() {
        assert!(matches!(classify_stdin_byte(0x03), StdinAction::Signal(SignalName::Int)));
        assert!(matches!(classify_stdin_byte(0x1c), StdinAction::Signal(SignalName::Quit)));
        assert!(matches!(classify_stdin_byte(0x04), StdinAction::Eof));
        assert!(matches!(classify_stdin_byte(b'a'), StdinAction::Forward(b'a')));
    }
}
