use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use cryptshell::codec::Packet;
use cryptshell::crypto::Cipher;
use cryptshell::error::Error;
use cryptshell::pty::{PtyPump, PtySession};
use cryptshell::state::server::{
    self, failure_response, on_auth_result, on_receive, on_tick, success_response, ServerAction,
    ServerState,
};
use cryptshell::transport::{Event, SendFlags, Transport, MAX_CHANNELS};

const DEFAULT_PORT: u16 = 6969;
const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Run a cryptshell server: accept authenticated clients and attach them
/// to a login shell behind a PTY.
#[derive(Parser)]
#[command(name = "cryptshell-server")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 64)]
    max_peers: usize,

    /// Override the authenticated user's `/etc/passwd` shell.
    #[arg(long)]
    shell: Option<String>,

    /// Overrides RUST_LOG when given; falls back to RUST_LOG, then "info".
    #[arg(long)]
    log_level: Option<String>,
}

struct PeerSession {
    state: ServerState,
    pty: Option<Arc<PtySession>>,
    pump: Option<PtyPump>,
}

impl PeerSession {
    fn new() -> PeerSession {
        PeerSession {
            state: ServerState::enter_handshake(),
            pty: None,
            pump: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cryptshell::init_logging(args.log_level.as_deref());

    let bind_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid --bind/--port")?;

    let transport = Transport::bind(bind_addr, MAX_CHANNELS).context("failed to bind server transport")?;
    let service_handle = tokio::spawn(transport.clone().service(POLL_INTERVAL));
    info!("listening on {bind_addr}");

    let mut peers: HashMap<SocketAddr, PeerSession> = HashMap::new();

    loop {
        let Some(event) = transport.recv() else {
            tokio::time::sleep(POLL_INTERVAL).await;
            tick_all(&mut peers, &transport).await;
            continue;
        };

        match event {
            Event::Connect { peer } => {
                if !peers.contains_key(&peer) && peers.len() >= args.max_peers {
                    warn!("rejecting {peer}: at max_peers ({})", args.max_peers);
                    transport.disconnect(peer);
                } else {
                    info!("peer connected: {peer}");
                    peers.entry(peer).or_insert_with(PeerSession::new);
                }
            }
            Event::Receive { peer, bytes, .. } => {
                handle_receive(&mut peers, &transport, peer, &bytes, &args).await;
            }
            Event::Disconnect { peer, .. } => {
                info!("peer disconnected: {peer}");
                if let Some(mut session) = peers.remove(&peer) {
                    if let Some(pump) = session.pump.take() {
                        pump.stop().await;
                    }
                }
            }
        }

        tick_all(&mut peers, &transport).await;
    }
}

async fn tick_all(peers: &mut HashMap<SocketAddr, PeerSession>, transport: &Arc<Transport>) {
    let expired: Vec<SocketAddr> = peers
        .iter()
        .filter(|(_, s)| on_tick(&s.state).is_some())
        .map(|(peer, _)| *peer)
        .collect();

    for peer in expired {
        if let Some(session) = peers.get(&peer) {
            if let Some(cipher) = session.state.cipher() {
                let reason = "Timeout reached";
                let frame = cipher.encrypt(&Packet::disconnect(reason).serialize());
                let _ = transport.send(peer, &frame, server::DATA_CHANNEL, SendFlags::Reliable);
            }
        }
        transport.disconnect(peer);
        if let Some(mut session) = peers.remove(&peer) {
            if let Some(pump) = session.pump.take() {
                pump.stop().await;
            }
        }
    }
}

async fn handle_receive(
    peers: &mut HashMap<SocketAddr, PeerSession>,
    transport: &Arc<Transport>,
    peer: SocketAddr,
    bytes: &[u8],
    args: &Args,
) {
    let Some(session) = peers.get_mut(&peer) else {
        return;
    };

    let state = std::mem::replace(&mut session.state, ServerState::enter_handshake());
    let (next_state, action) = on_receive(state, bytes);
    session.state = next_state;

    match action {
        ServerAction::Keep => {}
        ServerAction::SendPlain(packet, channel) => {
            send(transport, peer, &packet.serialize(), channel);
        }
        ServerAction::SendEncrypted(packet, channel) => {
            if let Some(cipher) = session.state.cipher() {
                encrypt_and_send(&cipher, transport, peer, packet, channel);
            }
        }
        ServerAction::Authenticate { username, password } => {
            authenticate_peer(peers, transport, peer, username, password, args.shell.clone()).await;
        }
        ServerAction::WriteToPty(data) => {
            if let Some(pty) = peers.get(&peer).and_then(|s| s.pty.clone()) {
                match tokio::task::spawn_blocking(move || pty.write(&data)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("failed to write to pty for peer {peer}: {e}"),
                    Err(e) => warn!("pty write task for peer {peer} panicked: {e}"),
                }
            }
        }
        ServerAction::SendSignal(name) => {
            if let Some(pty) = peers.get(&peer).and_then(|s| s.pty.clone()) {
                if let Err(e) = pty.send_signal(name.to_nix()) {
                    warn!("failed to forward signal to peer {peer}: {e}");
                }
            }
        }
        ServerAction::Resize { rows, cols, x_pixels, y_pixels } => {
            if let Some(pty) = peers.get(&peer).and_then(|s| s.pty.clone()) {
                if let Err(e) = pty.resize(rows, cols, x_pixels, y_pixels) {
                    warn!("failed to resize pty for peer {peer}: {e}");
                }
            }
        }
        ServerAction::Activated => {}
        ServerAction::Disconnect(reason) => {
            error!("peer {peer} disconnected: {reason}");
            if let Some(cipher) = peers.get(&peer).and_then(|s| s.state.cipher()) {
                encrypt_and_send(&cipher, transport, peer, Packet::disconnect(&reason), server::DATA_CHANNEL);
            }
            transport.disconnect(peer);
            if let Some(mut session) = peers.remove(&peer) {
                if let Some(pump) = session.pump.take() {
                    pump.stop().await;
                }
            }
        }
    }
}

async fn authenticate_peer(
    peers: &mut HashMap<SocketAddr, PeerSession>,
    transport: &Arc<Transport>,
    peer: SocketAddr,
    username: String,
    password: String,
    shell_override: Option<String>,
) {
    let verdict = tokio::task::spawn_blocking({
        let username = username.clone();
        move || cryptshell::auth::authenticate(&username, &password)
    })
    .await
    .unwrap_or_else(|e| Err(Error::AuthFailure(format!("auth task panicked: {e}"))));

    let Some(session) = peers.get_mut(&peer) else {
        return;
    };
    let state = std::mem::replace(&mut session.state, ServerState::enter_handshake());

    match verdict {
        Ok(()) => match PtySession::spawn(&username, shell_override.as_deref()) {
            Ok(pty) => {
                let (next_state, action) = on_auth_result(state, true, success_response());
                session.state = next_state;
                if let (ServerAction::SendEncrypted(packet, channel), Some(cipher)) =
                    (action, session.state.cipher())
                {
                    encrypt_and_send(&cipher, transport, peer, packet, channel);
                }
                match pty.duplicate_master() {
                    Ok(master) => {
                        let pty = Arc::new(pty);
                        if let Some(cipher) = session.state.cipher() {
                            session.pump = Some(PtyPump::spawn(master, cipher, transport.clone(), peer));
                        }
                        session.pty = Some(pty);
                        info!("peer {peer} authenticated as '{username}'");
                    }
                    Err(e) => {
                        error!("failed to duplicate pty master for peer {peer}: {e}");
                        transport.disconnect(peer);
                    }
                }
            }
            Err(e) => {
                error!("pty spawn failed for peer {peer}: {e}");
                // A PTY-spawn failure is not a password-correctness
                // failure: it does not go through the auth-retry state
                // machine, it is unconditionally fatal to the connection.
                let reason = e.disconnect_reason();
                if let Some(cipher) = state.cipher() {
                    encrypt_and_send(&cipher, transport, peer, Packet::disconnect(&reason), server::DATA_CHANNEL);
                }
                session.state = state;
                transport.disconnect(peer);
            }
        },
        Err(e) => {
            warn!("authentication failed for peer {peer} ('{username}'): {e}");
            let (next_state, action) = on_auth_result(state, false, failure_response(&username));
            session.state = next_state;
            match action {
                ServerAction::SendEncrypted(packet, channel) => {
                    // Retries remain; stay on this connection and wait
                    // for the client's next AuthRequest.
                    if let Some(cipher) = session.state.cipher() {
                        encrypt_and_send(&cipher, transport, peer, packet, channel);
                    }
                }
                ServerAction::Disconnect(reason) => {
                    error!("peer {peer} exhausted auth retries: {reason}");
                    if let Some(cipher) = session.state.cipher() {
                        encrypt_and_send(
                            &cipher,
                            transport,
                            peer,
                            Packet::auth_response(reason.into_bytes()),
                            server::DATA_CHANNEL,
                        );
                    }
                    transport.disconnect(peer);
                }
                _ => {}
            }
        }
    }
}

fn encrypt_and_send(cipher: &Cipher, transport: &Transport, peer: SocketAddr, packet: Packet, channel: u8) {
    let frame = cipher.encrypt(&packet.serialize());
    send(transport, peer, &frame, channel);
}

fn send(transport: &Transport, peer: SocketAddr, bytes: &[u8], channel: u8) {
    if let Err(e) = transport.send(peer, bytes, channel, SendFlags::Reliable) {
        error!("send to {peer} failed: {e}");
    }
}
