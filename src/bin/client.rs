use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use nix::sys::termios::{self, SetArg};

use cryptshell::client::{send_initial_resize, ClientPump};
use cryptshell::codec::Packet;
use cryptshell::crypto::Cipher;
use cryptshell::state::client::{
    self, build_auth_request, on_receive, on_tick, ClientAction, ClientState, PasswordPrompt,
};
use cryptshell::state::MAX_RETRIES_HANDSHAKE;
use cryptshell::term::RawModeGuard;
use cryptshell::transport::{Event, SendFlags, Transport, MAX_CHANNELS};

const DEFAULT_PORT: u16 = 6969;
const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Connect to a cryptshell server and attach an interactive shell.
#[derive(Parser)]
#[command(name = "cryptshell-client")]
struct Args {
    /// user@host[:port]
    target: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// How many malformed/missing handshake replies to tolerate before
    /// giving up.
    #[arg(long, default_value_t = MAX_RETRIES_HANDSHAKE)]
    max_retries: u32,

    /// Overrides RUST_LOG when given; falls back to RUST_LOG, then "info".
    #[arg(long)]
    log_level: Option<String>,
}

struct Target {
    user: String,
    addr: SocketAddr,
}

fn parse_target(args: &Args) -> Result<Target> {
    let (user, host_part) = args
        .target
        .split_once('@')
        .ok_or_else(|| anyhow!("expected user@host[:port], got '{}'", args.target))?;
    if user.is_empty() {
        return Err(anyhow!("empty username in '{}'", args.target));
    }

    let (host, port) = match host_part.split_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().context("invalid port")?),
        None => (host_part, args.port),
    };

    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve '{host}:{port}'"))?
        .next()
        .ok_or_else(|| anyhow!("'{host}:{port}' resolved to no addresses"))?;

    Ok(Target {
        user: user.to_string(),
        addr,
    })
}

struct TtyPrompt;

impl PasswordPrompt for TtyPrompt {
    fn prompt(&mut self, message: &str) -> std::io::Result<String> {
        eprint!("{message}: ");
        std::io::stderr().flush()?;

        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        if let Some(ref original) = original {
            let mut silenced = original.clone();
            silenced.local_flags.remove(termios::LocalFlags::ECHO);
            let _ = termios::tcsetattr(&stdin, SetArg::TCSAFLUSH, &silenced);
        }

        let mut line = String::new();
        let result = stdin.read_line(&mut line);

        if let Some(original) = original {
            let _ = termios::tcsetattr(&stdin, SetArg::TCSAFLUSH, &original);
        }
        eprintln!();

        result.map(|_| line.trim_end_matches(['\n', '\r']).to_string())
    }
}

enum Outcome {
    Continue,
    Exit(i32),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cryptshell::init_logging(args.log_level.as_deref());

    let target = parse_target(&args)?;
    let transport = Transport::client(MAX_CHANNELS).context("failed to create client transport")?;
    let service_handle = tokio::spawn(transport.clone().service(POLL_INTERVAL));

    transport.connect(target.addr);
    info!("connecting to {} as {}", target.addr, target.user);

    let mut prompt = TtyPrompt;
    let mut raw_guard = RawModeGuard::new();
    let mut state = ClientState::enter_handshake(args.max_retries);
    let mut pump: Option<ClientPump> = None;
    let mut activated = false;

    let exit_code = loop {
        let mut outcome = Outcome::Continue;

        if let Some(event) = transport.recv() {
            match event {
                Event::Connect { .. } => {
                    if let ClientState::Handshake { keypair, .. } = &state {
                        let frame = Packet::handshake(keypair.public_key()).serialize();
                        send(&transport, target.addr, &frame, client::DATA_CHANNEL);
                    }
                }
                Event::Receive { bytes, .. } => {
                    let (next_state, action) = on_receive(state, &bytes);
                    state = next_state;
                    if matches!(action, ClientAction::Activated) {
                        activated = true;
                    }
                    outcome = handle_action(action, &state, &target, &mut prompt, &transport, &mut raw_guard);
                }
                Event::Disconnect { .. } => {
                    warn!("transport disconnected");
                    outcome = Outcome::Exit(if activated { 0 } else { 1 });
                }
            }
        } else if let Some(action) = on_tick(&state) {
            outcome = handle_action(action, &state, &target, &mut prompt, &transport, &mut raw_guard);
        } else {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if pump.is_none() {
            if let ClientState::Connected { cipher } = &state {
                pump = ClientPump::spawn(cipher.clone(), transport.clone(), target.addr).ok();
            }
        }

        if let Outcome::Exit(code) = outcome {
            break code;
        }
    };

    if let Some(pump) = pump {
        pump.stop().await;
    }
    raw_guard.disable();
    service_handle.abort();
    std::process::exit(exit_code);
}

fn handle_action(
    action: ClientAction,
    state: &ClientState,
    target: &Target,
    prompt: &mut TtyPrompt,
    transport: &Transport,
    raw_guard: &mut RawModeGuard,
) -> Outcome {
    match action {
        ClientAction::Keep => Outcome::Continue,
        ClientAction::SendPlain(packet, channel) => {
            send(transport, target.addr, &packet.serialize(), channel);
            Outcome::Continue
        }
        ClientAction::SendEncrypted(packet, channel) => {
            if let Some(cipher) = state.cipher() {
                encrypt_and_send(&cipher, transport, target.addr, packet, channel);
            } else {
                warn!("client: asked to send encrypted with no cipher available");
            }
            Outcome::Continue
        }
        ClientAction::PromptPassword => {
            match prompt.prompt("Password") {
                Ok(password) => match build_auth_request(&target.user, &password) {
                    Ok(packet) => {
                        if let Some(cipher) = state.cipher() {
                            encrypt_and_send(&cipher, transport, target.addr, packet, client::DATA_CHANNEL);
                        }
                        Outcome::Continue
                    }
                    Err(e) => {
                        error!("failed to build auth request: {e}");
                        Outcome::Exit(1)
                    }
                },
                Err(e) => {
                    error!("failed to read password: {e}");
                    Outcome::Exit(1)
                }
            }
        }
        ClientAction::Activated => {
            info!("session established");
            if let Some(cipher) = state.cipher() {
                send_initial_resize(&cipher, transport, target.addr);
            }
            if let Err(e) = raw_guard.enable() {
                warn!("failed to enable raw terminal mode: {e}");
            }
            Outcome::Continue
        }
        ClientAction::Output(bytes) => {
            let _ = std::io::stdout().write_all(&bytes);
            let _ = std::io::stdout().flush();
            Outcome::Continue
        }
        ClientAction::Disconnect(reason) => {
            error!("disconnected: {reason}");
            if let Some(cipher) = state.cipher() {
                encrypt_and_send(&cipher, transport, target.addr, Packet::disconnect(&reason), client::DATA_CHANNEL);
            }
            transport.disconnect(target.addr);
            Outcome::Exit(1)
        }
    }
}

fn encrypt_and_send(cipher: &Cipher, transport: &Transport, peer: SocketAddr, packet: Packet, channel: u8) {
    let frame = cipher.encrypt(&packet.serialize());
    send(transport, peer, &frame, channel);
}

fn send(transport: &Transport, peer: SocketAddr, bytes: &[u8], channel: u8) {
    if let Err(e) = transport.send(peer, bytes, channel, SendFlags::Reliable) {
        error!("send failed: {e}");
    }
}
