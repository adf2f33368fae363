//! `cryptshell`: an end-to-end-encrypted remote shell tunnel over a
//! reliable UDP transport.
//!
//! The two binaries (`cryptshell-client`, `cryptshell-server`) are thin
//! drivers over this library: they own the `tokio` runtime, the process's
//! single `Transport`, and the event loop that feeds `Receive`/`Connect`/
//! `Disconnect` events into the per-peer state machines in [`state`].

pub mod auth;
pub mod client;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod pty;
pub mod state;
pub mod term;
pub mod transport;

pub use error::{Error, Result};

/// Initializes the global logger per SPEC_FULL §4.9: an explicit
/// `--log-level` wins outright; otherwise `RUST_LOG` is honored; failing
/// both, `info`.
pub fn init_logging(log_level: Option<&str>) {
    let mut builder = env_logger::Builder::new();
    match log_level {
        Some(level) => {
            builder.parse_filters(level);
        }
        None => match std::env::var("RUST_LOG") {
            Ok(spec) => {
                builder.parse_filters(&spec);
            }
            Err(_) => {
                builder.filter_level(log::LevelFilter::Info);
            }
        },
    }
    builder.init();
}
