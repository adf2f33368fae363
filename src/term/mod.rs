//! Terminal raw-mode guard: a process-wide singleton that captures the
//! original STDIN termios once, toggles raw mode idempotently, and
//! guarantees restoration on drop — used only on the client, around the
//! lifetime of a `Connected` session.

use std::sync::OnceLock;

use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::isatty;

use crate::error::{Error, Result};

static ORIGINAL: OnceLock<Option<Termios>> = OnceLock::new();

/// Scoped raw-mode acquisition. `enable` is idempotent; `drop` always
/// restores the original mode if it was ever captured, even if `enable`
/// was never called on this particular instance.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    pub fn new() -> RawModeGuard {
        ORIGINAL.get_or_init(capture_original);
        RawModeGuard { enabled: false }
    }

    pub fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        let Some(Some(original)) = ORIGINAL.get() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "STDIN is not a TTY",
            )));
        };
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(std::io::stdin(), SetArg::TCSAFLUSH, &raw)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        if let Some(Some(original)) = ORIGINAL.get() {
            let _ = termios::tcsetattr(std::io::stdin(), SetArg::TCSAFLUSH, original);
        }
        self.enabled = false;
    }
}

impl Default for RawModeGuard {
    fn default() -> Self {
        RawModeGuard::new()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.disable();
    }
}

fn capture_original() -> Option<Termios> {
    if !isatty(std::io::stdin()).unwrap_or(false) {
        return None;
    }
    termios::tcgetattr(std::io::stdin()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_without_enable_is_a_no_op() {
        let mut guard = RawModeGuard::new();
        guard.disable();
        guard.disable();
    }

    #[test]
    fn double_enable_is_idempotent_when_not_a_tty() {
        // Under `cargo test`, STDIN is typically not a TTY; `enable`
        // should fail cleanly rather than panic, and calling it twice
        // should not change that outcome.
        let mut guard = RawModeGuard::new();
        let first = guard.enable();
        let second = guard.enable();
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
