//! PTY allocation and privilege-dropped child shell spawn.
//!
//! Creation is `openpty` (atomically performs the
//! `posix_openpt`/`grantpt`/`unlockpt`/`ptsname` sequence) followed by
//! `fork`; the child becomes session leader, makes the slave its
//! controlling terminal, raw-configures it, drops to the target user via
//! `initgroups`/`setgid`/`setuid`, `chdir`s to the user's home, and
//! `execve`s their login shell. The parent retains only the master FD and
//! the child PID.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use nix::pty::{openpty, Winsize};
use nix::sys::termios::{self, SetArg};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Gid, Uid, User};

use crate::error::{Error, Result};

const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

pub struct PtySession {
    master: OwnedFd,
    child_pid: unistd::Pid,
}

impl PtySession {
    /// Spawns `user`'s login shell behind a fresh PTY. Must be called
    /// with enough privilege to `setuid` to the target user (i.e. the
    /// server process itself runs as root).
    pub fn spawn(user: &str, shell_override: Option<&str>) -> Result<PtySession> {
        let pw = User::from_name(user)
            .map_err(|e| Error::PtySpawn(format!("passwd lookup for '{user}' failed: {e}")))?
            .ok_or_else(|| Error::PtySpawn(format!("no such user '{user}'")))?;

        let shell = shell_override
            .map(|s| s.to_string())
            .unwrap_or_else(|| pw.shell.to_string_lossy().into_owned());

        let winsize = Winsize {
            ws_row: INITIAL_ROWS,
            ws_col: INITIAL_COLS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| Error::PtySpawn(format!("openpty failed: {e}")))?;

        // Safety: fork() followed immediately by either returning to the
        // caller (parent) or an exec/exit (child) that never unwinds
        // through Rust destructors built on the pre-fork heap state.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);
                Ok(PtySession {
                    master: pty.master,
                    child_pid: child,
                })
            }
            Ok(ForkResult::Child) => {
                drop(pty.master);
                run_child(pty.slave, &pw, &shell);
                // run_child only returns on failure to exec.
                std::process::exit(1);
            }
            Err(e) => Err(Error::PtySpawn(format!("fork failed: {e}"))),
        }
    }

    pub fn master_fd(&self) -> &OwnedFd {
        &self.master
    }

    pub fn child_pid(&self) -> unistd::Pid {
        self.child_pid
    }

    /// Writes shell input to the PTY master. Blocking, like every other
    /// PTY ioctl/write here; callers on the async event loop dispatch it
    /// through `spawn_blocking` or accept the (tiny, pipe-buffered) risk
    /// of stalling their task.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        unistd::write(self.master.as_fd(), data)
            .map(|_| ())
            .map_err(|e| Error::PtySpawn(format!("write to pty master failed: {e}")))
    }

    /// A non-blocking `dup` of the master fd wrapped as a `tokio::fs::File`,
    /// for the read side of the connection (see [`crate::pty::pump`]) to own
    /// independently of this struct's lifetime.
    pub fn duplicate_master(&self) -> Result<tokio::fs::File> {
        let dup = unistd::dup(self.master.as_raw_fd())
            .map_err(|e| Error::PtySpawn(format!("dup of pty master failed: {e}")))?;
        // Safety: `dup` just returned a fresh, uniquely-owned fd.
        let file = unsafe { std::fs::File::from_raw_fd(dup) };
        file.set_nonblocking(true).map_err(Error::Io)?;
        Ok(tokio::fs::File::from_std(file))
    }

    pub fn resize(&self, rows: u16, cols: u16, x_pixels: u16, y_pixels: u16) -> Result<()> {
        let ws = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: x_pixels,
            ws_ypixel: y_pixels,
        };
        set_winsize(self.master.as_raw_fd(), &ws)
            .map_err(|e| Error::PtySpawn(format!("TIOCSWINSZ failed: {e}")))
    }

    /// Delivers `signal` to the PTY's foreground process group, i.e. the
    /// shell and whatever job it currently has in the foreground.
    pub fn send_signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        let pgrp = nix::unistd::tcgetpgrp(&self.master)
            .map_err(|e| Error::PtySpawn(format!("tcgetpgrp failed: {e}")))?;
        nix::sys::signal::killpg(pgrp, signal)
            .map_err(|e| Error::PtySpawn(format!("killpg failed: {e}")))
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        let _ = waitpid(self.child_pid, None);
    }
}

fn run_child(slave: OwnedFd, pw: &User, shell: &str) -> ! {
    let _ = unistd::setsid();

    if let Err(e) = nix::sys::termios::tcgetattr(&slave).and_then(|mut term| {
        termios::cfmakeraw(&mut term);
        term.input_flags.insert(termios::InputFlags::ICRNL | termios::InputFlags::IUTF8);
        term.output_flags.insert(termios::OutputFlags::OPOST | termios::OutputFlags::ONLCR);
        termios::tcsetattr(&slave, SetArg::TCSANOW, &term)
    }) {
        log::warn!("pty child: failed to configure raw termios: {e}");
    }

    set_controlling_terminal(slave.as_raw_fd());

    for fd in 0..=2 {
        let _ = unistd::dup2(slave.as_raw_fd(), fd);
    }
    drop(slave);

    if let Err(e) = unistd::initgroups(
        &CString::new(pw.name.clone()).expect("passwd name never contains NUL"),
        pw.gid,
    ) {
        log::error!("pty child: initgroups failed: {e}");
        std::process::exit(1);
    }
    if let Err(e) = unistd::setgid(pw.gid) {
        log::error!("pty child: setgid failed: {e}");
        std::process::exit(1);
    }
    if let Err(e) = unistd::setuid(pw.uid) {
        log::error!("pty child: setuid failed: {e}");
        std::process::exit(1);
    }
    if let Err(e) = unistd::chdir(&pw.dir) {
        log::warn!("pty child: chdir to home failed: {e}");
    }

    let shell_path = CString::new(shell).expect("shell path never contains NUL");
    let argv0 = CString::new(format!("-{}", basename(shell))).expect("argv0 never contains NUL");
    let env: Vec<CString> = vec![
        CString::new("TERM=xterm-256color").unwrap(),
        CString::new(format!("HOME={}", pw.dir.display())).unwrap(),
        CString::new(format!("USER={}", pw.name)).unwrap(),
        CString::new(format!("SHELL={shell}")).unwrap(),
        CString::new("PATH=/usr/local/bin:/usr/bin:/bin").unwrap(),
    ];

    let _ = unistd::execve(&shell_path, &[argv0], &env);
    std::process::exit(1);
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn set_controlling_terminal(fd: std::os::fd::RawFd) {
    // SAFETY: fd is the freshly-opened slave in the child, before any
    // other controlling terminal has been assigned to this session.
    if let Err(e) = unsafe { tiocsctty(fd, 0) } {
        log::warn!("pty child: TIOCSCTTY failed: {e}");
    }
}

// nix's termios module does not expose TIOCSCTTY/TIOCSWINSZ directly;
// they are issued as raw ioctls, same as the teacher does for calls nix
// has no typed wrapper for.
nix::ioctl_write_int_bad!(tiocsctty, nix::libc::TIOCSCTTY);
nix::ioctl_write_ptr_bad!(tiocswinsz, nix::libc::TIOCSWINSZ, Winsize);

fn set_winsize(fd: std::os::fd::RawFd, ws: &Winsize) -> nix::Result<()> {
    unsafe { tiocswinsz(fd, ws) }.map(|_| ())
}
