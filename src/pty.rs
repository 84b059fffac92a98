//! PtyHost (C1): spawns a child process attached to a pseudo-terminal and
//! exposes it behind explicit `read`/`write`/`resize`/`signal`/`wait`
//! operations.
//!
//! This is an `openpty`/`fork`/`execvp`/`login_tty` sequence that doesn't
//! own a combined read+write event loop: C4 (`session.rs`) drives reads
//! from one thread and writes/resizes from another, since PTY master reads
//! and writes don't need to share a thread to stay correctly ordered
//! relative to each other.

use std::env;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::os::unix::prelude::OsStrExt;

use nix::errno::Errno;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
use nix::libc::login_tty;
use nix::libc::{TIOCGWINSZ, TIOCSWINSZ};
#[cfg(target_os = "linux")]
const TIOCSCTTY: u64 = 0x540E;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, read as nix_read, write as nix_write, ForkResult, Pid};

use crate::error::{Error, Result};

pub const DEFAULT_TERM: &str = "xterm-256color";

/// A running PTY-attached child process. `master` is the only fd this side
/// holds once the child has exec'd; it is both read and write ends of the
/// pty.
pub struct PtyHost {
    master: OwnedFd,
    child: Pid,
}

impl PtyHost {
    /// Forks, sets up the pty slave as the child's controlling terminal,
    /// and execs `command` with `env` overlaid on this process's own
    /// inherited environment.
    pub fn spawn(
        command: &[String],
        env_vars: &std::collections::HashMap<String, String>,
        working_dir: Option<&str>,
        cols: u16,
        rows: u16,
        term: &str,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::BadRequest("command must not be empty".to_string()));
        }

        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                drop(pty.slave);
                Ok(Self {
                    master: pty.master,
                    child,
                })
            }
            ForkResult::Child => {
                drop(pty.master);
                // SAFETY: between fork() and execvp() only async-signal-safe
                // operations run.
                if let Err(err) = unsafe { child_exec(pty.slave, command, env_vars, working_dir, term) } {
                    eprintln!("termrelay: failed to exec child: {err}");
                    std::process::exit(127);
                }
                unreachable!("child_exec always exits or execs");
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.child.as_raw()
    }

    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Blocking read of up to `buf.len()` bytes from the pty master. Returns
    /// `Ok(0)` when the child has closed its end (normal exit path on
    /// Linux, where a closed pty slave raises `EIO` on the master).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match nix_read(&self.master, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EIO) => return Ok(0),
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn write(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match nix_write(&self.master, buf) {
                Ok(n) => buf = &buf[n..],
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_winsize(self.master.as_fd(), winsize)?;
        // best-effort: notify the foreground process group of the resize
        let _ = kill(self.child, Signal::SIGWINCH);
        Ok(())
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.child, signal).map_err(Into::into)
    }

    /// Non-blocking check for child exit; `None` if still running.
    pub fn try_wait(&self) -> Result<Option<i32>> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, status)) => Ok(Some(status)),
            Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(128 + signal as i32)),
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => Ok(Some(0)),
            Err(err) => Err(err.into()),
        }
    }

    /// Blocking wait for child exit, used once the reader thread has seen
    /// EOF on the master and the child is known to be on its way out.
    pub fn wait(&self) -> Result<i32> {
        match waitpid(self.child, None) {
            Ok(WaitStatus::Exited(_, status)) => Ok(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => Ok(128 + signal as i32),
            Ok(_) => Ok(1),
            Err(Errno::ECHILD) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

/// Runs only in the forked child, before exec. Never returns on success.
unsafe fn child_exec(
    slave: OwnedFd,
    command: &[String],
    env_vars: &std::collections::HashMap<String, String>,
    working_dir: Option<&str>,
    term: &str,
) -> Result<()> {
    login_tty_compat(slave.into_raw_fd())?;

    if let Some(dir) = working_dir {
        if let Err(err) = env::set_current_dir(dir) {
            return Err(Error::SpawnFailure(format!(
                "working directory {dir} is inaccessible: {err}"
            )));
        }
    }

    // `env` is overlaid on the inherited environment, not a replacement for
    // it — keep whatever this server process itself has.
    env::set_var("TERM", term);
    for (key, value) in env_vars {
        env::set_var(key, value);
    }

    let args = command
        .iter()
        .filter_map(|arg| CString::new(arg.as_bytes()).ok())
        .collect::<Vec<_>>();
    if args.is_empty() {
        return Err(Error::SpawnFailure("command has no valid arguments".to_string()));
    }

    match execvp(&args[0], &args) {
        Ok(infallible) => match infallible {},
        Err(err) => Err(Error::SpawnFailure(format!("execvp failed: {err}"))),
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
unsafe fn login_tty_compat(fd: i32) -> Result<()> {
    if login_tty(fd) == 0 {
        Ok(())
    } else {
        Err(Error::SpawnFailure("login_tty failed".to_string()))
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
unsafe fn login_tty_compat(fd: i32) -> Result<()> {
    use nix::unistd::setsid;

    setsid().map_err(|_| Error::SpawnFailure("setsid failed".to_string()))?;

    #[cfg(target_os = "linux")]
    let ctty = TIOCSCTTY;
    #[cfg(not(target_os = "linux"))]
    let ctty = nix::libc::TIOCSCTTY as u64;

    if libc::ioctl(fd, ctty as libc::c_ulong, 0) == -1
        && libc::ioctl(fd, ctty as libc::c_ulong, 1) == -1
    {
        return Err(Error::SpawnFailure("ioctl TIOCSCTTY failed".to_string()));
    }

    if libc::dup2(fd, 0) == -1 || libc::dup2(fd, 1) == -1 || libc::dup2(fd, 2) == -1 {
        return Err(Error::SpawnFailure("dup2 to stdio failed".to_string()));
    }
    if fd > 2 {
        libc::close(fd);
    }

    Ok(())
}

fn set_winsize(fd: BorrowedFd, winsize: Winsize) -> Result<()> {
    nix::ioctl_write_ptr_bad!(set_window_size, TIOCSWINSZ, Winsize);
    unsafe { set_window_size(fd.as_raw_fd(), &winsize) }?;
    Ok(())
}

pub fn get_winsize(fd: BorrowedFd) -> Option<Winsize> {
    nix::ioctl_read_bad!(get_window_size, TIOCGWINSZ, Winsize);
    let mut size: Winsize = unsafe { std::mem::zeroed() };
    unsafe { get_window_size(fd.as_raw_fd(), &mut size).ok()? };
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn spawn_echo_and_read_output() {
        let host = PtyHost::spawn(
            &["/bin/echo".to_string(), "hello-termrelay".to_string()],
            &HashMap::new(),
            None,
            80,
            24,
            DEFAULT_TERM,
        )
        .unwrap();

        let mut buf = [0u8; 4096];
        let mut collected = Vec::new();
        loop {
            let n = host.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }

        let exit_code = host.wait().unwrap();
        assert_eq!(exit_code, 0);
        assert!(String::from_utf8_lossy(&collected).contains("hello-termrelay"));
    }

    #[test]
    fn rejects_empty_command() {
        let result = PtyHost::spawn(&[], &HashMap::new(), None, 80, 24, DEFAULT_TERM);
        assert!(result.is_err());
    }
}
