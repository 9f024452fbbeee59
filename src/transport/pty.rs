//! Local PTY transport.
//!
//! Spawns a program (a shell, by default) under a pseudo-terminal and
//! exposes the master side as the byte channel. Used directly for driving
//! local shells and by the integration tests.
//!
//! # Safety
//!
//! PTY setup requires unsafe code (fork, ioctl, dup2). These are fundamental
//! operations that cannot be done safely.

#![allow(unsafe_code)]

use super::{Sink, Transport, TransportError};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct PtyChild {
    master: OwnedFd,
    pid: Pid,
    exited: Option<i32>,
}

/// Transport that runs a local program under a PTY.
pub struct PtyTransport {
    command: Vec<String>,
    rows: u16,
    cols: u16,
    stdout: Option<Sink>,
    child: Option<PtyChild>,
}

impl PtyTransport {
    /// Prepare a transport for the given command line (program + args).
    #[must_use]
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            rows: 24,
            cols: 80,
            stdout: None,
            child: None,
        }
    }

    /// Override the terminal size (default 24x80).
    #[must_use]
    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn spawn(&self) -> Result<PtyChild, TransportError> {
        if self.command.is_empty() {
            return Err(TransportError::ShellStart(
                "command is empty".to_string().into(),
            ));
        }

        let winsize = Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let OpenptyResult { master, slave } =
            openpty(&winsize, None).map_err(|e| TransportError::PtyRequest(Box::new(e)))?;

        match unsafe { fork() }.map_err(|e| TransportError::ShellStart(Box::new(e)))? {
            ForkResult::Parent { child } => {
                drop(slave);

                // Non-blocking master so the pump never stalls on a quiet shell.
                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| TransportError::Io(e.into()))?;
                let mut flags = OFlag::from_bits_retain(flags);
                flags.insert(OFlag::O_NONBLOCK);
                fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags))
                    .map_err(|e| TransportError::Io(e.into()))?;

                Ok(PtyChild {
                    master,
                    pid: child,
                    exited: None,
                })
            }
            ForkResult::Child => {
                drop(master);

                if setsid().is_err() {
                    std::process::exit(1);
                }

                // Make the slave the controlling terminal and wire the
                // standard descriptors to it.
                let slave_fd = slave.as_raw_fd();
                unsafe {
                    if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                        std::process::exit(1);
                    }
                    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
                        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
                        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
                    {
                        std::process::exit(1);
                    }
                }
                if slave_fd > 2 {
                    drop(slave);
                }

                // SAFETY: forked child before exec, no other threads here.
                unsafe {
                    std::env::set_var("TERM", "dumb");
                }

                let Ok(prog) = CString::new(self.command[0].as_str()) else {
                    std::process::exit(1);
                };
                let args: Vec<CString> = self
                    .command
                    .iter()
                    .filter_map(|s| CString::new(s.as_str()).ok())
                    .collect();
                let _ = execvp(&prog, &args);
                // execvp only returns on error.
                std::process::exit(127);
            }
        }
    }

    /// Check for child exit without blocking, updating the cached status.
    fn poll_exit(child: &mut PtyChild) {
        if child.exited.is_some() {
            return;
        }
        match waitpid(child.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => child.exited = Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => child.exited = Some(128 + sig as i32),
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "waitpid failed");
                child.exited = Some(-1);
            }
        }
    }
}

impl Transport for PtyTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.child.is_some() {
            return Ok(());
        }
        let child = self.spawn()?;
        debug!(pid = %child.pid, command = ?self.command, "spawned pty child");
        self.child = Some(child);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        Self::poll_exit(&mut child);
        if child.exited.is_none() {
            let _ = signal::kill(child.pid, Signal::SIGTERM);
            let deadline = Instant::now() + Duration::from_millis(200);
            while child.exited.is_none() && Instant::now() < deadline {
                Self::poll_exit(&mut child);
                std::thread::sleep(Duration::from_millis(10));
            }
            if child.exited.is_none() {
                warn!(pid = %child.pid, "pty child ignored SIGTERM, killing");
                let _ = signal::kill(child.pid, Signal::SIGKILL);
                let _ = waitpid(child.pid, None);
            }
        }
        Ok(())
    }

    fn active(&self) -> bool {
        self.child.as_ref().is_some_and(|c| c.exited.is_none())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let child = self.child.as_ref().ok_or(TransportError::NotConnected)?;
        let mut written = 0;
        while written < data.len() {
            match nix::unistd::write(child.master.as_fd(), &data[written..]) {
                Ok(n) => written += n,
                Err(nix::Error::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(TransportError::Io(e.into())),
            }
        }
        Ok(())
    }

    fn register_stdout(&mut self, sink: Sink) {
        self.stdout = Some(sink);
    }

    fn register_stderr(&mut self, _sink: Sink) {
        // A PTY merges the child's stderr into the single stream.
    }

    fn pump(&mut self, max_wait: Duration) -> Result<(), TransportError> {
        let Some(child) = self.child.as_mut() else {
            std::thread::sleep(max_wait.min(Duration::from_millis(5)));
            return Ok(());
        };

        let mut buf = [0u8; 4096];
        let mut delivered = false;
        loop {
            match nix::unistd::read(child.master.as_raw_fd(), &mut buf) {
                Ok(0) => {
                    Self::poll_exit(child);
                    break;
                }
                Ok(n) => {
                    delivered = true;
                    if let Some(sink) = self.stdout.as_mut() {
                        sink(&buf[..n]);
                    }
                }
                Err(nix::Error::EAGAIN) => break,
                Err(nix::Error::EIO) => {
                    // PTY closed, child probably exited.
                    Self::poll_exit(child);
                    if child.exited.is_none() {
                        child.exited = Some(-1);
                    }
                    break;
                }
                Err(e) => return Err(TransportError::Io(e.into())),
            }
        }

        Self::poll_exit(child);
        if !delivered {
            std::thread::sleep(max_wait.min(Duration::from_millis(5)));
        }
        Ok(())
    }
}

impl Drop for PtyTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collect_output(transport: &mut PtyTransport) -> Arc<Mutex<Vec<u8>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_buf = Arc::clone(&collected);
        transport.register_stdout(Box::new(move |bytes| {
            sink_buf.lock().unwrap().extend_from_slice(bytes);
        }));
        collected
    }

    #[test]
    fn test_spawn_and_read_output() {
        let mut transport = PtyTransport::new(["sh", "-c", "echo pty-hello"]);
        let collected = collect_output(&mut transport);
        transport.connect().expect("connect");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            transport.pump(Duration::from_millis(5)).expect("pump");
            if String::from_utf8_lossy(&collected.lock().unwrap()).contains("pty-hello") {
                break;
            }
        }
        assert!(
            String::from_utf8_lossy(&collected.lock().unwrap()).contains("pty-hello"),
            "child output never arrived"
        );
        transport.disconnect().expect("disconnect");
    }

    #[test]
    fn test_active_tracks_child_exit() {
        let mut transport = PtyTransport::new(["sh", "-c", "exit 0"]);
        let _collected = collect_output(&mut transport);
        transport.connect().expect("connect");

        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.active() && Instant::now() < deadline {
            transport.pump(Duration::from_millis(5)).expect("pump");
        }
        assert!(!transport.active());
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut transport = PtyTransport::new(Vec::<String>::new());
        assert!(matches!(
            transport.connect(),
            Err(TransportError::ShellStart(_))
        ));
    }

    #[test]
    fn test_write_round_trip() {
        let mut transport = PtyTransport::new(["cat"]);
        let collected = collect_output(&mut transport);
        transport.connect().expect("connect");
        transport.write(b"ping\n").expect("write");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            transport.pump(Duration::from_millis(5)).expect("pump");
            if String::from_utf8_lossy(&collected.lock().unwrap()).contains("ping") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected.lock().unwrap()).contains("ping"));
        transport.disconnect().expect("disconnect");
    }
}
