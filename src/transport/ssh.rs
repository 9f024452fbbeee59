//! SSH transport.
//!
//! Opens an SSH connection, requests a PTY on a session channel (unless
//! configured otherwise), and starts the login shell or an explicit program.
//! The session is switched to non-blocking after setup so the reactor's pump
//! can service both the stdout stream and extended-data stream 1 (stderr)
//! without stalling.

use super::{Sink, Transport, TransportError};
use crate::options::{ShellRequest, SshOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

struct Conn {
    // Kept alive for the channel; the session owns the TCP stream.
    session: ssh2::Session,
    channel: ssh2::Channel,
}

/// Transport over an SSH session channel.
pub struct SshTransport {
    options: SshOptions,
    stdout: Option<Sink>,
    stderr: Option<Sink>,
    conn: Option<Conn>,
}

impl SshTransport {
    #[must_use]
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            stdout: None,
            stderr: None,
            conn: None,
        }
    }

    fn open_tcp(&self) -> Result<TcpStream, TransportError> {
        let timeout = Duration::from_secs_f64(self.options.connect_timeout);
        let addrs: Vec<SocketAddr> = (self.options.host.as_str(), self.options.port)
            .to_socket_addrs()
            .map_err(TransportError::connect)?
            .collect();
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(TransportError::connect(last.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrNotAvailable, "host resolved to no addresses")
        })))
    }
}

impl Transport for SshTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let tcp = self.open_tcp()?;
        let mut session = ssh2::Session::new().map_err(TransportError::connect)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(TransportError::connect)?;

        if self.options.password.is_empty() {
            session
                .userauth_agent(&self.options.user)
                .map_err(|e| TransportError::Auth(Box::new(e)))?;
        } else {
            session
                .userauth_password(&self.options.user, &self.options.password)
                .map_err(|e| TransportError::Auth(Box::new(e)))?;
        }

        let mut channel = session
            .channel_session()
            .map_err(TransportError::connect)?;

        if self.options.shell != ShellRequest::NoPty {
            channel
                .request_pty("xterm", None, None)
                .map_err(|e| TransportError::PtyRequest(Box::new(e)))?;
        }
        match &self.options.shell {
            ShellRequest::Default => channel
                .shell()
                .map_err(|e| TransportError::ShellStart(Box::new(e)))?,
            ShellRequest::Program(path) => channel
                .exec(path)
                .map_err(|e| TransportError::ShellStart(Box::new(e)))?,
            ShellRequest::PtyOnly | ShellRequest::NoPty => {}
        }

        session.set_blocking(false);
        debug!(host = %self.options.host, port = self.options.port, user = %self.options.user,
               "ssh channel ready");
        self.conn = Some(Conn { session, channel });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        // Bounded blocking teardown so a dead peer cannot hang us.
        conn.session.set_blocking(true);
        conn.session.set_timeout(1000);
        let _ = conn.channel.send_eof();
        let _ = conn.channel.close();
        let _ = conn.channel.wait_close();
        let _ = conn
            .session
            .disconnect(None, "session finished", None);
        Ok(())
    }

    fn active(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.channel.eof())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        let mut written = 0;
        while written < data.len() {
            match conn.channel.write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    fn register_stdout(&mut self, sink: Sink) {
        self.stdout = Some(sink);
    }

    fn register_stderr(&mut self, sink: Sink) {
        self.stderr = Some(sink);
    }

    fn pump(&mut self, max_wait: Duration) -> Result<(), TransportError> {
        let Some(conn) = self.conn.as_mut() else {
            std::thread::sleep(max_wait.min(Duration::from_millis(5)));
            return Ok(());
        };

        let mut buf = [0u8; 4096];
        let mut delivered = false;

        loop {
            match conn.channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    delivered = true;
                    if let Some(sink) = self.stdout.as_mut() {
                        sink(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "ssh stdout read failed");
                    return Err(TransportError::Io(e));
                }
            }
        }

        loop {
            match conn.channel.stderr().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    delivered = true;
                    if let Some(sink) = self.stderr.as_mut() {
                        sink(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "ssh stderr read failed");
                    return Err(TransportError::Io(e));
                }
            }
        }

        if !delivered {
            std::thread::sleep(max_wait.min(Duration::from_millis(5)));
        }
        Ok(())
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
