//! Test support: a scripted in-memory shell.
//!
//! [`ScriptedShell`] builds a [`ScriptedTransport`] that behaves like a
//! well-mannered remote: it echoes input, answers registered commands, and
//! prints the prompt — or goes intentionally dead to exercise the timeout
//! and nudge machinery. The whole driver state machine can be tested without
//! a live remote.
//!
//! ```ignore
//! let transport = ScriptedShell::new("~~#")
//!     .on("ls", "a\nb\nc")
//!     .build();
//! let log = transport.command_log();
//! let session = Session::new(opts, Box::new(transport), dialect)?;
//! ```

use crate::transport::{Sink, Transport, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

enum Reply {
    /// Echo-style response: text, then the prompt; records a status.
    Output { text: String, status: i32 },
    /// Verbatim emission, no prompt appended. For menu/device flows.
    Raw(String),
    /// No output at all, ever — the remote hangs from here on.
    Hang,
    /// The remote closes the connection.
    Close,
}

enum Matcher {
    Exact(String),
    Prefix(String),
}

impl Matcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            Self::Exact(text) => line == text,
            Self::Prefix(text) => line.starts_with(text.as_str()),
        }
    }
}

/// Builder for a scripted remote shell.
pub struct ScriptedShell {
    prompt: String,
    greeting: Option<String>,
    echo: bool,
    rules: Vec<(Matcher, Reply)>,
}

impl ScriptedShell {
    /// A fresh scripted shell that answers with the given prompt marker.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            greeting: None,
            echo: true,
            rules: Vec::new(),
        }
    }

    /// Bytes emitted as soon as the transport connects (banner or menu).
    #[must_use]
    pub fn greeting(mut self, text: impl Into<String>) -> Self {
        self.greeting = Some(text.into());
        self
    }

    /// Disable input echo, like a remote in raw mode.
    #[must_use]
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Answer `command` with `output` and exit status 0.
    #[must_use]
    pub fn on(self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.on_status(command, output, 0)
    }

    /// Answer `command` with `output` and the given exit status.
    #[must_use]
    pub fn on_status(
        mut self,
        command: impl Into<String>,
        output: impl Into<String>,
        status: i32,
    ) -> Self {
        self.rules.push((
            Matcher::Exact(command.into()),
            Reply::Output {
                text: output.into(),
                status,
            },
        ));
        self
    }

    /// Answer any command starting with `prefix`.
    #[must_use]
    pub fn on_prefix(
        mut self,
        prefix: impl Into<String>,
        output: impl Into<String>,
        status: i32,
    ) -> Self {
        self.rules.push((
            Matcher::Prefix(prefix.into()),
            Reply::Output {
                text: output.into(),
                status,
            },
        ));
        self
    }

    /// Emit `text` verbatim for `command`, with no prompt appended.
    #[must_use]
    pub fn on_raw(mut self, command: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules
            .push((Matcher::Exact(command.into()), Reply::Raw(text.into())));
        self
    }

    /// Go permanently silent when `command` arrives.
    #[must_use]
    pub fn hang_on(mut self, command: impl Into<String>) -> Self {
        self.rules
            .push((Matcher::Exact(command.into()), Reply::Hang));
        self
    }

    /// Close the connection when `command` arrives.
    #[must_use]
    pub fn close_on(mut self, command: impl Into<String>) -> Self {
        self.rules
            .push((Matcher::Exact(command.into()), Reply::Close));
        self
    }

    /// Finish the script and produce the transport.
    #[must_use]
    pub fn build(self) -> ScriptedTransport {
        ScriptedTransport {
            prompt: self.prompt,
            greeting: self.greeting,
            echo: self.echo,
            rules: self.rules,
            sink: None,
            connected: false,
            closed: false,
            hung: false,
            last_status: 0,
            pending_line: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// In-memory transport produced by [`ScriptedShell`].
pub struct ScriptedTransport {
    prompt: String,
    greeting: Option<String>,
    echo: bool,
    rules: Vec<(Matcher, Reply)>,
    sink: Option<Sink>,
    connected: bool,
    closed: bool,
    hung: bool,
    last_status: i32,
    pending_line: Vec<u8>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    /// Every complete command line the fake remote received, in order.
    /// Grab the handle before moving the transport into a session.
    #[must_use]
    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    fn emit(&mut self, text: &str) {
        if let Some(sink) = self.sink.as_mut() {
            sink(text.as_bytes());
        }
    }

    fn emit_prompt(&mut self) {
        let prompt = format!("{} ", self.prompt);
        self.emit(&prompt);
    }

    fn handle_line(&mut self, line: String) {
        self.log.lock().push(line.clone());

        let matched = self
            .rules
            .iter()
            .position(|(matcher, _)| matcher.matches(&line));
        if let Some(index) = matched {
            match &self.rules[index].1 {
                Reply::Output { text, status } => {
                    let status = *status;
                    let mut body = text.clone();
                    if !body.is_empty() && !body.ends_with('\n') {
                        body.push('\n');
                    }
                    self.emit(&body);
                    self.last_status = status;
                    self.emit_prompt();
                }
                Reply::Raw(text) => {
                    let body = text.clone();
                    self.emit(&body);
                }
                Reply::Hang => self.hung = true,
                Reply::Close => self.closed = true,
            }
            return;
        }

        // Built-in behaviour for anything unscripted.
        if line.trim() == "echo $?" {
            let body = format!("{}\n", self.last_status);
            self.emit(&body);
            self.emit_prompt();
            return;
        }
        self.last_status = 0;
        self.emit_prompt();
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        if let Some(greeting) = self.greeting.take() {
            self.emit(&greeting);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn active(&self) -> bool {
        self.connected && !self.closed
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.closed {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "remote closed",
            )));
        }
        if self.hung {
            // A dead remote swallows everything, echo included.
            return Ok(());
        }
        if self.echo {
            let echoed = data.to_vec();
            if let Some(sink) = self.sink.as_mut() {
                sink(&echoed);
            }
        }
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending_line).into_owned();
                self.pending_line.clear();
                self.handle_line(line.trim_end_matches('\r').to_string());
                if self.closed || self.hung {
                    break;
                }
            } else {
                self.pending_line.push(byte);
            }
        }
        Ok(())
    }

    fn register_stdout(&mut self, sink: Sink) {
        self.sink = Some(sink);
    }

    fn register_stderr(&mut self, _sink: Sink) {
        // The scripted remote has a single stream.
    }

    fn pump(&mut self, max_wait: Duration) -> Result<(), TransportError> {
        // Replies are produced synchronously in `write`; just yield.
        std::thread::sleep(max_wait.min(Duration::from_millis(2)));
        Ok(())
    }
}
