//! Session lifecycle and the embedding API.
//!
//! A [`Session`] owns one transport, one dialect, and the shared state both
//! strands operate on. `run` turns the calling strand into the reactor
//! (transport pump, input writes, timeout enforcement) and spawns the worker
//! strand that executes the user script through a [`ShellHandle`].
//!
//! Sessions are single-use: once `run` returns, the transcript buffers and
//! `last_exit_code` stay available for inspection, but further operations
//! fail with `SessionCompleted`.

mod exec;
mod wait;

pub use exec::ExecOptions;

use crate::assembler::{self, MonitorFn, StreamKind};
use crate::buffers::BufferStack;
use crate::dialect::{Dialect, PosixShell};
use crate::error::ShellError;
use crate::hooks::{HookEvent, HookName, Hooks};
use crate::options::{SerialOptions, SessionOptions, SshOptions};
use crate::prompt::Prompt;
use crate::queue::InputQueue;
use crate::transport::{
    PtyTransport, SerialTransport, Sink, SshTransport, Transport, TransportError,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use wait::WaitJob;

/// Result of an exit-code retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The parsed integer status.
    Code(i32),
    /// The dialect cannot retrieve exit codes, or the probe output did not
    /// parse.
    Undefined,
    /// The command timed out before a code could be read.
    Timeout,
}

/// State shared between the reactor and worker strands, guarded by the one
/// session mutex.
pub(crate) struct Shared {
    pub options: SessionOptions,
    pub buffers: BufferStack,
    pub prompt: Prompt,
    pub queue: InputQueue,
    pub last_output: Instant,
    pub waiting_for_echo_of: Option<Vec<u8>>,
    pub last_exit_code: Option<ExitCode>,
    pub wait: Option<WaitJob>,
    pub running: bool,
    pub completed: bool,
    pub transport_down: bool,
    pub ignore_io_error: bool,
    pub worker_done: bool,
    pub session_error: Option<ShellError>,
}

/// The mutex/condvar pair both strands rendezvous on.
pub(crate) struct SessionCore {
    pub state: Mutex<Shared>,
    pub cond: Condvar,
    pub monitor: Mutex<Option<MonitorFn>>,
}

impl SessionCore {
    fn new(options: SessionOptions, prompt: Prompt) -> Self {
        let queue = InputQueue::new(options.unbuffered_input);
        Self {
            state: Mutex::new(Shared {
                options,
                buffers: BufferStack::new(),
                prompt,
                queue,
                last_output: Instant::now(),
                waiting_for_echo_of: None,
                last_exit_code: None,
                wait: None,
                running: false,
                completed: false,
                transport_down: false,
                ignore_io_error: false,
                worker_done: false,
                session_error: None,
            }),
            cond: Condvar::new(),
            monitor: Mutex::new(None),
        }
    }
}

/// Borrow of the session handed to hook callbacks. Exposes the few
/// operations a hook may perform while the session is live.
#[derive(Clone)]
pub struct SessionCtl {
    core: Arc<SessionCore>,
}

impl SessionCtl {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    /// A detached control handle bound to a throwaway state. Used by hook
    /// unit tests.
    #[doc(hidden)]
    #[must_use]
    pub fn detached() -> Self {
        let prompt = Prompt::literal("~~#").expect("stock prompt compiles");
        Self::new(Arc::new(SessionCore::new(SessionOptions::default(), prompt)))
    }

    /// Snapshot of the current option set.
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        self.core.state.lock().options.clone()
    }

    /// Atomically substitute an option set with a different quit command.
    pub fn change_quit(&self, quit: impl Into<String>) {
        let mut st = self.core.state.lock();
        st.options = st.options.with_quit(quit);
    }
}

/// Worker-strand view of a running session; the argument to user scripts
/// and dialect callbacks.
pub struct ShellHandle {
    core: Arc<SessionCore>,
    dialect: Arc<dyn Dialect>,
}

impl ShellHandle {
    /// Snapshot of the current option set.
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        self.core.state.lock().options.clone()
    }

    /// Exit code captured by the most recent `exec`.
    #[must_use]
    pub fn last_exit_code(&self) -> Option<ExitCode> {
        self.core.state.lock().last_exit_code
    }

    /// Queue raw text for the remote shell without waiting for anything.
    pub fn queue_input(&mut self, data: &str) {
        self.core.state.lock().queue.queue(data);
    }

    /// Queue text followed by the configured line ending.
    pub fn queue_line(&mut self, data: &str) {
        let mut st = self.core.state.lock();
        let ending = st.options.line_ending.clone();
        st.queue.queue(data);
        st.queue.queue(&ending);
    }

    /// Block until the reactor sees the active prompt.
    ///
    /// `silence_timeout` / `command_timeout` override the session defaults
    /// when given (zero disables that timer). With `timeout_error` unset a
    /// timeout returns `Ok(false)` instead of failing.
    pub fn wait_for_prompt(
        &mut self,
        silence_timeout: Option<f64>,
        command_timeout: Option<f64>,
        timeout_error: bool,
    ) -> Result<bool, ShellError> {
        wait::wait_for_prompt(&self.core, silence_timeout, command_timeout, timeout_error)
    }

    /// Install a different prompt pattern for the duration of `body`. The
    /// previous pattern is restored on every exit path, including panics.
    pub fn temporary_prompt<T>(
        &mut self,
        prompt: Prompt,
        body: impl FnOnce(&mut Self) -> Result<T, ShellError>,
    ) -> Result<T, ShellError> {
        let old = {
            let mut st = self.core.state.lock();
            std::mem::replace(&mut st.prompt, prompt)
        };
        let _guard = PromptGuard {
            core: Arc::clone(&self.core),
            old: Some(old),
        };
        body(self)
    }

    /// Current combined transcript of the innermost capture scope.
    #[must_use]
    pub fn combined_output(&self) -> String {
        self.core.state.lock().buffers.current().combined.clone()
    }

    pub(crate) fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::clone(&self.dialect)
    }
}

struct PromptGuard {
    core: Arc<SessionCore>,
    old: Option<Prompt>,
}

impl Drop for PromptGuard {
    fn drop(&mut self) {
        if let Some(old) = self.old.take() {
            self.core.state.lock().prompt = old;
        }
    }
}

/// Flips `worker_done` even when the worker unwinds from a panic, so the
/// reactor loop can never spin forever.
struct DoneGuard {
    core: Arc<SessionCore>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let mut st = self.core.state.lock();
        st.worker_done = true;
        self.core.cond.notify_all();
    }
}

/// An interactive shell session over one transport.
pub struct Session {
    core: Arc<SessionCore>,
    transport: Option<Box<dyn Transport>>,
    dialect: Arc<dyn Dialect>,
    hooks: Hooks,
}

impl Session {
    /// Build a session from explicit parts. Options are validated here;
    /// nothing mutates them afterwards.
    pub fn new(
        options: SessionOptions,
        transport: Box<dyn Transport>,
        dialect: Arc<dyn Dialect>,
    ) -> Result<Self, ShellError> {
        options.validate()?;
        let prompt = Prompt::literal(&options.prompt)?;
        let core = Arc::new(SessionCore::new(options, prompt));
        let mut hooks = Hooks::new();
        dialect.register_hooks(&mut hooks);
        Ok(Self {
            core,
            transport: Some(transport),
            dialect,
            hooks,
        })
    }

    /// Session over a local program under a PTY, with the POSIX dialect.
    pub fn pty<S: Into<String>>(
        options: SessionOptions,
        command: impl IntoIterator<Item = S>,
    ) -> Result<Self, ShellError> {
        Self::new(
            options,
            Box::new(PtyTransport::new(command)),
            Arc::new(PosixShell::new()),
        )
    }

    /// Session over SSH, with the POSIX dialect.
    pub fn ssh(options: SessionOptions, ssh: SshOptions) -> Result<Self, ShellError> {
        ssh.validate()?;
        Self::new(
            options,
            Box::new(SshTransport::new(ssh)),
            Arc::new(PosixShell::new()),
        )
    }

    /// Session over a serial line, with the POSIX dialect.
    pub fn serial(options: SessionOptions, serial: SerialOptions) -> Result<Self, ShellError> {
        serial.validate()?;
        Self::new(
            options,
            Box::new(SerialTransport::new(serial)),
            Arc::new(PosixShell::new()),
        )
    }

    /// Install a session-wide monitor, invoked with every cleaned output
    /// chunk while no per-exec monitor is active.
    #[must_use]
    pub fn with_monitor(
        self,
        monitor: impl FnMut(&str, StreamKind) -> Option<String> + Send + 'static,
    ) -> Self {
        *self.core.monitor.lock() = Some(Box::new(monitor));
        self
    }

    /// Register a hook callback. Dialect hooks were registered at
    /// construction; user hooks run after them.
    pub fn add_hook<F>(&mut self, name: HookName, callback: F)
    where
        F: Fn(&SessionCtl, &HookEvent<'_>) -> Result<crate::hooks::HookFlow, ShellError>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.add(name, callback);
    }

    /// Connect, run the script on the worker strand, drive the transport on
    /// this strand, tear down, and return the session for inspection.
    pub fn run<F>(mut self, script: F) -> Result<Self, ShellError>
    where
        F: FnOnce(&mut ShellHandle) -> Result<(), ShellError> + Send + 'static,
    {
        {
            let st = self.core.state.lock();
            if st.running {
                return Err(ShellError::AlreadyRunning);
            }
            if st.completed {
                return Err(ShellError::SessionCompleted);
            }
        }

        let hooks = Arc::new(std::mem::take(&mut self.hooks));
        let ctl = SessionCtl::new(Arc::clone(&self.core));
        hooks.run_lifecycle(HookName::OnInit, &ctl)?;
        hooks.run_lifecycle(HookName::OnBeforeRun, &ctl)?;

        let mut transport = self.transport.take().ok_or(ShellError::SessionCompleted)?;
        transport.register_stdout(make_sink(
            Arc::clone(&self.core),
            Arc::clone(&hooks),
            StreamKind::Stdout,
        ));
        transport.register_stderr(make_sink(
            Arc::clone(&self.core),
            Arc::clone(&hooks),
            StreamKind::Stderr,
        ));
        transport.connect().map_err(connect_error)?;
        info!("transport connected");

        {
            let mut st = self.core.state.lock();
            st.running = true;
            st.last_output = Instant::now();
        }

        let worker = {
            let core = Arc::clone(&self.core);
            let dialect = Arc::clone(&self.dialect);
            let hooks = Arc::clone(&hooks);
            std::thread::Builder::new()
                .name("shellpilot-worker".into())
                .spawn(move || {
                    let _done = DoneGuard {
                        core: Arc::clone(&core),
                    };
                    let err = worker_main(&core, &hooks, dialect, script);
                    let mut st = core.state.lock();
                    if st.session_error.is_none() {
                        st.session_error = err;
                    }
                })
                .map_err(|e| ShellError::custom(e))?
        };

        // This strand is now the reactor: sole transport writer.
        let mut reactor_error: Option<ShellError> = None;
        loop {
            if let Err(e) = transport.pump(Duration::from_millis(5)) {
                self.note_reactor_failure(e, &mut reactor_error);
            }
            if let Err(e) = wait::reactor_step(&self.core, transport.as_mut()) {
                if let ShellError::Transport(te) = e {
                    self.note_reactor_failure(te, &mut reactor_error);
                } else {
                    reactor_error.get_or_insert(e);
                }
            }
            let mut st = self.core.state.lock();
            if st.worker_done {
                break;
            }
            if !st.transport_down && !transport.active() {
                debug!("transport went inactive");
                st.transport_down = true;
                self.core.cond.notify_all();
            }
        }

        let _ = transport.disconnect();
        if worker.join().is_err() {
            warn!("worker strand panicked");
            reactor_error.get_or_insert(ShellError::InvalidOption(
                "session script panicked".into(),
            ));
        }

        {
            let mut st = self.core.state.lock();
            st.running = false;
            st.completed = true;
        }
        if let Err(e) = hooks.run_lifecycle(HookName::OnAfterRun, &ctl) {
            reactor_error.get_or_insert(e);
        }

        let stored = self.core.state.lock().session_error.take();
        match stored.or(reactor_error) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    fn note_reactor_failure(&self, err: TransportError, slot: &mut Option<ShellError>) {
        {
            let mut st = self.core.state.lock();
            st.transport_down = true;
            if !st.ignore_io_error && slot.is_none() {
                *slot = Some(err.into());
            }
        }
        self.core.cond.notify_all();
        // A broken transport keeps erroring; don't let the loop spin hot.
        std::thread::sleep(Duration::from_millis(5));
    }

    /// Everything written to stdout (prompt markers excluded).
    #[must_use]
    pub fn stdout(&self) -> String {
        self.core.state.lock().buffers.current().stdout.clone()
    }

    /// Everything received on the stderr stream.
    #[must_use]
    pub fn stderr(&self) -> String {
        self.core.state.lock().buffers.current().stderr.clone()
    }

    /// The full transcript, prompts included.
    #[must_use]
    pub fn combined_output(&self) -> String {
        self.core.state.lock().buffers.current().combined.clone()
    }

    /// Exit code captured by the most recent `exec`.
    #[must_use]
    pub fn last_exit_code(&self) -> Option<ExitCode> {
        self.core.state.lock().last_exit_code
    }

    /// Depth of the capture-scope stack. Zero whenever no driver operation
    /// is in flight — in particular, always zero once `run` has returned.
    #[must_use]
    pub fn buffer_depth(&self) -> usize {
        self.core.state.lock().buffers.depth()
    }

    /// Snapshot of the option set.
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        self.core.state.lock().options.clone()
    }
}

fn connect_error(err: TransportError) -> ShellError {
    match err {
        TransportError::PtyRequest(_) => ShellError::FailedToRequestPty(err),
        TransportError::ShellStart(_) => ShellError::FailedToStartShell(err),
        other => ShellError::Transport(other),
    }
}

/// The worker strand body: hook phases, dialect setup, the user script, the
/// exception chain, and quit teardown.
fn worker_main<F>(
    core: &Arc<SessionCore>,
    hooks: &Hooks,
    dialect: Arc<dyn Dialect>,
    script: F,
) -> Option<ShellError>
where
    F: FnOnce(&mut ShellHandle) -> Result<(), ShellError>,
{
    let ctl = SessionCtl::new(Arc::clone(core));
    let mut handle = ShellHandle {
        core: Arc::clone(core),
        dialect: Arc::clone(&dialect),
    };

    let mut init_ok = false;
    let phase: Result<(), ShellError> = (|| {
        hooks.run_lifecycle(HookName::BeforeInit, &ctl)?;
        dialect.setup(&mut handle)?;
        init_ok = true;
        hooks.run_lifecycle(HookName::AfterInit, &ctl)?;
        script(&mut handle)
    })();

    let mut err = match phase {
        Ok(()) => None,
        Err(ShellError::QuitNow) => {
            debug!("script requested quiet unwind");
            None
        }
        Err(e) => Some(e),
    };

    // Exception hooks run before teardown so a handler may still adjust the
    // session (e.g. swap the quit command).
    if let Some(e) = err.take() {
        match hooks.run(HookName::OnException, &ctl, &HookEvent::Exception { error: &e }) {
            Ok(true) => info!(error = %e, "exception handled by hook"),
            Ok(false) => err = Some(e),
            Err(hook_err) => {
                warn!(error = %hook_err, "exception hook itself failed");
                err = Some(hook_err);
            }
        }
    }

    if init_ok {
        if let Err(e) = hooks.run_lifecycle(HookName::BeforeTerm, &ctl) {
            err.get_or_insert(e);
        }
        teardown(&mut handle);
    }
    if let Err(e) = hooks.run_lifecycle(HookName::AfterTerm, &ctl) {
        err.get_or_insert(e);
    }
    err
}

/// Send the quit command with a one-second grace, ignoring I/O failures —
/// the whole point of quit is that the transport is about to close.
fn teardown(handle: &mut ShellHandle) {
    let (quit, saved_code) = {
        let mut st = handle.core.state.lock();
        st.ignore_io_error = true;
        (st.options.quit.clone(), st.last_exit_code)
    };
    let opts = ExecOptions {
        retrieve_exit_code: Some(false),
        command_timeout: Some(1.0),
        timeout_error: false,
        get_output: false,
        ..ExecOptions::default()
    };
    if let Err(e) = handle.exec_opts(&quit, opts) {
        debug!(error = %e, "quit command failed during teardown");
    }
    // The quit exchange must not disturb the inspectable exit code.
    handle.core.state.lock().last_exit_code = saved_code;
}

/// Build the transport sink for one stream: clean, route into buffers,
/// update echo gating, then hand the chunk to the monitor or the debug
/// hooks — with no session lock held across either.
fn make_sink(core: Arc<SessionCore>, hooks: Arc<Hooks>, kind: StreamKind) -> Sink {
    let ctl = SessionCtl::new(Arc::clone(&core));
    Box::new(move |raw: &[u8]| {
        let text = assembler::clean(raw);
        let shown = {
            let mut st = core.state.lock();
            let Shared {
                buffers,
                prompt,
                last_output,
                wait,
                waiting_for_echo_of,
                ..
            } = &mut *st;
            let shown = assembler::ingest(buffers.current_mut(), prompt, kind, &text).to_string();
            *last_output = Instant::now();
            if let Some(job) = wait.as_mut() {
                job.nudges = 0;
            }
            if let Some(expected) = waiting_for_echo_of.as_ref() {
                if contains_bytes(raw, expected) {
                    *waiting_for_echo_of = None;
                }
            }
            shown
        };

        let reply = {
            let mut slot = core.monitor.lock();
            if let Some(monitor) = slot.as_mut() {
                monitor(&shown, kind).filter(|s| !s.is_empty())
            } else {
                trace!(?kind, chunk = %shown, "shell output");
                if let Err(e) = hooks.run(
                    HookName::OnDebug,
                    &ctl,
                    &HookEvent::Debug {
                        chunk: &shown,
                        kind,
                    },
                ) {
                    warn!(error = %e, "debug hook failed");
                }
                None
            }
        };

        if let Some(reply) = reply {
            let mut st = core.state.lock();
            let ending = st.options.line_ending.clone();
            st.queue.queue(&reply);
            st.queue.queue(&ending);
        }
    })
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_bytes() {
        assert!(contains_bytes(b"abcdef", b"cde"));
        assert!(!contains_bytes(b"abc", b"abcd"));
        assert!(!contains_bytes(b"abc", b""));
    }

    #[test]
    fn test_ctl_change_quit_swaps_whole_value() {
        let ctl = SessionCtl::detached();
        assert_eq!(ctl.options().quit, "exit");
        ctl.change_quit("/sbin/reboot");
        let opts = ctl.options();
        assert_eq!(opts.quit, "/sbin/reboot");
        assert_eq!(opts.prompt, "~~#");
    }
}
