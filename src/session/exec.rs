//! The synchronous command driver.
//!
//! `exec` pushes a capture scope, queues the command, waits for the prompt,
//! slices the command's own output out of the transcript, optionally probes
//! the exit code, and merges the scope back — on every path, including
//! errors.

use super::{ExitCode, SessionCore, ShellHandle};
use crate::assembler::{MonitorFn, StreamKind};
use crate::error::ShellError;
use crate::options::ExitCodePolicy;
use crate::prompt::Prompt;
use regex::Regex;
use std::sync::Arc;
use tracing::warn;

/// Per-call overrides for [`ShellHandle::exec_opts`]. `None` fields fall
/// back to the session options.
pub struct ExecOptions {
    pub retrieve_exit_code: Option<bool>,
    pub on_non_zero_exit_code: Option<ExitCodePolicy>,
    /// Seconds; zero disables the silence timer for this call.
    pub silence_timeout: Option<f64>,
    /// Seconds; zero disables the absolute deadline for this call.
    pub command_timeout: Option<f64>,
    /// When unset, a timeout returns the raw transcript instead of failing.
    pub timeout_error: bool,
    /// Whether to slice and return the command's output.
    pub get_output: bool,
    /// Whether the remote shell echoes the command line back.
    pub command_is_echoed: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            retrieve_exit_code: None,
            on_non_zero_exit_code: None,
            silence_timeout: None,
            command_timeout: None,
            timeout_error: true,
            get_output: true,
            command_is_echoed: true,
        }
    }
}

/// Restores the exec scope on every exit path: merge the capture scope back
/// and reinstall the previous monitor.
struct ExecScope {
    core: Arc<SessionCore>,
    old_monitor: Option<Option<MonitorFn>>,
}

impl Drop for ExecScope {
    fn drop(&mut self) {
        self.core.state.lock().buffers.pop_merge();
        if let Some(old) = self.old_monitor.take() {
            *self.core.monitor.lock() = old;
        }
    }
}

/// Discards the probe scope on every exit path.
struct ProbeScope {
    core: Arc<SessionCore>,
}

impl Drop for ProbeScope {
    fn drop(&mut self) {
        self.core.state.lock().buffers.pop_discard();
    }
}

impl ShellHandle {
    /// Run a command and return its output, using the session defaults.
    pub fn exec(&mut self, command: &str) -> Result<String, ShellError> {
        self.exec_inner(command, ExecOptions::default(), None)
    }

    /// Run a command with per-call overrides.
    pub fn exec_opts(&mut self, command: &str, opts: ExecOptions) -> Result<String, ShellError> {
        self.exec_inner(command, opts, None)
    }

    /// Run a command with a monitor that sees every cleaned output chunk
    /// and may return a reply to queue back (interactive confirmations).
    pub fn exec_monitored(
        &mut self,
        command: &str,
        opts: ExecOptions,
        monitor: impl FnMut(&str, StreamKind) -> Option<String> + Send + 'static,
    ) -> Result<String, ShellError> {
        self.exec_inner(command, opts, Some(Box::new(monitor)))
    }

    /// Run a command and return its exit code, regardless of the session's
    /// `retrieve_exit_code` default.
    pub fn exec_for_code(
        &mut self,
        command: &str,
        mut opts: ExecOptions,
    ) -> Result<ExitCode, ShellError> {
        opts.retrieve_exit_code = Some(true);
        self.exec_inner(command, opts, None)?;
        Ok(self.last_exit_code().unwrap_or(ExitCode::Undefined))
    }

    /// Run a command without touching exit codes, returning its output.
    pub fn exec_ignore_code(
        &mut self,
        command: &str,
        mut opts: ExecOptions,
    ) -> Result<String, ShellError> {
        opts.retrieve_exit_code = Some(false);
        self.exec_inner(command, opts, None)
    }

    fn exec_inner(
        &mut self,
        command: &str,
        opts: ExecOptions,
        monitor: Option<MonitorFn>,
    ) -> Result<String, ShellError> {
        if command.contains('\n') || command.contains('\r') {
            return Err(ShellError::InvalidOption(
                "command must not contain a line break".into(),
            ));
        }

        let (retrieve, policy);
        {
            let mut st = self.core.state.lock();
            if !st.running {
                return Err(if st.completed {
                    ShellError::SessionCompleted
                } else {
                    ShellError::NotRunning
                });
            }
            retrieve = opts
                .retrieve_exit_code
                .unwrap_or(st.options.retrieve_exit_code);
            policy = opts
                .on_non_zero_exit_code
                .unwrap_or(st.options.on_non_zero_exit_code);
            let ending = st.options.line_ending.clone();
            st.buffers.push();
            st.queue.queue(command);
            st.queue.queue(&ending);
        }
        let old_monitor = {
            let mut slot = self.core.monitor.lock();
            Some(std::mem::replace(&mut *slot, monitor))
        };
        let _scope = ExecScope {
            core: Arc::clone(&self.core),
            old_monitor,
        };

        let found = self.wait_for_prompt(
            opts.silence_timeout,
            opts.command_timeout,
            opts.timeout_error,
        )?;

        if !found {
            // Timed out without raising: hand back the raw transcript.
            let mut st = self.core.state.lock();
            st.last_exit_code = Some(ExitCode::Timeout);
            return Ok(st.buffers.current().combined.clone());
        }

        let output = if opts.get_output {
            let st = self.core.state.lock();
            extract_output(
                &st.buffers.current().combined,
                &st.prompt,
                command,
                opts.command_is_echoed,
            )
        } else {
            String::new()
        };

        if retrieve {
            let dialect = self.dialect();
            let code = dialect.exit_code(self)?;
            self.core.state.lock().last_exit_code = Some(code);
            if policy == ExitCodePolicy::Raise {
                if let ExitCode::Code(status) = code {
                    if status != 0 {
                        return Err(ShellError::NonZeroExitCode(status));
                    }
                }
            }
        } else {
            self.core.state.lock().last_exit_code = None;
        }

        Ok(output)
    }

    /// Default exit-code probe: run the dialect's query inside a discarded
    /// capture scope and parse the first integer line.
    pub(crate) fn probe_exit_code(&mut self, query: &str) -> Result<ExitCode, ShellError> {
        {
            let mut st = self.core.state.lock();
            let ending = st.options.line_ending.clone();
            st.buffers.push();
            st.queue.queue(query);
            st.queue.queue(&ending);
        }
        let _scope = ProbeScope {
            core: Arc::clone(&self.core),
        };

        let found = self.wait_for_prompt(None, Some(1.0), false)?;
        if !found {
            return Ok(ExitCode::Undefined);
        }

        let st = self.core.state.lock();
        let output = extract_output(&st.buffers.current().combined, &st.prompt, query, true);
        for line in output.lines() {
            if let Ok(code) = line.trim().parse::<i32>() {
                return Ok(ExitCode::Code(code));
            }
        }
        warn!(output = %output, "exit code query produced no integer");
        Ok(ExitCode::Undefined)
    }
}

/// Slice a command's own output out of a capture-scope transcript: drop the
/// trailing prompt, then drop everything through the echoed command line.
fn extract_output(combined: &str, prompt: &Prompt, command: &str, echoed: bool) -> String {
    let end = prompt.find_end(combined).unwrap_or(combined.len());
    let body = &combined[..end];
    if !echoed {
        return body.to_string();
    }

    // Shells may or may not prefix the echo with the prompt; accept both.
    let echo = Regex::new(&format!(
        r"^(?:(?:{})[ \t]*)?{}[ \t]*$",
        prompt.source(),
        regex::escape(command)
    ));
    let Ok(echo) = echo else {
        warn!(command, "echo pattern failed to compile");
        return body.to_string();
    };

    let mut consumed = 0;
    for line in body.split_inclusive('\n') {
        let bare = line.strip_suffix('\n').unwrap_or(line);
        consumed += line.len();
        if echo.is_match(bare) {
            return body[consumed..].to_string();
        }
    }
    warn!(command, "command echo not found in output");
    body.to_string()
}
