//! Session and transport configuration.
//!
//! Options are validated once and then frozen; nothing mutates a validated
//! value in place. The one sanctioned "mutation" — swapping the quit command
//! during a restart — replaces the whole value atomically under the session
//! lock via [`SessionOptions::with_quit`].

use crate::error::ShellError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a command exits non-zero and the exit code was retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExitCodePolicy {
    /// Record the code and keep going.
    #[default]
    Ignore,
    /// Raise [`ShellError::NonZeroExitCode`](crate::ShellError::NonZeroExitCode).
    Raise,
}

/// How queued input is chunked before it is written to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Whole chunks, written as queued.
    #[default]
    None,
    /// One character at a time.
    Char,
    /// One character at a time, each gated on seeing its echo come back.
    Echo,
}

/// Core session options, independent of the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Prompt marker the remote shell is told to display.
    pub prompt: String,
    /// Whether `exec` captures the exit code of every command by default.
    pub retrieve_exit_code: bool,
    /// Policy applied when a retrieved exit code is non-zero.
    pub on_non_zero_exit_code: ExitCodePolicy,
    /// Seconds of silence tolerated before the nudge protocol starts.
    /// Zero disables silence tracking.
    pub silence_timeout: f64,
    /// Absolute per-command cap in seconds. Zero disables it.
    pub command_timeout: f64,
    /// Input chunking discipline.
    pub unbuffered_input: InputMode,
    /// Command written during teardown to request an orderly exit.
    pub quit: String,
    /// Line ending appended to queued commands.
    pub line_ending: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            prompt: "~~#".to_string(),
            retrieve_exit_code: false,
            on_non_zero_exit_code: ExitCodePolicy::Ignore,
            silence_timeout: 0.0,
            command_timeout: 0.0,
            unbuffered_input: InputMode::None,
            quit: "exit".to_string(),
            line_ending: "\n".to_string(),
        }
    }
}

impl SessionOptions {
    /// Validate the option set. Runs once, at session construction.
    pub fn validate(&self) -> Result<(), ShellError> {
        if self.quit.trim().is_empty() {
            return Err(ShellError::InvalidOption(
                "quit command must not be empty".into(),
            ));
        }
        if self.line_ending.is_empty() {
            return Err(ShellError::InvalidOption(
                "line ending must not be empty".into(),
            ));
        }
        for (name, value) in [
            ("silence_timeout", self.silence_timeout),
            ("command_timeout", self.command_timeout),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ShellError::InvalidOption(format!(
                    "{name} must be a non-negative number of seconds"
                )));
            }
        }
        Ok(())
    }

    /// Return a copy with a different quit command. The caller swaps the
    /// whole value under the session lock; the original stays frozen.
    #[must_use]
    pub fn with_quit(&self, quit: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.quit = quit.into();
        next
    }

    /// Default silence timeout as a duration, `None` when disabled.
    #[must_use]
    pub fn silence(&self) -> Option<Duration> {
        seconds(self.silence_timeout)
    }

    /// Default command timeout as a duration, `None` when disabled.
    #[must_use]
    pub fn command(&self) -> Option<Duration> {
        seconds(self.command_timeout)
    }
}

/// Convert a seconds option to a duration; zero means disabled.
pub(crate) fn seconds(value: f64) -> Option<Duration> {
    if value > 0.0 {
        Some(Duration::from_secs_f64(value))
    } else {
        None
    }
}

/// What to ask the SSH server to run on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShellRequest {
    /// Request a PTY and start the default login shell.
    #[default]
    Default,
    /// Request a PTY only; nothing is started on the channel.
    PtyOnly,
    /// Neither a PTY nor a shell; the caller drives the raw channel.
    NoPty,
    /// Request a PTY and `exec` the given program.
    Program(String),
}

/// SSH transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    /// Login user. Required, non-empty.
    pub user: String,
    pub password: String,
    pub shell: ShellRequest,
    /// TCP connect timeout in seconds.
    pub connect_timeout: f64,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            user: String::new(),
            password: String::new(),
            shell: ShellRequest::Default,
            connect_timeout: 5.0,
        }
    }
}

impl SshOptions {
    pub fn validate(&self) -> Result<(), ShellError> {
        if self.user.trim().is_empty() {
            return Err(ShellError::InvalidOption("user must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ShellError::InvalidOption("host must not be empty".into()));
        }
        if !self.connect_timeout.is_finite() || self.connect_timeout <= 0.0 {
            return Err(ShellError::InvalidOption(
                "connect_timeout must be a positive number of seconds".into(),
            ));
        }
        Ok(())
    }
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial transport options. Defaults describe an 8-N-1 line at 115200 baud.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Device path. Required, non-empty.
    pub path: String,
    pub speed: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            speed: 115_200,
            data_bits: 8,
            parity: SerialParity::None,
        }
    }
}

impl SerialOptions {
    pub fn validate(&self) -> Result<(), ShellError> {
        if self.path.trim().is_empty() {
            return Err(ShellError::InvalidOption(
                "device path must not be empty".into(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ShellError::InvalidOption(format!(
                "data_bits must be 5..=8, got {}",
                self.data_bits
            )));
        }
        if self.speed == 0 {
            return Err(ShellError::InvalidOption("speed must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SessionOptions::default();
        assert_eq!(opts.prompt, "~~#");
        assert_eq!(opts.quit, "exit");
        assert_eq!(opts.line_ending, "\n");
        assert!(!opts.retrieve_exit_code);
        assert!(opts.silence().is_none());
        assert!(opts.command().is_none());
        opts.validate().expect("defaults validate");
    }

    #[test]
    fn test_rejects_bad_timeouts() {
        let mut opts = SessionOptions::default();
        opts.command_timeout = -1.0;
        assert!(matches!(
            opts.validate(),
            Err(ShellError::InvalidOption(_))
        ));
        opts.command_timeout = f64::NAN;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_with_quit_leaves_original_frozen() {
        let opts = SessionOptions::default();
        let rebooting = opts.with_quit("/sbin/reboot");
        assert_eq!(opts.quit, "exit");
        assert_eq!(rebooting.quit, "/sbin/reboot");
        assert_eq!(rebooting.prompt, opts.prompt);
    }

    #[test]
    fn test_ssh_requires_user() {
        let opts = SshOptions::default();
        assert!(opts.validate().is_err());
        let opts = SshOptions {
            user: "admin".into(),
            ..SshOptions::default()
        };
        opts.validate().expect("user set");
    }

    #[test]
    fn test_serial_requires_path() {
        assert!(SerialOptions::default().validate().is_err());
        let opts = SerialOptions {
            path: "/dev/ttyUSB0".into(),
            data_bits: 9,
            ..SerialOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: SessionOptions =
            serde_json::from_str("{\"prompt\": \"##\", \"silence_timeout\": 2.5}").unwrap();
        assert_eq!(opts.prompt, "##");
        assert_eq!(opts.silence_timeout, 2.5);
        assert_eq!(opts.quit, "exit");
    }
}
