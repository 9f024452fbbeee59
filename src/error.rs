//! Error taxonomy for the shell driver.
//!
//! Sentinel conditions (timeouts, lifecycle misuse, the silent quit unwind)
//! are variants of [`ShellError`]; dialect-specific sentinels travel as boxed
//! custom errors and are recognised by downcast.

use crate::transport::TransportError;
use thiserror::Error;

/// Errors raised by sessions, the command driver, and dialects.
#[derive(Debug, Error)]
pub enum ShellError {
    /// An option failed validation.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The sanitised prompt exceeds the supported length.
    #[error("prompt is too long after sanitising: {0} bytes")]
    PromptTooLong(usize),

    /// A public operation was called outside the running state.
    #[error("session is not running")]
    NotRunning,

    /// `run` was called while the session was already running.
    #[error("session is already running")]
    AlreadyRunning,

    /// The session already ran to completion; sessions are single-use.
    #[error("session completed")]
    SessionCompleted,

    /// The per-command absolute deadline elapsed.
    #[error("command timed out")]
    CommandTimeout,

    /// The shell produced no output through three nudges.
    #[error("shell went silent")]
    SilenceTimeout,

    /// A command exited non-zero and the session is configured to raise.
    #[error("command exited with status {0}")]
    NonZeroExitCode(i32),

    /// The transport could not obtain a pseudo-terminal.
    #[error("failed to request a pty")]
    FailedToRequestPty(#[source] TransportError),

    /// The transport connected but the remote shell would not start.
    #[error("failed to start the shell")]
    FailedToStartShell(#[source] TransportError),

    /// Initial prompt negotiation failed.
    #[error("failed to set the shell prompt")]
    FailedToSetPrompt,

    /// Sentinel raised by user scripts to end the session silently.
    #[error("quit now")]
    QuitNow,

    /// The underlying byte channel failed.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// A dialect- or script-defined error carried through the engine.
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl ShellError {
    /// Wrap an arbitrary error so it can unwind through the engine.
    pub fn custom<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Custom(Box::new(err))
    }

    /// Downcast a custom error to a concrete sentinel type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Custom(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this error wraps a custom sentinel of type `E`.
    #[must_use]
    pub fn is_sentinel<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }
}
