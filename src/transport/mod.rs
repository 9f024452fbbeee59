//! Byte-stream transports.
//!
//! The engine is polymorphic over this capability set: open and close the
//! channel, write bytes, deliver inbound bytes through registered sinks, and
//! service the transport's internal event pump one bounded step at a time.
//! The reactor strand owns the transport exclusively; sinks may be invoked
//! from the pump or from a transport-private reader strand.

mod pty;
mod serial;
mod ssh;

pub use pty::PtyTransport;
pub use serial::SerialTransport;
pub use ssh::SshTransport;

use std::time::Duration;
use thiserror::Error;

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to authenticate: {0}")]
    Auth(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to request a pty: {0}")]
    PtyRequest(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to start the shell: {0}")]
    ShellStart(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("transport is not connected")]
    NotConnected,
}

impl TransportError {
    pub(crate) fn connect<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connect(Box::new(err))
    }
}

/// Sink receiving inbound bytes for one stream.
pub type Sink = Box<dyn FnMut(&[u8]) + Send>;

/// A bidirectional byte channel to a remote shell.
pub trait Transport: Send {
    /// Establish the channel; blocks until ready or fails.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Begin an orderly close. Idempotent, best effort.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether the channel is currently open.
    fn active(&self) -> bool;

    /// Write bytes to the remote side. Only the reactor strand calls this.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Install the sink for the primary (stdout) stream. Must be called
    /// before `connect`.
    fn register_stdout(&mut self, sink: Sink);

    /// Install the sink for the secondary (stderr) stream, where the
    /// transport has one.
    fn register_stderr(&mut self, sink: Sink);

    /// Service the transport's event pump: deliver any pending inbound
    /// bytes, waiting at most `max_wait`. A closed channel is not an error
    /// here; the caller observes it through `active`.
    fn pump(&mut self, max_wait: Duration) -> Result<(), TransportError>;
}
