//! shellpilot — drive interactive shells programmatically.
//!
//! Opens a line-oriented command shell over a byte-stream transport (a
//! local PTY, an SSH channel with a pseudo-terminal, or a serial port) and
//! turns it into a synchronous `exec(command) → output, exit code` API with
//! timeouts, nudges, nested prompt scoping, and dialect hooks.
//!
//! ```no_run
//! use shellpilot::{Session, SessionOptions};
//!
//! # fn main() -> Result<(), shellpilot::ShellError> {
//! let session = Session::pty(SessionOptions::default(), ["sh"])?
//!     .run(|sh| {
//!         let listing = sh.exec("ls -al")?;
//!         println!("{listing}");
//!         Ok(())
//!     })?;
//! println!("{}", session.combined_output());
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod buffers;
pub mod dialect;
pub mod error;
pub mod hooks;
pub mod options;
pub mod prompt;
pub mod queue;
pub mod session;
pub mod testing;
pub mod transport;

pub use assembler::StreamKind;
pub use dialect::{Dialect, DeviceInfo, FileTransfer, MenuConsole, PosixShell, RestartNow};
pub use error::ShellError;
pub use hooks::{HookEvent, HookFlow, HookName, Hooks};
pub use options::{
    ExitCodePolicy, InputMode, SerialOptions, SerialParity, SessionOptions, ShellRequest,
    SshOptions,
};
pub use prompt::Prompt;
pub use session::{ExecOptions, ExitCode, Session, SessionCtl, ShellHandle};
pub use transport::{
    PtyTransport, SerialTransport, Sink, SshTransport, Transport, TransportError,
};
