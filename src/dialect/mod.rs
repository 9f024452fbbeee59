//! Dialects: composable shell-specific behaviour.
//!
//! A dialect decides how the session is brought to a usable prompt, how exit
//! codes are retrieved, and which hooks it contributes. Dialects compose
//! with the engine through this trait — there is no inheritance; a dialect
//! that wants custom behaviour overrides the method and calls the helpers it
//! still needs.

mod menu;
mod posix;

pub use menu::{DeviceInfo, MenuConsole, RestartNow};
pub use posix::{FileTransfer, FileTransferError, PosixShell};

use crate::error::ShellError;
use crate::hooks::Hooks;
use crate::session::{ExitCode, ShellHandle};

/// Shell-specific behaviour plugged into a session.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the freshly connected shell to a usable prompt. The default
    /// simply waits for the configured prompt to show up.
    fn setup(&self, sh: &mut ShellHandle) -> Result<(), ShellError> {
        wait_for_initial_prompt(sh)
    }

    /// Command whose output is the previous command's exit status. `None`
    /// means the dialect cannot retrieve exit codes.
    fn exit_code_command(&self) -> Option<String> {
        Some("echo $?".to_string())
    }

    /// Retrieve the exit code of the command that just finished.
    fn exit_code(&self, sh: &mut ShellHandle) -> Result<ExitCode, ShellError> {
        match self.exit_code_command() {
            Some(query) => sh.probe_exit_code(&query),
            None => Ok(ExitCode::Undefined),
        }
    }

    /// Contribute hook callbacks. Called once, at session construction,
    /// before any user registrations.
    fn register_hooks(&self, _hooks: &mut Hooks) {}
}

/// Default prompt negotiation: a generous wait for the configured prompt,
/// reported as a setup failure rather than a plain timeout.
pub fn wait_for_initial_prompt(sh: &mut ShellHandle) -> Result<(), ShellError> {
    match sh.wait_for_prompt(Some(30.0), Some(30.0), true) {
        Ok(_) => Ok(()),
        Err(ShellError::CommandTimeout | ShellError::SilenceTimeout) => {
            Err(ShellError::FailedToSetPrompt)
        }
        Err(other) => Err(other),
    }
}
