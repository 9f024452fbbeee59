//! Menu-console device dialect.
//!
//! Some appliances greet a fresh console with a numbered text menu instead
//! of a shell prompt. This dialect parses the menu, selects the entry whose
//! label matches the configured shell entry, captures the device's own
//! prompt (`[version][user@host]/path:`), installs the engine marker via
//! `PS1`, and from there behaves like a POSIX shell. It also scopes a
//! nested command interpreter behind a temporary prompt and arranges for a
//! restart sentinel to swap the quit command for a reboot.

use super::Dialect;
use crate::error::ShellError;
use crate::hooks::{HookEvent, HookFlow, HookName, Hooks};
use crate::prompt::{self, Prompt};
use crate::session::{ExecOptions, ShellHandle};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sentinel raised by user scripts to reboot the device instead of exiting
/// the shell. Handled by this dialect's exception hook.
#[derive(Debug, Error)]
#[error("restart requested")]
pub struct RestartNow;

/// Identity parsed from the device prompt at setup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: String,
    pub user: String,
    pub host: String,
    pub path: String,
}

static MENU_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\d+)\)\s+(.+?)\s*$").expect("static pattern"));
static DEVICE_PROMPT_TAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([^\]\n]*)\]\[([^@\]\n]*)@([^\]\n]*)\]([^:\n]*):[ \t]*$")
        .expect("static pattern")
});

/// Dialect for menu-fronted device consoles with a nested interpreter.
pub struct MenuConsole {
    /// Label of the menu entry that drops to a shell.
    shell_entry: String,
    /// Text the menu ends with while waiting for a selection.
    menu_prompt: String,
    /// Regex source matching the device's own shell prompt.
    device_prompt: String,
    /// Command that starts the nested interpreter.
    interpreter_command: String,
    /// Prompt the nested interpreter displays.
    interpreter_prompt: String,
    /// Quit replacement installed when a script raises [`RestartNow`].
    reboot_command: String,
    info: Mutex<Option<DeviceInfo>>,
}

impl MenuConsole {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell_entry: "Shell".to_string(),
            menu_prompt: "Enter an option:".to_string(),
            device_prompt: r"\[[^\]\n]*\]\[[^\]\n]*\][^:\n]*:".to_string(),
            interpreter_command: "php -a".to_string(),
            interpreter_prompt: "php >".to_string(),
            reboot_command: "/sbin/reboot".to_string(),
            info: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_shell_entry(mut self, label: impl Into<String>) -> Self {
        self.shell_entry = label.into();
        self
    }

    #[must_use]
    pub fn with_menu_prompt(mut self, text: impl Into<String>) -> Self {
        self.menu_prompt = text.into();
        self
    }

    #[must_use]
    pub fn with_interpreter(
        mut self,
        command: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        self.interpreter_command = command.into();
        self.interpreter_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn with_reboot_command(mut self, command: impl Into<String>) -> Self {
        self.reboot_command = command.into();
        self
    }

    /// Identity parsed from the device prompt, once setup has run.
    #[must_use]
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.info.lock().clone()
    }

    /// Run `body` inside the nested interpreter. The interpreter is entered
    /// under a temporary prompt, exited by queueing `exit`, and the outer
    /// prompt is re-awaited before returning.
    pub fn interpreter<T>(
        &self,
        sh: &mut ShellHandle,
        body: impl FnOnce(&mut ShellHandle) -> Result<T, ShellError>,
    ) -> Result<T, ShellError> {
        let nested = Prompt::pattern(&regex::escape(&self.interpreter_prompt))?;
        let result = sh.temporary_prompt(nested, |sh| {
            sh.exec_opts(
                &self.interpreter_command,
                ExecOptions {
                    retrieve_exit_code: Some(false),
                    ..ExecOptions::default()
                },
            )?;
            let result = body(sh);
            sh.queue_line("exit");
            result
        })?;
        sh.wait_for_prompt(None, Some(5.0), true)?;
        Ok(result)
    }

    fn pick_entry(&self, menu: &str) -> Option<String> {
        let wanted = self.shell_entry.to_ascii_lowercase();
        for caps in MENU_ENTRY.captures_iter(menu) {
            if caps[2].to_ascii_lowercase().contains(&wanted) {
                return Some(caps[1].to_string());
            }
        }
        None
    }
}

impl Default for MenuConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for MenuConsole {
    fn name(&self) -> &'static str {
        "menu-console"
    }

    fn setup(&self, sh: &mut ShellHandle) -> Result<(), ShellError> {
        // The console opens on the menu, not a shell prompt.
        let menu_tail = Prompt::pattern(&regex::escape(&self.menu_prompt))?;
        let menu = sh.temporary_prompt(menu_tail, |sh| {
            sh.wait_for_prompt(Some(30.0), Some(30.0), true)?;
            Ok(sh.combined_output())
        })?;

        let Some(choice) = self.pick_entry(&menu) else {
            warn!(entry = %self.shell_entry, "menu entry not found");
            return Err(ShellError::FailedToStartShell(
                crate::transport::TransportError::ShellStart(
                    format!("menu has no entry labelled {:?}", self.shell_entry).into(),
                ),
            ));
        };
        debug!(choice = %choice, "selecting menu entry");

        // Select the entry and capture the device's own prompt.
        let device = Prompt::pattern(&self.device_prompt)?;
        let transcript = sh.temporary_prompt(device, |sh| {
            sh.queue_line(&choice);
            sh.wait_for_prompt(Some(30.0), Some(30.0), true)?;
            Ok(sh.combined_output())
        })?;

        if let Some(caps) = DEVICE_PROMPT_TAIL.captures(&transcript) {
            let parsed = DeviceInfo {
                version: caps[1].to_string(),
                user: caps[2].to_string(),
                host: caps[3].to_string(),
                path: caps[4].to_string(),
            };
            info!(version = %parsed.version, user = %parsed.user, host = %parsed.host,
                  "device console identified");
            *self.info.lock() = Some(parsed);
        } else {
            warn!("device prompt did not carry version/user/host");
        }

        // From here on it is an ordinary shell: install the engine marker.
        let marker = prompt::sanitize(&sh.options().prompt);
        sh.queue_line(&format!("PS1='{marker}'"));
        match sh.wait_for_prompt(Some(30.0), Some(30.0), true) {
            Ok(_) => Ok(()),
            Err(ShellError::CommandTimeout | ShellError::SilenceTimeout) => {
                Err(ShellError::FailedToSetPrompt)
            }
            Err(other) => Err(other),
        }
    }

    fn register_hooks(&self, hooks: &mut Hooks) {
        let reboot = self.reboot_command.clone();
        hooks.add(HookName::OnException, move |ctl, event| {
            if let HookEvent::Exception { error } = event {
                if error.is_sentinel::<RestartNow>() {
                    info!(command = %reboot, "restart requested, swapping quit command");
                    ctl.change_quit(reboot.clone());
                    return Ok(HookFlow::Break);
                }
            }
            Ok(HookFlow::Continue)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_entry_matches_label() {
        let console = MenuConsole::new();
        let menu = "\n 0) Logout\n 8) Shell\n 9) Reboot\nEnter an option:";
        assert_eq!(console.pick_entry(menu), Some("8".to_string()));
    }

    #[test]
    fn test_pick_entry_is_case_insensitive() {
        let console = MenuConsole::new().with_shell_entry("shell");
        let menu = " 3) Drop to Shell\nEnter an option:";
        assert_eq!(console.pick_entry(menu), Some("3".to_string()));
    }

    #[test]
    fn test_pick_entry_missing() {
        let console = MenuConsole::new();
        assert_eq!(console.pick_entry(" 1) Logout\n"), None);
    }

    #[test]
    fn test_device_prompt_tail_captures_identity() {
        let caps = DEVICE_PROMPT_TAIL
            .captures("banner\n[2.7.2-RELEASE][admin@edge.local]/root: ")
            .expect("prompt should match");
        assert_eq!(&caps[1], "2.7.2-RELEASE");
        assert_eq!(&caps[2], "admin");
        assert_eq!(&caps[3], "edge.local");
        assert_eq!(&caps[4], "/root");
    }

    #[test]
    fn test_restart_sentinel_travels_as_custom_error() {
        let err = ShellError::custom(RestartNow);
        assert!(err.is_sentinel::<RestartNow>());
    }
}
