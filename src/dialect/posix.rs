//! POSIX shell dialect.
//!
//! Installs the engine prompt via `PS1` on setup and provides byte-exact
//! file transfer over the text channel: payloads travel base64-encoded
//! through chained `echo` appends and are decoded remotely by whichever
//! decoder the shell has available.

use super::Dialect;
use crate::error::ShellError;
use crate::prompt;
use crate::session::{ExecOptions, ExitCode, ShellHandle};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, warn};

/// A single queued command line never exceeds this many bytes; PTY line
/// disciplines start dropping input well above it.
const COMMAND_CEILING: usize = 2048;

/// Width of the base64 lines written to the sidecar file.
const B64_LINE: usize = 76;

/// File transfer failed for a reason other than a transport error.
#[derive(Debug, Error)]
#[error("file transfer failed: {0}")]
pub struct FileTransferError(pub String);

/// Dialect for `sh`-compatible shells (bash, dash, BSD sh, busybox).
pub struct PosixShell;

impl PosixShell {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for PosixShell {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for PosixShell {
    fn name(&self) -> &'static str {
        "posix"
    }

    /// Replace whatever prompt the shell starts with by the engine's
    /// sanitised marker, then wait for it. The install line itself cannot
    /// false-match: its echo ends with `export PS1`, not the marker.
    fn setup(&self, sh: &mut ShellHandle) -> Result<(), ShellError> {
        let marker = prompt::sanitize(&sh.options().prompt);
        sh.queue_line(&format!("unset PROMPT_COMMAND; PS1='{marker}'; export PS1"));
        match sh.wait_for_prompt(Some(30.0), Some(30.0), true) {
            Ok(_) => Ok(()),
            Err(ShellError::CommandTimeout | ShellError::SilenceTimeout) => {
                Err(ShellError::FailedToSetPrompt)
            }
            Err(other) => Err(other),
        }
    }
}

/// Remote base64 implementation discovered through `which`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum B64Tool {
    Coreutils,
    Openssl,
    Perl,
}

impl B64Tool {
    fn decode_command(self, sidecar: &str, path: &str) -> String {
        match self {
            Self::Coreutils => format!("base64 -d {sidecar} > {path}"),
            Self::Openssl => format!("openssl base64 -d -in {sidecar} -out {path}"),
            Self::Perl => format!(
                "perl -MMIME::Base64 -0777 -ne 'print decode_base64($_)' < {sidecar} > {path}"
            ),
        }
    }

    fn encode_command(self, path: &str) -> String {
        match self {
            Self::Coreutils => format!("base64 {path}"),
            Self::Openssl => format!("openssl base64 -in {path}"),
            Self::Perl => format!(
                "perl -MMIME::Base64 -0777 -ne 'print encode_base64($_)' < {path}"
            ),
        }
    }
}

/// Byte-exact file transfer for POSIX-shell sessions.
pub trait FileTransfer {
    /// Write `data` to `path` on the remote side, byte for byte.
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), ShellError>;

    /// Read the remote file at `path`, byte for byte.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ShellError>;
}

impl FileTransfer for ShellHandle {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), ShellError> {
        let sidecar = format!("{path}.b64");
        let q_sidecar = quote(&sidecar);
        let q_path = quote(path);

        let encoded = STANDARD.encode(data);
        debug!(path, bytes = data.len(), lines = encoded.len().div_ceil(B64_LINE),
               "writing file via base64 sidecar");

        // Truncate the sidecar, then append the payload in command batches
        // chained with && under the ceiling.
        self.exec_ignore_code(&format!(": > {q_sidecar}"), ExecOptions::default())?;
        let mut batch = String::new();
        for line in chunks(&encoded, B64_LINE) {
            let cmd = format!("echo {line} >> {q_sidecar}");
            if !batch.is_empty() && batch.len() + 4 + cmd.len() > COMMAND_CEILING {
                self.exec_ignore_code(&batch, ExecOptions::default())?;
                batch.clear();
            }
            if !batch.is_empty() {
                batch.push_str(" && ");
            }
            batch.push_str(&cmd);
        }
        if !batch.is_empty() {
            self.exec_ignore_code(&batch, ExecOptions::default())?;
        }

        let tool = discover_b64_tool(self)?;
        let status = self.exec_for_code(
            &tool.decode_command(&q_sidecar, &q_path),
            ExecOptions::default(),
        )?;
        // The sidecar goes away whether or not the decode worked.
        self.exec_ignore_code(&format!("rm -f {q_sidecar}"), ExecOptions::default())?;
        match status {
            ExitCode::Code(0) => Ok(()),
            other => Err(ShellError::custom(FileTransferError(format!(
                "remote decode of {path} reported {other:?}"
            )))),
        }
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ShellError> {
        let tool = discover_b64_tool(self)?;
        let output = self.exec_ignore_code(
            &tool.encode_command(&quote(path)),
            ExecOptions::default(),
        )?;
        let compact: String = output.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD.decode(compact.as_bytes()).map_err(|e| {
            ShellError::custom(FileTransferError(format!(
                "remote encode of {path} was not valid base64: {e}"
            )))
        })
    }
}

/// Probe `which` for a usable base64 implementation, in preference order.
fn discover_b64_tool(sh: &mut ShellHandle) -> Result<B64Tool, ShellError> {
    for (name, tool) in [
        ("base64", B64Tool::Coreutils),
        ("openssl", B64Tool::Openssl),
        ("perl", B64Tool::Perl),
    ] {
        let found = sh.exec_ignore_code(&format!("which {name}"), ExecOptions::default())?;
        if found.lines().any(|l| l.trim().starts_with('/')) {
            return Ok(tool);
        }
    }
    warn!("no base64 implementation on the remote side");
    Err(ShellError::custom(FileTransferError(
        "no base64 implementation available (tried base64, openssl, perl)".into(),
    )))
}

/// Single-quote a path for the remote shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn chunks(s: &str, width: usize) -> impl Iterator<Item = &str> {
    // base64 output is pure ASCII; byte slicing is safe.
    (0..s.len()).step_by(width).map(move |i| &s[i..(i + width).min(s.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_handles_embedded_quotes() {
        assert_eq!(quote("plain.txt"), "'plain.txt'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_chunks_cover_whole_input() {
        let text = "abcdefghij";
        let parts: Vec<&str> = chunks(text, 4).collect();
        assert_eq!(parts, vec!["abcd", "efgh", "ij"]);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_decode_command_shapes() {
        assert_eq!(
            B64Tool::Coreutils.decode_command("'f.b64'", "'f'"),
            "base64 -d 'f.b64' > 'f'"
        );
        assert!(B64Tool::Openssl
            .decode_command("'f.b64'", "'f'")
            .starts_with("openssl base64 -d"));
        assert!(B64Tool::Perl.decode_command("'f.b64'", "'f'").contains("decode_base64"));
    }
}
