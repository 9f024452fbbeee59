//! Output assembly: terminal-artefact stripping and buffer routing.
//!
//! Everything the transport delivers passes through [`clean`] (escape
//! stripping and newline reduction) and then [`ingest`], which routes the
//! text into the stdout/stderr/combined buffers. The prompt marker is kept
//! out of the stdout buffer by splitting each chunk at the rightmost prompt
//! occurrence.

use crate::buffers::BufferSet;
use crate::prompt::Prompt;
use once_cell::sync::Lazy;
use regex::Regex;

/// Which transport stream a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Per-exec monitor callback. Receives each cleaned chunk and may return a
/// reply to queue back to the shell (interactive prompts, confirmations).
pub type MonitorFn = Box<dyn FnMut(&str, StreamKind) -> Option<String> + Send>;

// Cursor-movement CSI commands (CUU/CUD/CUF/CUB/CNL/CPL/CHA/CUP/HVP).
static CSI_MOVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9:;<=>?]*[A-Hf]").expect("static pattern"));
// Any remaining CSI command: params, intermediates, final byte.
static CSI_ANY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9:;<=>?]*[ -/]*[@-~]").expect("static pattern"));
// Operating-system commands (window titles etc.), BEL- or ST-terminated.
static OSC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?").expect("static pattern"));
// Character-set designation sequences.
static CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b[()*+][0-9A-Za-z@%]?").expect("static pattern"));
// Leftover two-byte escapes, including a bare string terminator.
static ESC_MISC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b[@-Z\\^_=><]").expect("static pattern"));

/// Strip terminal control artefacts and reduce newline variants.
#[must_use]
pub fn clean(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let text = CSI_MOVE.replace_all(&text, "\n");
    let text = CSI_ANY.replace_all(&text, "");
    let text = OSC.replace_all(&text, "");
    let text = CHARSET.replace_all(&text, "");
    let text = ESC_MISC.replace_all(&text, "");

    let mut printable = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\t' => printable.push(' '),
            '\n' | '\r' => printable.push(c),
            c if c.is_control() => {}
            c => printable.push(c),
        }
    }

    printable
        .replace("\r\n", "\n")
        .replace(" \r", "")
        .replace('\r', "")
}

/// Route one cleaned chunk into the buffers.
///
/// Returns the portion shown to monitors: for stdout that is the prefix up
/// to the rightmost prompt occurrence (the prompt itself never reaches the
/// stdout buffer), for stderr the whole chunk.
pub fn ingest<'a>(
    buffers: &mut BufferSet,
    prompt: &Prompt,
    kind: StreamKind,
    text: &'a str,
) -> &'a str {
    match kind {
        StreamKind::Stdout => {
            let prefix = match prompt.rightmost(text) {
                Some((start, _)) => &text[..start],
                None => text,
            };
            buffers.stdout.push_str(prefix);
            buffers.combined.push_str(text);
            prefix
        }
        StreamKind::Stderr => {
            buffers.stderr.push_str(text);
            buffers.combined.push_str(text);
            text
        }
    }
}
