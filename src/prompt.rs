//! Prompt sanitising, compilation, and matching.
//!
//! The prompt is the trailing marker the remote shell prints when it is
//! ready for the next command. User-supplied prompt text is sanitised (shell
//! metacharacters would break both the `PS1` install and echo discarding),
//! then compiled into a pair of regexes: one anchored at end-of-buffer that
//! tolerates trailing spaces or tabs, and one unanchored used to split
//! inbound chunks.

use crate::error::ShellError;
use regex::Regex;

/// Characters replaced during sanitising.
const UNSAFE: [char; 6] = ['!', '$', '\\', '/', '"', '\''];

/// Longest sanitised prompt the engine accepts. The prompt is embedded into
/// single command lines (the `PS1` install, the echo-discard scan), so it
/// must stay well under the command ceiling.
pub const MAX_PROMPT_LEN: usize = 128;

/// Replace shell-hostile characters and fall back to the stock marker when
/// nothing survives.
#[must_use]
pub fn sanitize(prompt: &str) -> String {
    let cleaned: String = prompt
        .chars()
        .map(|c| if UNSAFE.contains(&c) { '#' } else { c })
        .collect();
    if cleaned.trim().is_empty() {
        "~~#".to_string()
    } else {
        cleaned
    }
}

/// A compiled prompt pattern.
#[derive(Debug, Clone)]
pub struct Prompt {
    source: String,
    end: Regex,
    any: Regex,
}

impl Prompt {
    /// Compile a literal prompt string (sanitised first).
    pub fn literal(text: &str) -> Result<Self, ShellError> {
        let cleaned = sanitize(text);
        if cleaned.len() > MAX_PROMPT_LEN {
            return Err(ShellError::PromptTooLong(cleaned.len()));
        }
        Self::from_source(&regex::escape(&cleaned))
    }

    /// Compile a caller-provided regex source. The caller is responsible for
    /// the pattern's own anchoring; the end-of-buffer anchor is added here.
    pub fn pattern(source: &str) -> Result<Self, ShellError> {
        Self::from_source(source)
    }

    fn from_source(source: &str) -> Result<Self, ShellError> {
        let end = Regex::new(&format!(r"(?:{source})[ \t]*$"))
            .map_err(|e| ShellError::InvalidOption(format!("bad prompt pattern: {e}")))?;
        let any = Regex::new(source)
            .map_err(|e| ShellError::InvalidOption(format!("bad prompt pattern: {e}")))?;
        Ok(Self {
            source: source.to_string(),
            end,
            any,
        })
    }

    /// The unanchored regex source, used to build the echo-discard pattern.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Does the text end with the prompt (plus optional spaces/tabs)?
    #[must_use]
    pub fn matches_end(&self, text: &str) -> bool {
        self.end.is_match(text)
    }

    /// Byte offset where the trailing prompt match begins, if any.
    #[must_use]
    pub fn find_end(&self, text: &str) -> Option<usize> {
        self.end.find(text).map(|m| m.start())
    }

    /// Rightmost occurrence anywhere in the text, as a byte range.
    #[must_use]
    pub fn rightmost(&self, text: &str) -> Option<(usize, usize)> {
        self.any.find_iter(text).last().map(|m| (m.start(), m.end()))
    }
}
