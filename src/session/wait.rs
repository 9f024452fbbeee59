//! The prompt wait loop.
//!
//! The worker strand registers a wait job and parks; the reactor strand
//! evaluates it on every pump step — prompt detection, the silence nudge
//! protocol, and the absolute command deadline — and publishes a verdict.
//! Field ownership: the reactor is the only strand that writes to the
//! transport; the worker is the only strand that registers jobs.

use super::{SessionCore, Shared};
use crate::error::ShellError;
use crate::options::{seconds, InputMode};
use crate::transport::{Transport, TransportError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long the worker sleeps between verdict checks.
const PARK_INTERVAL: Duration = Duration::from_millis(25);

/// Nudges tolerated per stall before the silence timeout fires.
const MAX_NUDGES: u32 = 3;

/// Only this much of the combined buffer tail is scanned for the prompt.
/// Plenty for a prompt capped at 128 bytes plus trailing blanks.
const SCAN_TAIL: usize = 512;

/// One registered wait, owned by the blocked worker call.
#[derive(Debug)]
pub(crate) struct WaitJob {
    pub nudge_interval: Option<Duration>,
    pub deadline: Option<Instant>,
    pub nudges: u32,
    pub verdict: Option<WaitVerdict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitVerdict {
    /// The combined buffer ends with the active prompt.
    Prompt,
    /// No output through the full nudge protocol.
    SilenceExpired,
    /// The absolute command deadline passed.
    DeadlineExpired,
    /// The transport went away before the prompt showed up.
    Closed,
}

fn tail_of(text: &str) -> &str {
    if text.len() <= SCAN_TAIL {
        return text;
    }
    let mut start = text.len() - SCAN_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Worker side: block until the reactor reports the prompt or a timeout.
///
/// `silence` / `command` override the session defaults when given; a zero
/// value disables that timer. Returns `Ok(true)` when the prompt arrived,
/// `Ok(false)` on a timeout with `raise` unset.
pub(crate) fn wait_for_prompt(
    core: &SessionCore,
    silence: Option<f64>,
    command: Option<f64>,
    raise: bool,
) -> Result<bool, ShellError> {
    {
        let mut st = core.state.lock();
        if !st.running {
            return Err(ShellError::NotRunning);
        }
        let silence_d = match silence {
            Some(value) => seconds(value),
            None => st.options.silence(),
        };
        let command_d = match command {
            Some(value) => seconds(value),
            None => st.options.command(),
        };
        st.wait = Some(WaitJob {
            nudge_interval: silence_d.map(|d| d / 3),
            deadline: command_d.map(|d| Instant::now() + d),
            nudges: 0,
            verdict: None,
        });
    }

    let verdict = loop {
        let mut st = core.state.lock();
        if let Some(v) = st.wait.as_ref().and_then(|job| job.verdict) {
            st.wait = None;
            break v;
        }
        if !st.running || st.transport_down {
            st.wait = None;
            break WaitVerdict::Closed;
        }
        let _ = core.cond.wait_for(&mut st, PARK_INTERVAL);
    };

    match verdict {
        WaitVerdict::Prompt => {
            repair_after_match(&mut core.state.lock());
            Ok(true)
        }
        WaitVerdict::SilenceExpired => {
            if raise {
                Err(ShellError::SilenceTimeout)
            } else {
                Ok(false)
            }
        }
        WaitVerdict::DeadlineExpired => {
            if raise {
                Err(ShellError::CommandTimeout)
            } else {
                Ok(false)
            }
        }
        WaitVerdict::Closed => {
            if core.state.lock().ignore_io_error {
                debug!("transport closed during wait, ignored for teardown");
                Ok(false)
            } else {
                Err(TransportError::NotConnected.into())
            }
        }
    }
}

/// After a prompt match: guarantee the prompt sits on its own line and the
/// stdout buffer ends with a newline.
fn repair_after_match(st: &mut Shared) {
    let Shared {
        prompt, buffers, ..
    } = st;
    let current = buffers.current_mut();
    if let Some(start) = prompt.find_end(&current.combined) {
        if start > 0 && !current.combined[..start].ends_with('\n') {
            current.combined.insert(start, '\n');
        }
    }
    if !current.stdout.is_empty() && !current.stdout.ends_with('\n') {
        current.stdout.push('\n');
    }
}

/// Reactor side: evaluate the pending wait job and write one queued input
/// chunk. Called once per pump step; never holds the lock across transport
/// I/O or callbacks.
pub(crate) fn reactor_step(
    core: &SessionCore,
    transport: &mut dyn Transport,
) -> Result<(), ShellError> {
    let mut to_write: Option<Vec<u8>> = None;
    {
        let mut st = core.state.lock();
        let now = Instant::now();

        if st.wait.as_ref().is_some_and(|job| job.verdict.is_none()) {
            if st.transport_down {
                if let Some(job) = st.wait.as_mut() {
                    job.verdict = Some(WaitVerdict::Closed);
                }
                core.cond.notify_all();
            } else if st
                .prompt
                .matches_end(tail_of(&st.buffers.current().combined))
            {
                if let Some(job) = st.wait.as_mut() {
                    job.verdict = Some(WaitVerdict::Prompt);
                }
                trace!("prompt matched");
                core.cond.notify_all();
            } else {
                let last_output = st.last_output;
                let mut nudge = false;
                if let Some(job) = st.wait.as_mut() {
                    if let Some(interval) = job.nudge_interval {
                        if now.duration_since(last_output) > interval {
                            if job.nudges >= MAX_NUDGES {
                                job.verdict = Some(WaitVerdict::SilenceExpired);
                                warn!("shell silent through {MAX_NUDGES} nudges");
                                core.cond.notify_all();
                            } else {
                                job.nudges += 1;
                                nudge = true;
                            }
                        }
                    }
                    if job.verdict.is_none() {
                        if let Some(deadline) = job.deadline {
                            if now >= deadline {
                                job.verdict = Some(WaitVerdict::DeadlineExpired);
                                core.cond.notify_all();
                            }
                        }
                    }
                }
                if nudge {
                    debug!("nudging silent shell");
                    let ending = st.options.line_ending.clone();
                    st.queue.queue(&ending);
                    st.last_output = now;
                }
            }
        }

        // One chunk per step; in echo mode only when nothing is in flight.
        let gated = st.queue.mode() == InputMode::Echo && st.waiting_for_echo_of.is_some();
        if !gated {
            if let Some(chunk) = st.queue.dequeue() {
                if st.queue.mode() == InputMode::Echo {
                    st.waiting_for_echo_of = Some(chunk.clone());
                }
                to_write = Some(chunk);
            }
        }
    }

    if let Some(chunk) = to_write {
        if let Err(e) = transport.write(&chunk) {
            let ignore = core.state.lock().ignore_io_error;
            if ignore {
                debug!(error = %e, "write failed during teardown, ignored");
            } else {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_of_respects_char_boundaries() {
        let text = format!("{}é", "x".repeat(SCAN_TAIL));
        let tail = tail_of(&text);
        assert!(tail.len() <= SCAN_TAIL);
        assert!(tail.ends_with('é'));
    }

    #[test]
    fn test_tail_of_short_input() {
        assert_eq!(tail_of("short"), "short");
    }
}
