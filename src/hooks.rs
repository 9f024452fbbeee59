//! Hook registry.
//!
//! Each hook name owns an ordered list of callbacks. Lists are flattened at
//! session construction — engine defaults first, then the dialect's
//! contributions, then user registrations — and iterated in insertion
//! order. A callback returning [`HookFlow::Break`] stops the iteration and
//! marks the event handled.

use crate::assembler::StreamKind;
use crate::error::ShellError;
use crate::session::SessionCtl;
use std::collections::HashMap;

/// The defined hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    OnDebug,
    OnBeforeRun,
    OnAfterRun,
    OnInit,
    OnException,
    BeforeInit,
    AfterInit,
    BeforeTerm,
    AfterTerm,
}

/// What a callback tells the iterator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    /// Keep iterating.
    Continue,
    /// Stop; the event is handled.
    Break,
}

/// Payload delivered alongside the session control handle.
pub enum HookEvent<'a> {
    /// Plain lifecycle notification.
    Lifecycle,
    /// A cleaned output chunk, mirrored from the assembler.
    Debug { chunk: &'a str, kind: StreamKind },
    /// An error unwinding out of the worker strand.
    Exception { error: &'a ShellError },
}

type HookFn =
    Box<dyn Fn(&SessionCtl, &HookEvent<'_>) -> Result<HookFlow, ShellError> + Send + Sync>;

/// Ordered callback lists keyed by hook name.
#[derive(Default)]
pub struct Hooks {
    table: HashMap<HookName, Vec<HookFn>>,
}

impl Hooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to a hook's list.
    pub fn add<F>(&mut self, name: HookName, callback: F)
    where
        F: Fn(&SessionCtl, &HookEvent<'_>) -> Result<HookFlow, ShellError>
            + Send
            + Sync
            + 'static,
    {
        self.table.entry(name).or_default().push(Box::new(callback));
    }

    /// Number of callbacks registered for a hook.
    #[must_use]
    pub fn len(&self, name: HookName) -> usize {
        self.table.get(&name).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self, name: HookName) -> bool {
        self.len(name) == 0
    }

    /// Run a hook chain. Returns `Ok(true)` when a callback broke the chain
    /// (the event is handled), `Ok(false)` when every callback continued.
    pub fn run(
        &self,
        name: HookName,
        ctl: &SessionCtl,
        event: &HookEvent<'_>,
    ) -> Result<bool, ShellError> {
        if let Some(chain) = self.table.get(&name) {
            for callback in chain {
                if callback(ctl, event)? == HookFlow::Break {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Run a hook chain for a plain lifecycle notification, ignoring the
    /// handled flag.
    pub fn run_lifecycle(&self, name: HookName, ctl: &SessionCtl) -> Result<(), ShellError> {
        self.run(name, ctl, &HookEvent::Lifecycle).map(|_| ())
    }
}
