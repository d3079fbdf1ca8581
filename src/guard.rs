//! Scoped guards for re-entrancy latches.
//!
//! Every boolean latch in this crate (`InLoadPlugin`, state-update
//! notification, local-push-only, remote-call-in-flight) is flipped through
//! one of these guards so the prior value comes back on every exit path.

use std::cell::Cell;

use crate::error::{SmError, SmResult};
use crate::events::Signal;

/// Sets a boolean cell for the guard's lifetime, restoring the prior value on drop.
#[must_use = "the flag is restored as soon as the guard is dropped"]
pub struct ScopedFlag<'a> {
    cell: &'a Cell<bool>,
    previous: bool,
}

impl<'a> ScopedFlag<'a> {
    pub fn set(cell: &'a Cell<bool>, value: bool) -> Self {
        let previous = cell.replace(value);
        Self { cell, previous }
    }

    /// Value the cell held before this guard was taken.
    #[must_use]
    pub fn previous(&self) -> bool {
        self.previous
    }
}

impl Drop for ScopedFlag<'_> {
    fn drop(&mut self) {
        self.cell.set(self.previous);
    }
}

/// Progress notifications bracketing a blocking remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Prepare { call: String },
    Cleanup { call: String },
}

/// Marks a remote call as in flight. Nested entry is refused.
#[must_use = "the call is considered finished as soon as the scope is dropped"]
pub struct RemoteCallScope<'a> {
    in_call: &'a Cell<bool>,
    progress: &'a Signal<Progress>,
    call: String,
}

impl<'a> RemoteCallScope<'a> {
    /// Enter a remote call.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::ReentrantRemoteCall`] if another call is already in flight.
    pub fn enter(in_call: &'a Cell<bool>, progress: &'a Signal<Progress>, call: &str) -> SmResult<Self> {
        if in_call.get() {
            tracing::warn!(call, "session: refusing nested remote call");
            return Err(SmError::ReentrantRemoteCall(call.to_owned()));
        }
        in_call.set(true);
        let scope = Self { in_call, progress, call: call.to_owned() };
        progress.emit(&Progress::Prepare { call: scope.call.clone() });
        Ok(scope)
    }
}

impl Drop for RemoteCallScope<'_> {
    fn drop(&mut self) {
        self.progress.emit(&Progress::Cleanup { call: std::mem::take(&mut self.call) });
        self.in_call.set(false);
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
