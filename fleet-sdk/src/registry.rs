//! Append-only registry of every process the fleet spawned.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::process::{ProcessHandle, ProcessRole, TerminateOutcome};

/// Opaque reference to a handle owned by a [`ProcessRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tally produced by [`ProcessRegistry::shutdown()`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Handles that received a termination request.
    pub signalled: usize,
    /// Handles whose process had already exited.
    pub already_exited: usize,
    /// Handles whose termination request failed.
    pub failed: usize,
    /// Set when the registry had already been shut down.
    pub repeated: bool,
}

impl ShutdownReport {
    pub fn visited(&self) -> usize {
        self.signalled + self.already_exited + self.failed
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<(HandleId, ProcessHandle)>,
    next_id: u64,
    closed: bool,
}

/// Concurrency-safe, append-only collection of process handles.
///
/// Every handle ever registered is visited exactly once by
/// [`shutdown()`](Self::shutdown). Handles registered after shutdown has
/// started are terminated on the spot, so an in-flight stage racing the
/// teardown cannot leak a process.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle`.
    pub fn register(&self, handle: ProcessHandle) -> HandleId {
        let mut inner = self.inner.lock();
        let id = HandleId(inner.next_id);
        inner.next_id += 1;

        if inner.closed {
            drop(inner);
            let mut handle = handle;
            tracing::warn!(
                handle = %id,
                role = %handle.role(),
                label = handle.label(),
                "registered after shutdown, terminating immediately"
            );
            terminate_logged(id, &mut handle);
            return id;
        }

        tracing::debug!(handle = %id, role = %handle.role(), pid = ?handle.pid(), label = handle.label(), "process registered");
        inner.entries.push((id, handle));
        id
    }

    /// Whether the process behind `id` is still running.
    ///
    /// Unknown ids (including everything after shutdown) report `false`.
    pub fn is_running(&self, id: HandleId) -> bool {
        let mut inner = self.inner.lock();
        inner
            .entries
            .iter_mut()
            .find(|(entry_id, _)| *entry_id == id)
            .is_some_and(|(_, handle)| handle.is_running())
    }

    /// Number of handles currently owned.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of owned handles with the given role.
    pub fn count(&self, role: ProcessRole) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, handle)| handle.role() == role)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Terminate one handle ahead of fleet shutdown.
    ///
    /// The handle leaves the registry, so [`shutdown()`](Self::shutdown)
    /// will not visit it again. Returns `false` for unknown ids.
    pub fn terminate(&self, id: HandleId) -> bool {
        let handle = {
            let mut inner = self.inner.lock();
            match inner.entries.iter().position(|(entry_id, _)| *entry_id == id) {
                Some(pos) => inner.entries.remove(pos).1,
                None => return false,
            }
        };

        let mut handle = handle;
        terminate_logged(id, &mut handle);
        true
    }

    /// Terminate every registered handle exactly once.
    ///
    /// Issues termination requests only; never waits for processes to exit.
    /// Calling it again is harmless and returns a report with `repeated` set.
    pub fn shutdown(&self) -> ShutdownReport {
        let entries = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return ShutdownReport {
                    repeated: true,
                    ..ShutdownReport::default()
                };
            }
            inner.closed = true;
            std::mem::take(&mut inner.entries)
        };

        let mut report = ShutdownReport::default();
        for (id, mut handle) in entries {
            match terminate_logged(id, &mut handle) {
                Some(TerminateOutcome::Signalled) => report.signalled += 1,
                Some(TerminateOutcome::AlreadyExited) => report.already_exited += 1,
                None => report.failed += 1,
            }
        }
        report
    }
}

fn terminate_logged(id: HandleId, handle: &mut ProcessHandle) -> Option<TerminateOutcome> {
    match handle.terminate() {
        Ok(outcome) => {
            tracing::info!(handle = %id, role = %handle.role(), label = handle.label(), ?outcome, "process terminated");
            Some(outcome)
        }
        Err(e) => {
            tracing::error!(handle = %id, role = %handle.role(), label = handle.label(), error = %e, "termination request failed");
            None
        }
    }
}
