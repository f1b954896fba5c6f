//! Ownership of spawned OS processes.
//!
//! Every external long-running collaborator (emulator, relay, bridge server)
//! is represented by a [`ProcessHandle`]. Handles are created by
//! [`ProcessHandle::spawn()`] and handed straight to the
//! [`ProcessRegistry`](crate::ProcessRegistry), which owns them until
//! shutdown.
//!
//! ```no_run
//! use fleet_sdk::process::{ProcessHandle, ProcessRole};
//! use tokio::process::Command;
//!
//! # async fn example() -> fleet_sdk::Result<()> {
//! let mut command = Command::new("socat");
//! command.args(["TCP-LISTEN:5554,bind=10.0.0.5,fork,reuseaddr", "TCP:127.0.0.1:5554"]);
//!
//! let mut relay = ProcessHandle::spawn(ProcessRole::Relay, "relay-5554", command)?;
//! relay.terminate()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// What a supervised process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    /// The single bridge server shared by the fleet.
    BridgeServer,
    /// One emulator instance.
    Emulator,
    /// A TCP relay exposing one port.
    Relay,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BridgeServer => write!(f, "bridge-server"),
            Self::Emulator => write!(f, "emulator"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Result of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// SIGTERM was delivered.
    Signalled,
    /// The process had already exited; nothing was sent.
    AlreadyExited,
}

// =============================================================================
// ProcessHandle
// =============================================================================

/// Owning handle to a spawned process.
///
/// Dropping a handle that was never terminated sends SIGKILL, so a handle
/// can never leak its process.
pub struct ProcessHandle {
    role: ProcessRole,
    label: String,
    child: Option<Child>,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Spawn `command` detached from the orchestrator's stdin.
    ///
    /// Returns as soon as the process exists; no readiness is implied.
    pub fn spawn(
        role: ProcessRole,
        label: impl Into<String>,
        mut command: Command,
    ) -> std::io::Result<Self> {
        command.stdin(Stdio::null());
        let child = command.spawn()?;
        Ok(Self::from_child(role, label, child))
    }

    /// Wrap an already spawned child.
    pub fn from_child(role: ProcessRole, label: impl Into<String>, child: Child) -> Self {
        let pid = child.id();
        Self {
            role,
            label: label.into(),
            child: Some(child),
            pid,
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Best-effort PID while the process is believed to be running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.pid = None;
                Some(status)
            }
            _ => None,
        }
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        self.pid.is_some() && self.try_exit_status().is_none()
    }

    /// Request termination with SIGTERM without waiting for the exit.
    ///
    /// Repeated calls, or calls on a process that already exited, return
    /// [`TerminateOutcome::AlreadyExited`].
    pub fn terminate(&mut self) -> Result<TerminateOutcome> {
        if self.try_exit_status().is_some() {
            return Ok(TerminateOutcome::AlreadyExited);
        }
        let Some(pid) = self.pid.take() else {
            return Ok(TerminateOutcome::AlreadyExited);
        };

        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc == 0 {
            return Ok(TerminateOutcome::Signalled);
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(TerminateOutcome::AlreadyExited)
        } else {
            Err(Error::Shutdown {
                label: self.label.clone(),
                source: err,
            })
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("role", &self.role)
            .field("label", &self.label)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Best-effort SIGKILL if the process is still running.
        if self.try_exit_status().is_none()
            && let Some(pid) = self.pid
        {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
