//! Per-instance launch and lifecycle bookkeeping.

use std::fmt;
use std::net::IpAddr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{HardwareProfile, SlotPlan};
use crate::descriptor::DescriptorRef;
use crate::error::{Error, Result};
use crate::host::HostTools;
use crate::registry::{HandleId, ProcessRegistry};

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle state of one fleet slot.
///
/// `Created → Launching → Booting → {Ready | BootFailed}`, then
/// `Ready → Exposed`; any state moves to `Terminated` at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Launching,
    Booting,
    Ready,
    BootFailed,
    Exposed,
    Terminated,
}

impl InstanceState {
    /// Whether moving from `self` to `next` follows the lifecycle.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Created, Launching) => true,
            (Launching, Booting) => true,
            (Booting, Ready | BootFailed) => true,
            (Ready, Exposed) => true,
            _ => false,
        }
    }

    /// Booted, whether or not it was exposed.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Exposed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Launching => "launching",
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::BootFailed => "boot_failed",
            Self::Exposed => "exposed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Stage at which an instance hit an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Provisioning,
    Launch,
    Boot,
    Exposure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: FailureStage,
    pub reason: String,
}

/// Relays forwarding one instance's ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPorts {
    pub bind: IpAddr,
    pub console_relay: HandleId,
    pub bridge_relay: HandleId,
}

/// Everything known about one fleet slot.
///
/// Process handles themselves live in the [`ProcessRegistry`]; records keep
/// the ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub index: usize,
    pub descriptor: String,
    pub console_port: u16,
    pub bridge_port: u16,
    pub state: InstanceState,
    pub process: Option<HandleId>,
    pub exposed: Option<ExposedPorts>,
    pub failure: Option<Failure>,
    /// The state the instance was in when the fleet was torn down.
    pub final_state: Option<InstanceState>,
}

impl InstanceRecord {
    pub fn new(slot: &SlotPlan) -> Self {
        Self {
            index: slot.index,
            descriptor: slot.descriptor_name.clone(),
            console_port: slot.console_port,
            bridge_port: slot.bridge_port,
            state: InstanceState::Created,
            process: None,
            exposed: None,
            failure: None,
            final_state: None,
        }
    }

    /// State before teardown, for reporting.
    pub fn settled_state(&self) -> InstanceState {
        self.final_state.unwrap_or(self.state)
    }
}

// =============================================================================
// InstanceTable
// =============================================================================

/// Shared table of instance records, one per slot.
///
/// Each stage only touches the slot it owns; `Terminated` is final so a stage
/// still running while the fleet is torn down cannot resurrect a record.
#[derive(Debug, Default)]
pub struct InstanceTable {
    records: Mutex<Vec<InstanceRecord>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the record for `slot` in state `Created`.
    pub fn insert(&self, slot: &SlotPlan) {
        let record = InstanceRecord::new(slot);
        tracing::info!(
            instance = slot.index,
            descriptor = %slot.descriptor_name,
            console_port = slot.console_port,
            bridge_port = slot.bridge_port,
            state = %record.state,
            "instance created"
        );
        self.records.lock().push(record);
    }

    /// Move slot `index` to `next`. Returns whether the transition happened.
    pub fn transition(&self, index: usize, next: InstanceState) -> bool {
        self.update(index, |record| {
            if !record.state.can_transition_to(next) {
                tracing::debug!(instance = index, from = %record.state, to = %next, "transition ignored");
                return false;
            }
            tracing::info!(
                instance = index,
                console_port = record.console_port,
                from = %record.state,
                state = %next,
                "instance state changed"
            );
            record.state = next;
            true
        })
        .unwrap_or(false)
    }

    pub fn set_process(&self, index: usize, id: HandleId) {
        self.update(index, |record| record.process = Some(id));
    }

    /// Record relays for a ready instance and mark it `Exposed`.
    pub fn mark_exposed(&self, index: usize, ports: ExposedPorts) -> bool {
        if self.transition(index, InstanceState::Exposed) {
            self.update(index, |record| record.exposed = Some(ports));
            true
        } else {
            false
        }
    }

    pub fn record_failure(&self, index: usize, stage: FailureStage, err: &Error) {
        self.update(index, |record| {
            tracing::warn!(
                instance = index,
                console_port = record.console_port,
                stage = ?stage,
                error = %err,
                "instance stage failed"
            );
            record.failure = Some(Failure {
                stage,
                reason: err.to_string(),
            });
        });
    }

    /// Mark every record `Terminated`, remembering where each one was.
    pub fn terminate_all(&self) {
        let mut records = self.records.lock();
        for record in records.iter_mut() {
            if record.state != InstanceState::Terminated {
                record.final_state = Some(record.state);
                record.state = InstanceState::Terminated;
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<InstanceRecord> {
        self.records.lock().iter().find(|r| r.index == index).cloned()
    }

    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<T>(&self, index: usize, f: impl FnOnce(&mut InstanceRecord) -> T) -> Option<T> {
        let mut records = self.records.lock();
        records.iter_mut().find(|r| r.index == index).map(f)
    }
}

// =============================================================================
// Launch
// =============================================================================

/// Build the emulator command-line arguments.
pub fn emulator_args(
    descriptor: &DescriptorRef,
    console_port: u16,
    profile: &HardwareProfile,
) -> Vec<String> {
    let mut args = vec![
        "-avd".to_owned(),
        descriptor.name().to_owned(),
        "-port".to_owned(),
        console_port.to_string(),
        "-memory".to_owned(),
        profile.memory_mb.to_string(),
        "-cores".to_owned(),
        profile.cpu_cores.to_string(),
        "-partition-size".to_owned(),
        profile.partition_size_mb.to_string(),
        "-gpu".to_owned(),
        profile.rendering_backend.clone(),
        "-skin".to_owned(),
        format!("{}x{}", profile.screen.width, profile.screen.height),
        "-no-window".to_owned(),
        "-no-audio".to_owned(),
        "-no-boot-anim".to_owned(),
        "-no-snapshot".to_owned(),
    ];

    if profile.skip_auth {
        args.push("-skip-adb-auth".to_owned());
    }

    args
}

/// Spawn the emulator for `descriptor` and register it before returning.
///
/// Success only means the process exists; readiness is the boot probe's job.
pub fn launch<H: HostTools>(
    host: &H,
    registry: &ProcessRegistry,
    descriptor: &DescriptorRef,
    console_port: u16,
    profile: &HardwareProfile,
) -> Result<HandleId> {
    let handle = host
        .spawn_emulator(descriptor, console_port, profile)
        .map_err(|source| Error::Launch {
            label: format!("emulator-{console_port}"),
            source,
        })?;
    tracing::info!(
        descriptor = %descriptor,
        console_port,
        pid = ?handle.pid(),
        "emulator spawned"
    );
    Ok(registry.register(handle))
}
