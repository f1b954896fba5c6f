//! Aggregate fleet status, as printed at the end of provisioning and
//! written to `SUMMARY_JSON`.

use std::net::IpAddr;

use serde::Serialize;

use crate::instance::{FailureStage, InstanceRecord, InstanceState};

/// Snapshot of every instance in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub bridge_server_port: u16,
    pub instances: Vec<InstanceRecord>,
}

impl FleetSummary {
    pub fn new(bridge_server_port: u16, instances: Vec<InstanceRecord>) -> Self {
        Self {
            bridge_server_port,
            instances,
        }
    }

    /// Instances that booted, exposed or not.
    pub fn ready(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances
            .iter()
            .filter(|r| r.settled_state().is_ready())
    }

    pub fn boot_failed(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances
            .iter()
            .filter(|r| r.settled_state() == InstanceState::BootFailed)
    }

    /// `(bind, console_port, bridge_port)` of every exposed instance.
    pub fn exposed_addresses(&self) -> Vec<(IpAddr, u16, u16)> {
        self.instances
            .iter()
            .filter_map(|r| r.exposed.map(|e| (e.bind, r.console_port, r.bridge_port)))
            .collect()
    }

    /// Whether any instance failed to provision or launch.
    pub fn has_launch_failure(&self) -> bool {
        self.instances.iter().any(|r| {
            r.failure.as_ref().is_some_and(|f| {
                matches!(f.stage, FailureStage::Provisioning | FailureStage::Launch)
            })
        })
    }

    /// Process exit status for this fleet.
    ///
    /// Non-zero only when provisioning or launch failed and no instance
    /// became ready.
    pub fn exit_code(&self) -> i32 {
        if self.has_launch_failure() && self.ready().next().is_none() {
            1
        } else {
            0
        }
    }

    /// Human-readable status, one line per instance plus exposed addresses.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.instances.len() + 2);
        for record in &self.instances {
            let mut line = format!(
                "instance={} descriptor={} console_port={} bridge_port={} state={}",
                record.index,
                record.descriptor,
                record.console_port,
                record.bridge_port,
                record.settled_state()
            );
            if let Some(failure) = &record.failure {
                line.push_str(&format!(" failure={:?}", failure.reason));
            }
            lines.push(line);
        }

        lines.push(format!(
            "ready={} boot_failed={} total={}",
            self.ready().count(),
            self.boot_failed().count(),
            self.instances.len()
        ));

        for (bind, console, bridge) in self.exposed_addresses() {
            lines.push(format!("exposed console={bind}:{console} bridge={bind}:{bridge}"));
        }
        lines
    }
}
