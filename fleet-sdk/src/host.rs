//! Seam over the external tooling the orchestrator drives.
//!
//! The orchestration logic (polling, deadlines, stagger, teardown) lives in
//! this crate; everything it needs from the host (the descriptor tool, the
//! emulator launcher, the control query, the bridge server, the relay
//! utility, the listening-socket inspector) goes through [`HostTools`].
//! [`SystemTools`](crate::SystemTools) is the production implementation.

use std::future::Future;
use std::net::IpAddr;

use crate::config::HardwareProfile;
use crate::descriptor::DescriptorRef;
use crate::error::Result;
use crate::process::ProcessHandle;

/// External collaborators of the fleet.
///
/// Spawning methods return as soon as the process exists; ownership of the
/// returned handle passes to the caller, which registers it immediately.
pub trait HostTools: Send + Sync + 'static {
    /// Whether a descriptor named `name` already exists.
    fn descriptor_exists(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Create descriptor `name` with `profile`.
    fn create_descriptor(
        &self,
        name: &str,
        profile: &HardwareProfile,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Start an emulator for `descriptor` on `console_port`.
    fn spawn_emulator(
        &self,
        descriptor: &DescriptorRef,
        console_port: u16,
        profile: &HardwareProfile,
    ) -> std::io::Result<ProcessHandle>;

    /// Query the boot-completion property of the instance on `console_port`.
    fn boot_completed(&self, console_port: u16) -> impl Future<Output = Result<bool>> + Send;

    /// Whether something accepts TCP connections on local `port`.
    fn is_listening(&self, port: u16) -> impl Future<Output = Result<bool>> + Send;

    /// Start a relay forwarding `bind:port` to `127.0.0.1:port`.
    fn spawn_relay(&self, bind: IpAddr, port: u16) -> std::io::Result<ProcessHandle>;

    /// Start the bridge server shared by the fleet.
    fn spawn_bridge_server(&self, port: u16) -> std::io::Result<ProcessHandle>;

    /// Terminate relay processes matched by role that were not tracked.
    fn sweep_relays(&self) -> impl Future<Output = ()> + Send;
}
