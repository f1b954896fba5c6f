//! Fleet configuration.
//!
//! [`FleetConfig`] is built once (usually from environment variables by the
//! CLI) and never mutated afterwards. Everything the orchestrator derives per
//! instance (descriptor names and port pairs) is a pure function of it, see
//! [`FleetConfig::slots()`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Screen geometry applied to every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
    pub density: u32,
}

impl Default for ScreenGeometry {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            density: 320,
        }
    }
}

/// Fixed resource profile shared by every instance of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub memory_mb: u32,
    pub cpu_cores: u32,
    pub partition_size_mb: u32,
    pub screen: ScreenGeometry,
    /// Rendering backend passed to the emulator (`-gpu`).
    pub rendering_backend: String,
    /// Skip bridge authentication on the launched instance.
    pub skip_auth: bool,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 2,
            partition_size_mb: 2048,
            screen: ScreenGeometry::default(),
            rendering_backend: "swiftshader_indirect".to_owned(),
            skip_auth: true,
        }
    }
}

/// Immutable description of the whole fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub instance_count: usize,
    pub base_console_port: u16,
    pub base_bridge_port: u16,
    pub bridge_server_port: u16,
    pub profile: HardwareProfile,
    pub name_prefix: String,
    pub platform_version: String,
    pub abi: String,
    pub device_profile: String,
    /// Explicit system image package; derived from platform and ABI when unset.
    pub system_image_package: Option<String>,
    /// Delay inserted between successive launches.
    pub stagger: Duration,
    pub boot_timeout: Duration,
    pub boot_poll_interval: Duration,
    /// How long to wait for a port to be listening before relaying it.
    pub port_wait_timeout: Duration,
    pub port_poll_interval: Duration,
    /// How long a freshly spawned relay must stay alive.
    pub relay_settle: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            instance_count: 1,
            base_console_port: 5554,
            base_bridge_port: 5555,
            bridge_server_port: 5037,
            profile: HardwareProfile::default(),
            name_prefix: "emulator".to_owned(),
            platform_version: "30".to_owned(),
            abi: "x86_64".to_owned(),
            device_profile: "pixel".to_owned(),
            system_image_package: None,
            stagger: Duration::from_secs(30),
            boot_timeout: Duration::from_secs(300),
            boot_poll_interval: Duration::from_secs(5),
            port_wait_timeout: Duration::from_secs(60),
            port_poll_interval: Duration::from_secs(1),
            relay_settle: Duration::from_secs(1),
        }
    }
}

/// Deterministic per-slot plan derived from a [`FleetConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPlan {
    pub index: usize,
    pub descriptor_name: String,
    pub console_port: u16,
    pub bridge_port: u16,
}

impl FleetConfig {
    /// Check the configuration before anything is launched.
    pub fn validate(&self) -> Result<()> {
        if self.instance_count == 0 {
            return Err(Error::Config("instance count must be at least 1".into()));
        }
        if self.name_prefix.is_empty() {
            return Err(Error::Config("instance name prefix cannot be empty".into()));
        }
        if self.profile.memory_mb == 0 || self.profile.cpu_cores == 0 {
            return Err(Error::Config("memory and cpu cores must be greater than 0".into()));
        }
        if self.boot_poll_interval.is_zero() || self.port_poll_interval.is_zero() {
            return Err(Error::Config("poll intervals must be greater than 0".into()));
        }

        // Ports advance by two per instance; the last pair must still fit.
        let span = 2 * (self.instance_count as u64 - 1);
        for (label, base) in [
            ("console", self.base_console_port),
            ("bridge", self.base_bridge_port),
        ] {
            if u64::from(base) + span > u64::from(u16::MAX) {
                return Err(Error::Config(format!(
                    "{label} ports overflow for {} instances starting at {base}",
                    self.instance_count
                )));
            }
        }

        // Both ranges step by two, so they share a port only when the bases
        // have the same parity and lie fewer than `instance_count` steps apart.
        let base_gap = i64::from(self.base_bridge_port) - i64::from(self.base_console_port);
        if base_gap % 2 == 0 && (base_gap / 2).unsigned_abs() < self.instance_count as u64 {
            return Err(Error::Config(format!(
                "console ports from {} and bridge ports from {} overlap for {} instances",
                self.base_console_port, self.base_bridge_port, self.instance_count
            )));
        }

        let last_console = u64::from(self.base_console_port) + span;
        let last_bridge = u64::from(self.base_bridge_port) + span;
        let server = u64::from(self.bridge_server_port);
        let console_hit = server >= u64::from(self.base_console_port)
            && server <= last_console
            && (server - u64::from(self.base_console_port)) % 2 == 0;
        let bridge_hit = server >= u64::from(self.base_bridge_port)
            && server <= last_bridge
            && (server - u64::from(self.base_bridge_port)) % 2 == 0;
        if console_hit || bridge_hit {
            return Err(Error::Config(format!(
                "bridge server port {server} collides with an instance port"
            )));
        }

        Ok(())
    }

    /// Descriptor name for slot `index`.
    ///
    /// A single-instance fleet uses the bare prefix so existing descriptors
    /// are reused across runs.
    pub fn descriptor_name(&self, index: usize) -> String {
        if self.instance_count == 1 {
            self.name_prefix.clone()
        } else {
            format!("{}_{index}", self.name_prefix)
        }
    }

    pub fn console_port(&self, index: usize) -> u16 {
        self.base_console_port + 2 * index as u16
    }

    pub fn bridge_port(&self, index: usize) -> u16 {
        self.base_bridge_port + 2 * index as u16
    }

    /// Plan for every slot, in launch order.
    pub fn slots(&self) -> Vec<SlotPlan> {
        (0..self.instance_count)
            .map(|index| SlotPlan {
                index,
                descriptor_name: self.descriptor_name(index),
                console_port: self.console_port(index),
                bridge_port: self.bridge_port(index),
            })
            .collect()
    }

    /// System image package used when creating descriptors.
    pub fn system_image_package(&self) -> String {
        match &self.system_image_package {
            Some(package) => package.clone(),
            None => format!(
                "system-images;android-{};google_apis;{}",
                self.platform_version, self.abi
            ),
        }
    }
}
