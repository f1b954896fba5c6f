//! Lifecycle orchestration for fleets of emulated device instances.
//!
//! A fleet is N instances of one emulated device, each with its own
//! descriptor, console port and bridge port. The [`FleetSupervisor`] creates
//! missing descriptors, launches the instances with a stagger delay, waits
//! for each to report boot completion, optionally forwards their ports to an
//! externally reachable address, and tears every spawned process down
//! exactly once when asked to stop.
//!
//! All host interaction goes through the [`HostTools`] trait;
//! [`SystemTools`] drives the real emulator SDK binaries.
//!
//! # Quick Start
//!
//! ```no_run
//! use fleet_sdk::{ExposureMode, FleetConfig, FleetSupervisor, SystemTools, ToolPaths};
//!
//! # async fn example() -> fleet_sdk::Result<()> {
//! let config = FleetConfig {
//!     instance_count: 3,
//!     ..FleetConfig::default()
//! };
//! let tools = SystemTools::new(ToolPaths::resolve(None)?, &config).log_dir("/var/log/fleet");
//! let supervisor = FleetSupervisor::new(config, tools, ExposureMode::Auto.resolve())?;
//!
//! let outcome = supervisor
//!     .run_until_with(tokio::signal::ctrl_c(), |summary| {
//!         for line in summary.render_lines() {
//!             println!("{line}");
//!         }
//!     })
//!     .await;
//! std::process::exit(outcome.exit_code());
//! # }
//! ```

pub mod boot;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod exposure;
pub mod host;
pub mod instance;
pub mod process;
pub mod registry;
pub mod summary;
pub mod supervisor;
pub mod tools;

#[cfg(test)]
mod testing;

pub use boot::{BootPolicy, wait_for_boot};
pub use config::{FleetConfig, HardwareProfile, ScreenGeometry, SlotPlan};
pub use descriptor::{DescriptorRef, DescriptorStore};
pub use error::{Error, ExposureError, Result};
pub use exposure::{ExposureMode, ExposurePolicy, detect_external_address, expose};
pub use host::HostTools;
pub use instance::{
    ExposedPorts, Failure, FailureStage, InstanceRecord, InstanceState, InstanceTable, launch,
};
pub use process::{ProcessHandle, ProcessRole, TerminateOutcome};
pub use registry::{HandleId, ProcessRegistry, ShutdownReport};
pub use summary::FleetSummary;
pub use supervisor::{FleetOutcome, FleetSupervisor};
pub use tools::{SystemTools, ToolPaths};
