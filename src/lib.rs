//! Provision and supervise a fleet of emulated device instances on one host.
//!
//! This crate re-exports the orchestration SDK:
//!
//! - [`sdk`]: Fleet Lifecycle Orchestrator (descriptors, launch, boot
//!   readiness, network exposure, aggregate shutdown)
//!
//! # Quick Start
//!
//! ```no_run
//! use emufleet::sdk::{FleetConfig, FleetSupervisor, SystemTools, ToolPaths};
//!
//! # async fn example() -> emufleet::sdk::Result<()> {
//! let config = FleetConfig {
//!     instance_count: 2,
//!     ..FleetConfig::default()
//! };
//! let tools = SystemTools::new(ToolPaths::resolve(None)?, &config);
//! let supervisor = FleetSupervisor::new(config, tools, None)?;
//!
//! let outcome = supervisor.run_until(tokio::signal::ctrl_c()).await;
//! println!("exit code: {}", outcome.exit_code());
//! # Ok(())
//! # }
//! ```

/// Fleet Lifecycle Orchestrator.
///
/// This module provides:
/// - [`sdk::FleetConfig`]: Immutable fleet configuration
/// - [`sdk::FleetSupervisor`]: Top-level coordinator with `run_until()`/`shutdown()`
/// - [`sdk::ProcessRegistry`]: Registry of every spawned process handle
/// - [`sdk::HostTools`]: Seam over the external emulator tooling
pub use fleet_sdk as sdk;
