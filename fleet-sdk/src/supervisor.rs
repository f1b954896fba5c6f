//! Fleet coordination: bring-up, serving and teardown.
//!
//! Launches are serialized with the configured stagger delay between them.
//! Once an instance is launched, its boot wait and exposure run as a
//! background task so a slow boot never holds up the next launch.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout as tokio_timeout};

use crate::boot::{BootPolicy, wait_for_boot};
use crate::config::{FleetConfig, SlotPlan};
use crate::descriptor::DescriptorStore;
use crate::error::{Error, Result};
use crate::exposure::{ExposurePolicy, expose};
use crate::host::HostTools;
use crate::instance::{FailureStage, InstanceRecord, InstanceState, InstanceTable, launch};
use crate::registry::{HandleId, ProcessRegistry, ShutdownReport};
use crate::summary::FleetSummary;

/// How often the bridge server is checked while serving.
const BRIDGE_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on the untracked-relay sweep during shutdown.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// FleetOutcome
// =============================================================================

/// Result of [`FleetSupervisor::run_until()`].
#[derive(Debug)]
pub struct FleetOutcome {
    /// Instance states as they were when the fleet was torn down.
    pub summary: FleetSummary,
    pub shutdown: ShutdownReport,
    /// Fleet-fatal error that ended the run, if any.
    pub error: Option<Error>,
}

impl FleetOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() {
            1
        } else {
            self.summary.exit_code()
        }
    }
}

// =============================================================================
// FleetSupervisor
// =============================================================================

/// Drives every configured instance through its lifecycle and owns the
/// teardown of everything spawned on the way.
pub struct FleetSupervisor<H: HostTools> {
    config: Arc<FleetConfig>,
    host: Arc<H>,
    exposure: Option<IpAddr>,
    registry: Arc<ProcessRegistry>,
    table: Arc<InstanceTable>,
    bridge: Mutex<Option<HandleId>>,
}

impl<H: HostTools> FleetSupervisor<H> {
    /// Validate `config` and prepare a supervisor.
    ///
    /// `exposure` is the resolved bind address for relays; `None` disables
    /// exposure entirely.
    pub fn new(config: FleetConfig, host: H, exposure: Option<IpAddr>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            host: Arc::new(host),
            exposure,
            registry: Arc::new(ProcessRegistry::new()),
            table: Arc::new(InstanceTable::new()),
            bridge: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Registry id of the bridge server, once started.
    pub fn bridge_server(&self) -> Option<HandleId> {
        *self.bridge.lock()
    }

    pub fn records(&self) -> Vec<InstanceRecord> {
        self.table.snapshot()
    }

    pub fn summary(&self) -> FleetSummary {
        FleetSummary::new(self.config.bridge_server_port, self.table.snapshot())
    }

    /// Start the shared bridge server and check that it stays up.
    pub async fn start_bridge_server(&self) -> Result<HandleId> {
        let port = self.config.bridge_server_port;
        let handle = self
            .host
            .spawn_bridge_server(port)
            .map_err(|e| Error::BridgeServer(format!("failed to start on port {port}: {e}")))?;
        let id = self.registry.register(handle);
        *self.bridge.lock() = Some(id);

        sleep(self.config.relay_settle).await;
        if !self.registry.is_running(id) {
            return Err(Error::BridgeServer(format!(
                "exited right after start on port {port}"
            )));
        }

        tracing::info!(port, handle = %id, "bridge server started");
        Ok(id)
    }

    /// Bring the whole fleet up and wait until every instance settled.
    ///
    /// Only a bridge-server failure is returned as an error; per-instance
    /// failures are recorded in the summary.
    pub async fn provision(&self) -> Result<FleetSummary> {
        self.start_bridge_server().await?;

        let slots = self.config.slots();
        for slot in &slots {
            self.table.insert(slot);
        }

        let pipeline = self.pipeline();
        let mut pending = JoinSet::new();
        let last = slots.len().saturating_sub(1);

        for slot in &slots {
            if !self.launch_slot(slot).await {
                continue;
            }

            let pipeline = pipeline.clone();
            let (index, console_port, bridge_port) =
                (slot.index, slot.console_port, slot.bridge_port);
            pending.spawn(async move { pipeline.run(index, console_port, bridge_port).await });

            if slots.len() > 1 && slot.index < last {
                tracing::info!(
                    instance = slot.index,
                    delay = ?self.config.stagger,
                    "staggering next launch"
                );
                sleep(self.config.stagger).await;
            }
        }

        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "instance task panicked");
            }
        }

        let summary = self.summary();
        tracing::info!(
            ready = summary.ready().count(),
            boot_failed = summary.boot_failed().count(),
            total = summary.instances.len(),
            "fleet settled"
        );
        Ok(summary)
    }

    /// Provision `slot` and spawn its emulator. Returns whether it launched.
    async fn launch_slot(&self, slot: &SlotPlan) -> bool {
        let store = DescriptorStore::new(&*self.host);
        let descriptor = match store.ensure(&slot.descriptor_name, &self.config.profile).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.table
                    .record_failure(slot.index, FailureStage::Provisioning, &e);
                return false;
            }
        };

        self.table.transition(slot.index, InstanceState::Launching);
        match launch(
            &*self.host,
            &self.registry,
            &descriptor,
            slot.console_port,
            &self.config.profile,
        ) {
            Ok(id) => {
                self.table.set_process(slot.index, id);
                self.table.transition(slot.index, InstanceState::Booting);
                true
            }
            Err(e) => {
                self.table.record_failure(slot.index, FailureStage::Launch, &e);
                false
            }
        }
    }

    /// Provision the fleet, then serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> FleetOutcome
    where
        F: Future,
    {
        self.run_until_with(shutdown, |_| {}).await
    }

    /// Like [`run_until()`](Self::run_until), calling `on_settled` once every
    /// instance reached a settled state.
    ///
    /// The bridge server is watched from the start, so its death ends the
    /// run even while instances are still provisioning. Serving also ends
    /// when no instance got as far as a running process.
    pub async fn run_until_with<F, S>(&self, shutdown: F, on_settled: S) -> FleetOutcome
    where
        F: Future,
        S: FnOnce(&FleetSummary),
    {
        let work = async {
            let summary = match self.provision().await {
                Ok(summary) => summary,
                Err(e) => return Some(e),
            };
            on_settled(&summary);

            if summary.instances.iter().all(|r| r.process.is_none()) {
                tracing::warn!("no instance is running, not serving");
                return None;
            }
            std::future::pending::<Option<Error>>().await
        };

        let error = tokio::select! {
            error = work => error,
            error = self.watch_bridge() => Some(error),
            _ = shutdown => {
                tracing::info!("termination requested");
                None
            }
        };

        if let Some(e) = &error {
            tracing::error!(error = %e, "fleet aborted");
        }

        let summary = self.summary();
        let shutdown = self.shutdown().await;
        FleetOutcome {
            summary,
            shutdown,
            error,
        }
    }

    /// Resolve once the bridge server is no longer running.
    async fn watch_bridge(&self) -> Error {
        let port = self.config.bridge_server_port;
        loop {
            sleep(BRIDGE_WATCH_INTERVAL).await;
            let Some(id) = *self.bridge.lock() else {
                continue;
            };
            if !self.registry.is_running(id) {
                return Error::BridgeServer(format!("server on port {port} exited"));
            }
        }
    }

    /// Terminate every process the fleet spawned.
    ///
    /// Safe to call any number of times and from concurrent tasks; only the
    /// first call signals processes and sweeps stray relays. Never waits for
    /// processes to exit.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.registry.shutdown();
        self.table.terminate_all();
        if report.repeated {
            return report;
        }

        if tokio_timeout(SWEEP_TIMEOUT, self.host.sweep_relays())
            .await
            .is_err()
        {
            tracing::warn!("relay sweep timed out");
        }

        tracing::info!(
            signalled = report.signalled,
            already_exited = report.already_exited,
            failed = report.failed,
            "fleet shut down"
        );
        report
    }

    fn pipeline(&self) -> Pipeline<H> {
        Pipeline {
            host: Arc::clone(&self.host),
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.table),
            exposure: self.exposure,
            boot: BootPolicy::from_config(&self.config),
            expose: ExposurePolicy::from_config(&self.config),
        }
    }
}

/// Per-instance boot wait and exposure, run off the launch loop.
struct Pipeline<H> {
    host: Arc<H>,
    registry: Arc<ProcessRegistry>,
    table: Arc<InstanceTable>,
    exposure: Option<IpAddr>,
    boot: BootPolicy,
    expose: ExposurePolicy,
}

impl<H> Clone for Pipeline<H> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.table),
            exposure: self.exposure,
            boot: self.boot,
            expose: self.expose,
        }
    }
}

impl<H: HostTools> Pipeline<H> {
    async fn run(self, index: usize, console_port: u16, bridge_port: u16) {
        if let Err(e) = wait_for_boot(&*self.host, console_port, self.boot).await {
            self.table.record_failure(index, FailureStage::Boot, &e);
            self.table.transition(index, InstanceState::BootFailed);
            return;
        }
        if !self.table.transition(index, InstanceState::Ready) {
            return;
        }

        let Some(bind) = self.exposure else {
            return;
        };
        match expose(
            &*self.host,
            &self.registry,
            console_port,
            bridge_port,
            bind,
            self.expose,
        )
        .await
        {
            Ok(ports) => {
                self.table.mark_exposed(index, ports);
            }
            // The instance stays Ready.
            Err(e) => self.table.record_failure(index, FailureStage::Exposure, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::process::ProcessRole;
    use crate::testing::{Call, FakeHost};

    const BIND: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

    fn config(count: usize) -> FleetConfig {
        FleetConfig {
            instance_count: count,
            ..FleetConfig::default()
        }
    }

    fn forever() -> impl Future<Output = ()> {
        sleep(Duration::from_secs(24 * 3600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_instance_exposed() {
        let supervisor = FleetSupervisor::new(config(1), FakeHost::new(), Some(BIND)).unwrap();

        let summary = supervisor.provision().await.unwrap();

        let record = &summary.instances[0];
        assert_eq!(record.descriptor, "emulator");
        assert_eq!(record.console_port, 5554);
        assert_eq!(record.bridge_port, 5555);
        assert_eq!(record.state, InstanceState::Exposed);
        assert_eq!(record.exposed.unwrap().bind, BIND);
        assert_eq!(supervisor.registry().count(ProcessRole::BridgeServer), 1);
        assert_eq!(supervisor.registry().count(ProcessRole::Emulator), 1);
        assert_eq!(supervisor.registry().count(ProcessRole::Relay), 2);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_instances_are_staggered() {
        let supervisor = FleetSupervisor::new(config(3), FakeHost::new(), None).unwrap();

        let summary = supervisor.provision().await.unwrap();

        let ports: Vec<_> = summary
            .instances
            .iter()
            .map(|r| (r.console_port, r.bridge_port))
            .collect();
        assert_eq!(ports, [(5554, 5555), (5556, 5557), (5558, 5559)]);
        let names: Vec<_> = summary.instances.iter().map(|r| r.descriptor.as_str()).collect();
        assert_eq!(names, ["emulator_0", "emulator_1", "emulator_2"]);

        let launches: Vec<_> = supervisor
            .host()
            .timed_calls()
            .into_iter()
            .filter(|(_, c)| matches!(c, Call::SpawnEmulator { .. }))
            .map(|(at, _)| at)
            .collect();
        assert_eq!(launches.len(), 3);
        let stagger = supervisor.config().stagger;
        for pair in launches.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= stagger && gap < stagger + Duration::from_secs(1), "gap {gap:?}");
        }

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_failure_is_isolated() {
        let host = FakeHost::new().never_boot(5556);
        let supervisor = FleetSupervisor::new(config(2), host, Some(BIND)).unwrap();

        let outcome = supervisor.run_until(sleep(Duration::from_secs(600))).await;

        let states: Vec<_> = outcome
            .summary
            .instances
            .iter()
            .map(|r| r.settled_state())
            .collect();
        assert_eq!(states, [InstanceState::Exposed, InstanceState::BootFailed]);
        assert_eq!(
            outcome.summary.instances[1].failure.as_ref().unwrap().stage,
            FailureStage::Boot
        );
        // No exposure work for the instance that never booted.
        let host = supervisor.host();
        assert_eq!(host.count(|c| *c == Call::IsListening(5556)), 0);
        assert_eq!(host.count(|c| matches!(c, Call::SpawnRelay { port: 5556, .. })), 0);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_exposure_starts_no_relays() {
        let supervisor = FleetSupervisor::new(config(2), FakeHost::new(), None).unwrap();

        let summary = supervisor.provision().await.unwrap();

        assert!(summary.instances.iter().all(|r| r.state == InstanceState::Ready));
        assert_eq!(supervisor.registry().count(ProcessRole::Relay), 0);
        assert_eq!(supervisor.host().count(|c| matches!(c, Call::SpawnRelay { .. })), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exposure_waits_for_boot() {
        let host = FakeHost::new().boot_after(5554, 4);
        let supervisor = FleetSupervisor::new(config(1), host, Some(BIND)).unwrap();

        supervisor.provision().await.unwrap();

        let host = supervisor.host();
        let last_boot_query = host
            .calls()
            .iter()
            .rposition(|c| *c == Call::BootQuery(5554))
            .unwrap();
        let first_listen = host.position(|c| matches!(c, Call::IsListening(_))).unwrap();
        assert!(last_boot_query < first_listen);
        assert_eq!(host.count(|c| *c == Call::BootQuery(5554)), 4);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exposure_failure_leaves_instance_ready() {
        let host = FakeHost::new().never_listen(5555);
        let supervisor = FleetSupervisor::new(config(1), host, Some(BIND)).unwrap();

        let summary = supervisor.provision().await.unwrap();

        let record = &summary.instances[0];
        assert_eq!(record.state, InstanceState::Ready);
        assert!(record.exposed.is_none());
        assert_eq!(record.failure.as_ref().unwrap().stage, FailureStage::Exposure);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(supervisor.registry().count(ProcessRole::Relay), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_exposed_instance_keeps_no_relay() {
        let host = FakeHost::new().dying_relay(5555);
        let supervisor = FleetSupervisor::new(config(1), host, Some(BIND)).unwrap();

        let summary = supervisor.provision().await.unwrap();

        let record = &summary.instances[0];
        assert_eq!(record.state, InstanceState::Ready);
        assert!(record.exposed.is_none());
        assert_eq!(
            supervisor
                .host()
                .count(|c| matches!(c, Call::SpawnRelay { port: 5554, .. })),
            1
        );
        assert_eq!(supervisor.registry().count(ProcessRole::Relay), 0);

        // Bridge server and emulator only.
        assert_eq!(supervisor.shutdown().await.visited(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_twice() {
        let supervisor = FleetSupervisor::new(config(2), FakeHost::new(), Some(BIND)).unwrap();
        supervisor.provision().await.unwrap();

        let first = supervisor.shutdown().await;
        let second = supervisor.shutdown().await;

        // Bridge server, two emulators, four relays.
        assert_eq!(first.visited(), 7);
        assert!(!first.repeated);
        assert!(second.repeated);
        assert_eq!(second.visited(), 0);
        assert_eq!(supervisor.host().count(|c| *c == Call::SweepRelays), 1);
        assert!(
            supervisor
                .records()
                .iter()
                .all(|r| r.state == InstanceState::Terminated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_failure_aborts_fleet() {
        let host = FakeHost::new().fail_bridge();
        let supervisor = FleetSupervisor::new(config(2), host, None).unwrap();

        let outcome = supervisor.run_until(forever()).await;

        assert!(matches!(outcome.error, Some(Error::BridgeServer(_))));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(
            supervisor.host().count(|c| matches!(c, Call::SpawnEmulator { .. })),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_booting() {
        let host = FakeHost::new().never_boot(5554);
        let supervisor = FleetSupervisor::new(config(2), host, None).unwrap();

        // Fires while instance 0 boots and instance 1 waits out the stagger.
        let outcome = supervisor.run_until(sleep(Duration::from_secs(10))).await;

        let states: Vec<_> = outcome
            .summary
            .instances
            .iter()
            .map(|r| r.settled_state())
            .collect();
        assert_eq!(states, [InstanceState::Booting, InstanceState::Created]);
        assert!(outcome.error.is_none());

        // Bridge server and emulator 0.
        assert_eq!(outcome.shutdown.visited(), 2);
        assert_eq!(outcome.shutdown.signalled, 2);
        assert!(supervisor.registry().is_empty());

        let host = supervisor.host();
        assert_eq!(host.count(|c| matches!(c, Call::SpawnEmulator { .. })), 1);
        assert!(
            supervisor
                .records()
                .iter()
                .all(|r| r.state == InstanceState::Terminated)
        );

        // The boot task was dropped with the run and polls no more.
        let queries = host.count(|c| *c == Call::BootQuery(5554));
        sleep(Duration::from_secs(60)).await;
        assert_eq!(host.count(|c| *c == Call::BootQuery(5554)), queries);
        assert_eq!(host.count(|c| matches!(c, Call::SpawnEmulator { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_death_during_provisioning() {
        let host = FakeHost::new().never_boot(5554);
        let supervisor = FleetSupervisor::new(config(2), host, None).unwrap();

        let stop_bridge = async {
            sleep(Duration::from_secs(3)).await;
            let bridge = supervisor.bridge_server().unwrap();
            assert!(supervisor.registry().terminate(bridge));
        };
        let (outcome, ()) = tokio::join!(supervisor.run_until(forever()), stop_bridge);

        assert!(matches!(outcome.error, Some(Error::BridgeServer(_))));
        assert_eq!(outcome.exit_code(), 1);
        // Noticed at the first watch tick, well before the second launch.
        assert_eq!(
            supervisor
                .host()
                .count(|c| matches!(c, Call::SpawnEmulator { .. })),
            1
        );
        assert_eq!(
            outcome.summary.instances[0].settled_state(),
            InstanceState::Booting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_failure_exit_code() {
        let host = FakeHost::new().fail_descriptor("emulator");
        let supervisor = FleetSupervisor::new(config(1), host, None).unwrap();

        let outcome = supervisor.run_until(forever()).await;

        let record = &outcome.summary.instances[0];
        assert_eq!(record.settled_state(), InstanceState::Created);
        assert_eq!(record.failure.as_ref().unwrap().stage, FailureStage::Provisioning);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_does_not_stop_fleet() {
        let host = FakeHost::new().fail_launch(5554);
        let supervisor = FleetSupervisor::new(config(2), host, None).unwrap();

        let summary = supervisor.provision().await.unwrap();

        assert_eq!(summary.instances[0].state, InstanceState::Launching);
        assert_eq!(
            summary.instances[0].failure.as_ref().unwrap().stage,
            FailureStage::Launch
        );
        assert_eq!(summary.instances[1].state, InstanceState::Ready);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(supervisor.registry().count(ProcessRole::Emulator), 1);

        // No stagger after a failed launch.
        let launches: Vec<_> = supervisor
            .host()
            .timed_calls()
            .into_iter()
            .filter(|(_, c)| matches!(c, Call::SpawnEmulator { .. }))
            .map(|(at, _)| at)
            .collect();
        assert_eq!(launches[1] - launches[0], Duration::ZERO);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_settled_runs_before_serving() {
        let supervisor = FleetSupervisor::new(config(1), FakeHost::new(), None).unwrap();
        let mut settled = None;

        let outcome = supervisor
            .run_until_with(sleep(Duration::from_secs(600)), |summary| {
                settled = Some(summary.ready().count());
            })
            .await;

        assert_eq!(settled, Some(1));
        assert_eq!(outcome.shutdown.visited(), 2);
        assert_eq!(outcome.summary.instances[0].settled_state(), InstanceState::Ready);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = FleetSupervisor::new(config(0), FakeHost::new(), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
