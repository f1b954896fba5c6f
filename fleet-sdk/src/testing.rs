//! In-process [`HostTools`] used by the unit tests.
//!
//! Long-running collaborators are stood in for by real `sleep`/`sh`
//! children so the registry and shutdown paths deal with genuine PIDs.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::HardwareProfile;
use crate::descriptor::DescriptorRef;
use crate::error::{Error, Result};
use crate::host::HostTools;
use crate::process::{ProcessHandle, ProcessRole};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    DescriptorExists(String),
    CreateDescriptor(String),
    SpawnEmulator { descriptor: String, console_port: u16 },
    BootQuery(u16),
    IsListening(u16),
    SpawnRelay { bind: IpAddr, port: u16 },
    SpawnBridge(u16),
    SweepRelays,
}

#[derive(Default)]
struct State {
    descriptors: HashSet<String>,
    failing_descriptors: HashSet<String>,
    failing_launches: HashSet<u16>,
    never_booting: HashSet<u16>,
    boot_after: HashMap<u16, usize>,
    boot_queries: HashMap<u16, usize>,
    never_listening: HashSet<u16>,
    dying_relays: bool,
    dying_relay_ports: HashSet<u16>,
    failing_bridge: bool,
    calls: Vec<(Instant, Call)>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptor(self, name: &str) -> Self {
        self.state.lock().descriptors.insert(name.to_owned());
        self
    }

    pub fn fail_descriptor(self, name: &str) -> Self {
        self.state.lock().failing_descriptors.insert(name.to_owned());
        self
    }

    pub fn fail_launch(self, console_port: u16) -> Self {
        self.state.lock().failing_launches.insert(console_port);
        self
    }

    pub fn never_boot(self, console_port: u16) -> Self {
        self.state.lock().never_booting.insert(console_port);
        self
    }

    /// Report boot completion only from the `queries`-th query on.
    pub fn boot_after(self, console_port: u16, queries: usize) -> Self {
        self.state.lock().boot_after.insert(console_port, queries);
        self
    }

    pub fn never_listen(self, port: u16) -> Self {
        self.state.lock().never_listening.insert(port);
        self
    }

    pub fn dying_relays(self) -> Self {
        self.state.lock().dying_relays = true;
        self
    }

    /// Relays on `port` exit right after spawn.
    pub fn dying_relay(self, port: u16) -> Self {
        self.state.lock().dying_relay_ports.insert(port);
        self
    }

    pub fn fail_bridge(self) -> Self {
        self.state.lock().failing_bridge = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|(_, c)| predicate(c)).count()
    }

    /// Position of the first call matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.state.lock().calls.iter().position(|(_, c)| predicate(c))
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push((Instant::now(), call));
    }
}

fn sleeper(role: ProcessRole, label: String) -> std::io::Result<ProcessHandle> {
    let mut command = Command::new("sleep");
    command.arg("30");
    ProcessHandle::spawn(role, label, command)
}

impl HostTools for FakeHost {
    async fn descriptor_exists(&self, name: &str) -> Result<bool> {
        self.record(Call::DescriptorExists(name.to_owned()));
        Ok(self.state.lock().descriptors.contains(name))
    }

    async fn create_descriptor(&self, name: &str, _profile: &HardwareProfile) -> Result<()> {
        self.record(Call::CreateDescriptor(name.to_owned()));
        let mut state = self.state.lock();
        if state.failing_descriptors.contains(name) {
            return Err(Error::Provisioning {
                name: name.to_owned(),
                reason: "descriptor tool exited with status 1".to_owned(),
            });
        }
        state.descriptors.insert(name.to_owned());
        Ok(())
    }

    fn spawn_emulator(
        &self,
        descriptor: &DescriptorRef,
        console_port: u16,
        _profile: &HardwareProfile,
    ) -> std::io::Result<ProcessHandle> {
        self.record(Call::SpawnEmulator {
            descriptor: descriptor.name().to_owned(),
            console_port,
        });
        if self.state.lock().failing_launches.contains(&console_port) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "emulator binary missing",
            ));
        }
        sleeper(ProcessRole::Emulator, format!("emulator-{console_port}"))
    }

    async fn boot_completed(&self, console_port: u16) -> Result<bool> {
        self.record(Call::BootQuery(console_port));
        let mut state = self.state.lock();
        if state.never_booting.contains(&console_port) {
            return Ok(false);
        }
        let queries = state.boot_queries.entry(console_port).or_insert(0);
        *queries += 1;
        let needed = state.boot_after.get(&console_port).copied().unwrap_or(1);
        Ok(state.boot_queries[&console_port] >= needed)
    }

    async fn is_listening(&self, port: u16) -> Result<bool> {
        self.record(Call::IsListening(port));
        Ok(!self.state.lock().never_listening.contains(&port))
    }

    fn spawn_relay(&self, bind: IpAddr, port: u16) -> std::io::Result<ProcessHandle> {
        self.record(Call::SpawnRelay { bind, port });
        let dies = {
            let state = self.state.lock();
            state.dying_relays || state.dying_relay_ports.contains(&port)
        };
        if dies {
            let mut command = Command::new("sh");
            command.args(["-c", "exit 1"]);
            return ProcessHandle::spawn(ProcessRole::Relay, format!("relay-{port}"), command);
        }
        sleeper(ProcessRole::Relay, format!("relay-{port}"))
    }

    fn spawn_bridge_server(&self, port: u16) -> std::io::Result<ProcessHandle> {
        self.record(Call::SpawnBridge(port));
        if self.state.lock().failing_bridge {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "bridge binary missing",
            ));
        }
        sleeper(ProcessRole::BridgeServer, format!("bridge-server-{port}"))
    }

    async fn sweep_relays(&self) {
        self.record(Call::SweepRelays);
    }
}
