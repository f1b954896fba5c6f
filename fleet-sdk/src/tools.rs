//! Host tooling: binary resolution and the production [`HostTools`].
//!
//! Emulator SDK binaries are located through an explicit override variable,
//! then the SDK directory layout, then `PATH`. Generic utilities (relay,
//! socket inspector, process matcher) come from `PATH`.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{FleetConfig, HardwareProfile};
use crate::descriptor::DescriptorRef;
use crate::error::{Error, Result};
use crate::host::HostTools;
use crate::instance::emulator_args;
use crate::process::{ProcessHandle, ProcessRole};

/// Extended regex the defensive relay sweep matches command lines with.
/// Covers IPv4 (`TCP-LISTEN`) and IPv6 (`TCP6-LISTEN`) relays.
pub const RELAY_SWEEP_PATTERN: &str = "socat TCP6?-LISTEN:";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for `avdmanager create avd`.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// ToolPaths
// =============================================================================

/// Resolved paths of every external binary the fleet uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPaths {
    pub emulator: PathBuf,
    pub adb: PathBuf,
    pub avdmanager: PathBuf,
    pub relay: PathBuf,
    pub socket_inspector: PathBuf,
    pub process_matcher: PathBuf,
}

struct ToolLookup {
    label: &'static str,
    binary: &'static str,
    env_override: &'static str,
    sdk_relative: &'static [&'static str],
}

const EMULATOR: ToolLookup = ToolLookup {
    label: "emulator",
    binary: "emulator",
    env_override: "FLEET_EMULATOR_BIN",
    sdk_relative: &["emulator/emulator"],
};

const ADB: ToolLookup = ToolLookup {
    label: "adb",
    binary: "adb",
    env_override: "FLEET_ADB_BIN",
    sdk_relative: &["platform-tools/adb"],
};

const AVDMANAGER: ToolLookup = ToolLookup {
    label: "avdmanager",
    binary: "avdmanager",
    env_override: "FLEET_AVDMANAGER_BIN",
    sdk_relative: &[
        "cmdline-tools/latest/bin/avdmanager",
        "tools/bin/avdmanager",
    ],
};

const RELAY: ToolLookup = ToolLookup {
    label: "socat",
    binary: "socat",
    env_override: "FLEET_RELAY_BIN",
    sdk_relative: &[],
};

const SOCKET_INSPECTOR: ToolLookup = ToolLookup {
    label: "ss",
    binary: "ss",
    env_override: "FLEET_SS_BIN",
    sdk_relative: &[],
};

const PROCESS_MATCHER: ToolLookup = ToolLookup {
    label: "pkill",
    binary: "pkill",
    env_override: "FLEET_PKILL_BIN",
    sdk_relative: &[],
};

impl ToolPaths {
    /// Resolve every tool, using `sdk_root` (or `ANDROID_SDK_ROOT` /
    /// `ANDROID_HOME`) for the SDK binaries.
    pub fn resolve(sdk_root: Option<&Path>) -> Result<Self> {
        let sdk_root = sdk_root
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("ANDROID_SDK_ROOT").map(PathBuf::from))
            .or_else(|| env::var_os("ANDROID_HOME").map(PathBuf::from));
        let sdk_root = sdk_root.as_deref();

        Ok(Self {
            emulator: resolve_tool(&EMULATOR, sdk_root)?,
            adb: resolve_tool(&ADB, sdk_root)?,
            avdmanager: resolve_tool(&AVDMANAGER, sdk_root)?,
            relay: resolve_tool(&RELAY, sdk_root)?,
            socket_inspector: resolve_tool(&SOCKET_INSPECTOR, sdk_root)?,
            process_matcher: resolve_tool(&PROCESS_MATCHER, sdk_root)?,
        })
    }
}

fn resolve_tool(lookup: &ToolLookup, sdk_root: Option<&Path>) -> Result<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(override_value) = env::var_os(lookup.env_override) {
        let override_path = PathBuf::from(override_value);
        if looks_like_path(&override_path) {
            candidates.push(override_path);
        } else if let Some(name) = override_path.to_str() {
            candidates.extend(system_candidates(name));
        }
    }

    if let Some(root) = sdk_root {
        candidates.extend(lookup.sdk_relative.iter().map(|rel| root.join(rel)));
    }
    candidates.extend(system_candidates(lookup.binary));

    let mut searched = Vec::new();
    for candidate in dedupe_paths(candidates) {
        searched.push(candidate.clone());
        if candidate.is_file() && is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(Error::ToolNotFound {
        tool: lookup.label,
        searched,
    })
}

fn looks_like_path(path: &Path) -> bool {
    path.is_absolute()
        || path.components().count() > 1
        || path.to_string_lossy().contains(std::path::MAIN_SEPARATOR)
}

fn system_candidates(binary_name: &str) -> Vec<PathBuf> {
    let name_path = PathBuf::from(binary_name);
    if looks_like_path(&name_path) {
        return vec![name_path];
    }

    let mut paths = Vec::new();
    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            paths.push(dir.join(binary_name));
        }
    }
    paths
}

fn dedupe_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut unique = Vec::new();
    for path in paths {
        if !unique.iter().any(|p: &PathBuf| p == &path) {
            unique.push(path);
        }
    }
    unique
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// =============================================================================
// SystemTools
// =============================================================================

/// [`HostTools`] backed by the emulator SDK and standard Linux utilities.
#[derive(Debug, Clone)]
pub struct SystemTools {
    paths: ToolPaths,
    avd_home: PathBuf,
    log_dir: PathBuf,
    bridge_server_port: u16,
    system_image_package: String,
    device_profile: String,
    descriptor_timeout: Duration,
}

impl SystemTools {
    pub fn new(paths: ToolPaths, config: &FleetConfig) -> Self {
        Self {
            paths,
            avd_home: default_avd_home(),
            log_dir: PathBuf::from("fleet-logs"),
            bridge_server_port: config.bridge_server_port,
            system_image_package: config.system_image_package(),
            device_profile: config.device_profile.clone(),
            descriptor_timeout: DESCRIPTOR_TIMEOUT,
        }
    }

    /// Directory holding `<name>.avd` descriptor directories.
    pub fn avd_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.avd_home = path.into();
        self
    }

    /// Directory receiving one log file per emulator.
    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_dir = path.into();
        self
    }

    /// Deadline for creating one descriptor.
    pub fn descriptor_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor_timeout = timeout;
        self
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    fn descriptor_config_path(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.avd")).join("config.ini")
    }

    fn avdmanager(&self) -> Command {
        let mut command = Command::new(&self.paths.avdmanager);
        command.env("ANDROID_AVD_HOME", &self.avd_home);
        command
    }

    fn adb(&self) -> Command {
        let mut command = Command::new(&self.paths.adb);
        command.arg("-P").arg(self.bridge_server_port.to_string());
        command
    }
}

/// `$ANDROID_AVD_HOME`, else `$HOME/.android/avd`.
pub fn default_avd_home() -> PathBuf {
    if let Some(home) = env::var_os("ANDROID_AVD_HOME") {
        return PathBuf::from(home);
    }
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".android")
        .join("avd")
}

/// Run a short-lived command and return its stdout.
async fn run_captured(mut command: Command, program: &Path) -> Result<String> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(QUERY_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} timed out", program.display()),
            )
        })??;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            program: program.display().to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Hardware keys written into a freshly created descriptor.
pub fn descriptor_overrides(profile: &HardwareProfile) -> Vec<(&'static str, String)> {
    vec![
        ("hw.ramSize", profile.memory_mb.to_string()),
        ("hw.cpu.ncore", profile.cpu_cores.to_string()),
        (
            "disk.dataPartition.size",
            format!("{}M", profile.partition_size_mb),
        ),
        ("hw.lcd.width", profile.screen.width.to_string()),
        ("hw.lcd.height", profile.screen.height.to_string()),
        ("hw.lcd.density", profile.screen.density.to_string()),
        ("hw.gpu.enabled", "yes".to_owned()),
        ("hw.gpu.mode", profile.rendering_backend.clone()),
        ("hw.keyboard", "yes".to_owned()),
    ]
}

/// Extract descriptor names from `avdmanager list avd -c` output.
pub fn parse_descriptor_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(' '))
        .map(str::to_owned)
        .collect()
}

/// Listening side of a relay bound on `bind:port`.
pub fn relay_listen_address(bind: IpAddr, port: u16) -> String {
    match bind {
        IpAddr::V4(addr) => format!("TCP-LISTEN:{port},bind={addr},fork,reuseaddr"),
        IpAddr::V6(addr) => format!("TCP6-LISTEN:{port},bind=[{addr}],fork,reuseaddr"),
    }
}

/// Whether `ss -H -ltn` output has a listener on local `port`.
pub fn listening_on(output: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    output.lines().any(|line| {
        // State Recv-Q Send-Q Local-Address:Port Peer-Address:Port
        line.split_whitespace()
            .nth(3)
            .is_some_and(|local| local.ends_with(&suffix))
    })
}

impl HostTools for SystemTools {
    async fn descriptor_exists(&self, name: &str) -> Result<bool> {
        let mut command = self.avdmanager();
        command.args(["list", "avd", "-c"]);
        let output = run_captured(command, &self.paths.avdmanager).await?;
        Ok(parse_descriptor_list(&output).iter().any(|n| n == name))
    }

    async fn create_descriptor(&self, name: &str, profile: &HardwareProfile) -> Result<()> {
        let mut child = self
            .avdmanager()
            .args(["create", "avd", "-n", name])
            .args(["-k", &self.system_image_package])
            .args(["-d", &self.device_profile])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Provisioning {
                name: name.to_owned(),
                reason: e.to_string(),
            })?;

        // Decline the interactive custom hardware profile prompt.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"no\n").await.ok();
        }

        // Dropping the timed-out future kills the child (`kill_on_drop`).
        let output = tokio::time::timeout(self.descriptor_timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Provisioning {
                name: name.to_owned(),
                reason: format!(
                    "avdmanager did not finish within {:?}",
                    self.descriptor_timeout
                ),
            })??;
        if !output.status.success() {
            return Err(Error::Provisioning {
                name: name.to_owned(),
                reason: format!(
                    "avdmanager exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let config_path = self.descriptor_config_path(name);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&config_path)
            .map_err(|e| Error::Provisioning {
                name: name.to_owned(),
                reason: format!("cannot write {}: {e}", config_path.display()),
            })?;
        for (key, value) in descriptor_overrides(profile) {
            writeln!(file, "{key}={value}")?;
        }
        Ok(())
    }

    fn spawn_emulator(
        &self,
        descriptor: &DescriptorRef,
        console_port: u16,
        profile: &HardwareProfile,
    ) -> std::io::Result<ProcessHandle> {
        fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_dir.join(format!("emulator-{console_port}.log"));
        let log = File::create(&log_path)?;

        let mut command = Command::new(&self.paths.emulator);
        command
            .env("ANDROID_AVD_HOME", &self.avd_home)
            .args(emulator_args(descriptor, console_port, profile))
            .stdout(log.try_clone()?)
            .stderr(log);

        tracing::debug!(descriptor = %descriptor, log = %log_path.display(), "emulator output redirected");
        ProcessHandle::spawn(
            ProcessRole::Emulator,
            format!("emulator-{console_port}"),
            command,
        )
    }

    async fn boot_completed(&self, console_port: u16) -> Result<bool> {
        let mut command = self.adb();
        command
            .arg("-s")
            .arg(format!("emulator-{console_port}"))
            .args(["shell", "getprop", "sys.boot_completed"]);
        let output = run_captured(command, &self.paths.adb).await?;
        Ok(output.trim() == "1")
    }

    async fn is_listening(&self, port: u16) -> Result<bool> {
        let mut command = Command::new(&self.paths.socket_inspector);
        command.args(["-H", "-ltn"]);
        let output = run_captured(command, &self.paths.socket_inspector).await?;
        Ok(listening_on(&output, port))
    }

    fn spawn_relay(&self, bind: IpAddr, port: u16) -> std::io::Result<ProcessHandle> {
        let mut command = Command::new(&self.paths.relay);
        command
            .arg(relay_listen_address(bind, port))
            .arg(format!("TCP:127.0.0.1:{port}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        ProcessHandle::spawn(ProcessRole::Relay, format!("relay-{bind}:{port}"), command)
    }

    fn spawn_bridge_server(&self, port: u16) -> std::io::Result<ProcessHandle> {
        let mut command = Command::new(&self.paths.adb);
        command
            .args(["-a", "-P", &port.to_string(), "server", "nodaemon"])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        ProcessHandle::spawn(
            ProcessRole::BridgeServer,
            format!("bridge-server-{port}"),
            command,
        )
    }

    async fn sweep_relays(&self) {
        let mut command = Command::new(&self.paths.process_matcher);
        command.args(["-f", RELAY_SWEEP_PATTERN]);
        // pkill exits 1 when nothing matched.
        match run_captured(command, &self.paths.process_matcher).await {
            Ok(_) => tracing::info!("swept untracked relay processes"),
            Err(Error::CommandFailed { status, .. }) if status.code() == Some(1) => {}
            Err(e) => tracing::warn!(error = %e, "relay sweep failed"),
        }
    }
}
