//! Forwarding instance ports to the outside network.
//!
//! Exposure happens per instance, only after its boot probe succeeded, and
//! only when the host has an externally reachable address. Boot completion
//! does not mean the console and bridge sockets are bound, so each port is
//! first polled in the local listening-socket table before its relay starts.

use std::fmt;
use std::net::{IpAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;

use tokio::time::{sleep, timeout as tokio_timeout};

use crate::config::FleetConfig;
use crate::error::{Error, ExposureError, Result};
use crate::host::HostTools;
use crate::instance::ExposedPorts;
use crate::registry::{HandleId, ProcessRegistry};

// =============================================================================
// Address selection
// =============================================================================

/// How the externally reachable bind address is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExposureMode {
    /// Use the host's outbound interface address if it is not loopback.
    #[default]
    Auto,
    /// Never expose.
    Disabled,
    /// Bind relays on this address.
    Address(IpAddr),
}

impl FromStr for ExposureMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "off" | "no" | "false" | "0" | "disabled" => Ok(Self::Disabled),
            other => other
                .parse::<IpAddr>()
                .map(Self::Address)
                .map_err(|_| Error::Config(format!("invalid exposure mode `{s}`"))),
        }
    }
}

impl fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Disabled => write!(f, "off"),
            Self::Address(addr) => write!(f, "{addr}"),
        }
    }
}

impl ExposureMode {
    /// Resolve to the bind address, or `None` when exposure is disabled.
    pub fn resolve(self) -> Option<IpAddr> {
        match self {
            Self::Auto => detect_external_address(),
            Self::Disabled => None,
            Self::Address(addr) => is_externally_reachable(addr).then_some(addr),
        }
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel which
/// source address it would route from.
pub fn detect_external_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let addr = socket.local_addr().ok()?.ip();
    is_externally_reachable(addr).then_some(addr)
}

fn is_externally_reachable(addr: IpAddr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}

// =============================================================================
// Relays
// =============================================================================

/// Timing of the pre-relay port wait and the relay liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposurePolicy {
    pub port_timeout: Duration,
    pub port_poll_interval: Duration,
    pub relay_settle: Duration,
}

impl ExposurePolicy {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            port_timeout: config.port_wait_timeout,
            port_poll_interval: config.port_poll_interval,
            relay_settle: config.relay_settle,
        }
    }
}

impl Default for ExposurePolicy {
    fn default() -> Self {
        Self::from_config(&FleetConfig::default())
    }
}

/// Wait until local `port` accepts connections.
pub async fn wait_for_listening<H: HostTools>(
    host: &H,
    port: u16,
    policy: ExposurePolicy,
) -> Result<()> {
    tokio_timeout(policy.port_timeout, async {
        loop {
            match host.is_listening(port).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => tracing::debug!(port, error = %e, "listening-socket query failed"),
            }
            sleep(policy.port_poll_interval).await;
        }
    })
    .await
    .map_err(|_| {
        ExposureError::PortNotListening {
            port,
            waited: policy.port_timeout,
        }
        .into()
    })
}

/// Forward `bind:console_port` and `bind:bridge_port` to localhost.
///
/// Both ports must be listening before either relay starts. On failure no
/// relay for this instance is left running.
pub async fn expose<H: HostTools>(
    host: &H,
    registry: &ProcessRegistry,
    console_port: u16,
    bridge_port: u16,
    bind: IpAddr,
    policy: ExposurePolicy,
) -> Result<ExposedPorts> {
    wait_for_listening(host, console_port, policy).await?;
    wait_for_listening(host, bridge_port, policy).await?;

    let console_relay = start_relay(host, registry, bind, console_port, policy).await?;
    let bridge_relay = match start_relay(host, registry, bind, bridge_port, policy).await {
        Ok(id) => id,
        Err(e) => {
            registry.terminate(console_relay);
            return Err(e);
        }
    };

    tracing::info!(%bind, console_port, bridge_port, "instance ports exposed");
    Ok(ExposedPorts {
        bind,
        console_relay,
        bridge_relay,
    })
}

/// Spawn and register one relay, then check it survived the settle time.
async fn start_relay<H: HostTools>(
    host: &H,
    registry: &ProcessRegistry,
    bind: IpAddr,
    port: u16,
    policy: ExposurePolicy,
) -> Result<HandleId> {
    let handle = host
        .spawn_relay(bind, port)
        .map_err(|source| ExposureError::RelaySpawn { port, source })?;
    let id = registry.register(handle);

    sleep(policy.relay_settle).await;
    if !registry.is_running(id) {
        registry.terminate(id);
        return Err(ExposureError::RelayExited { port }.into());
    }

    tracing::debug!(%bind, port, handle = %id, "relay running");
    Ok(id)
}
