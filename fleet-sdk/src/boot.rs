//! Boot-readiness polling.

use std::time::Duration;

use tokio::time::{sleep, timeout as tokio_timeout};

use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::host::HostTools;

/// Interval and deadline of the boot probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl BootPolicy {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            poll_interval: config.boot_poll_interval,
            timeout: config.boot_timeout,
        }
    }
}

impl Default for BootPolicy {
    fn default() -> Self {
        Self::from_config(&FleetConfig::default())
    }
}

/// Poll the control channel of the instance on `console_port` until it
/// reports boot completion.
///
/// Query failures count as "not booted yet": right after launch the control
/// channel usually does not know the instance at all. Fails with
/// [`Error::BootTimeout`] once `policy.timeout` elapses.
pub async fn wait_for_boot<H: HostTools>(
    host: &H,
    console_port: u16,
    policy: BootPolicy,
) -> Result<()> {
    tokio_timeout(policy.timeout, async {
        loop {
            match host.boot_completed(console_port).await {
                Ok(true) => return,
                Ok(false) => tracing::debug!(console_port, "boot not complete yet"),
                Err(e) => tracing::debug!(console_port, error = %e, "boot query failed"),
            }
            sleep(policy.poll_interval).await;
        }
    })
    .await
    .map_err(|_| Error::BootTimeout {
        console_port,
        timeout: policy.timeout,
    })
}
