//! Idempotent create-or-reuse of virtual-device descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::HardwareProfile;
use crate::error::Result;
use crate::host::HostTools;

/// Reference to an existing descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorRef {
    name: String,
}

impl DescriptorRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Create-or-reuse front end over the host's descriptor tool.
pub struct DescriptorStore<'a, H> {
    host: &'a H,
}

impl<'a, H: HostTools> DescriptorStore<'a, H> {
    pub fn new(host: &'a H) -> Self {
        Self { host }
    }

    /// Return the descriptor named `name`, creating it from `profile` when
    /// it does not exist yet.
    ///
    /// An existing descriptor is returned unchanged: the profile is only
    /// applied by whoever creates it first.
    pub async fn ensure(&self, name: &str, profile: &HardwareProfile) -> Result<DescriptorRef> {
        if self.host.descriptor_exists(name).await? {
            tracing::info!(descriptor = name, "reusing existing descriptor");
            return Ok(DescriptorRef::new(name));
        }

        tracing::info!(
            descriptor = name,
            memory_mb = profile.memory_mb,
            cpu_cores = profile.cpu_cores,
            "creating descriptor"
        );
        self.host.create_descriptor(name, profile).await?;
        Ok(DescriptorRef::new(name))
    }
}
