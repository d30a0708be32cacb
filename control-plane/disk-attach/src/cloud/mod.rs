//! Provider agnostic disk attachment protocol.
//!
//! A provider keeps, per instance, the list of attached data disks. Every mutation re-reads the
//! list, modifies it and commits it back as a whole. Callers serialize operations on the same
//! disk through the attach/detach `KeyedLock`, operations on different disks of the same
//! instance are not serialized and the last commit wins.

/// Azure data disks.
pub mod azure;
/// OpenStack Cinder volumes.
pub mod cinder;
/// AWS elastic block store volumes.
pub mod ebs;

use crate::volume::{CachingMode, Lun, VolumeIdentity, MAX_LUNS};

use snafu::Snafu;

/// Opaque error of a provider transport.
pub type ApiError = Box<dyn std::error::Error + Send + Sync>;

/// Cloud disk client error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CloudError {
    #[snafu(display("Instance '{}' not found", instance))]
    InstanceNotFound { instance: String },
    #[snafu(display("Volume '{}' is not attached to instance '{}'", volume, instance))]
    VolumeNotFound { volume: String, instance: String },
    #[snafu(display("All {} luns of instance '{}' are in use", MAX_LUNS, instance))]
    NoFreeLun { instance: String },
    #[snafu(display("Lun {} of instance '{}' is already used by '{}'", lun, instance, occupant))]
    LunInUse {
        lun: Lun,
        instance: String,
        occupant: String,
    },
    #[snafu(display("Failed to attach '{}' to instance '{}': {}", volume, instance, source))]
    AttachFailed {
        volume: String,
        instance: String,
        source: ApiError,
    },
    #[snafu(display("Failed to detach '{}' from instance '{}': {}", volume, instance, source))]
    DetachFailed {
        volume: String,
        instance: String,
        source: ApiError,
    },
    #[snafu(display("Provider api error: {}", source))]
    Api { source: ApiError },
}

/// A disk created by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDisk {
    /// Provider name of the disk.
    pub name: String,
    /// Provider uri of the disk, when it has one.
    pub uri: String,
    /// Actual size, in GiB.
    pub size_gib: u64,
}

/// Attaches provider disks to compute instances at a given LUN.
#[async_trait::async_trait]
pub trait CloudDiskClient: Send + Sync {
    /// Attaches the disk at the given lun. Attaching an already attached disk succeeds.
    async fn attach_disk(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
        lun: Lun,
        caching: CachingMode,
    ) -> Result<(), CloudError>;
    /// Detaches the disk with the given name.
    async fn detach_disk_by_name(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<(), CloudError>;
    /// Detaches whatever disk occupies the given lun.
    async fn detach_disk_by_lun(&self, lun: Lun, instance: &str) -> Result<(), CloudError>;
    /// The lun the disk is attached at.
    async fn get_disk_lun(&self, disk: &VolumeIdentity, instance: &str)
        -> Result<Lun, CloudError>;
    /// The lowest free lun of the instance.
    async fn get_next_disk_lun(&self, instance: &str) -> Result<Lun, CloudError>;
    /// Creates a new disk.
    async fn create_volume(
        &self,
        name: &str,
        kind: &str,
        location: &str,
        size_gib: u64,
    ) -> Result<ProvisionedDisk, CloudError>;
    /// Deletes a disk.
    async fn delete_volume(&self, disk: &VolumeIdentity) -> Result<(), CloudError>;
}

/// Returns the lowest lun which is not in use.
pub fn next_free_lun(used: impl IntoIterator<Item = Lun>) -> Option<Lun> {
    let mut used_slots = [false; MAX_LUNS];
    for lun in used {
        used_slots[lun.index()] = true;
    }
    used_slots
        .iter()
        .position(|used| !used)
        .and_then(|index| Lun::new(index as u32))
}

/// Resolves the provider instance of a node.
#[async_trait::async_trait]
pub trait InstanceResolver: Send + Sync {
    /// The provider instance id of the given node, possibly as a resource path.
    async fn instance_id(&self, node_name: &str) -> Result<String, ApiError>;
}

/// Keeps the last segment of a provider resource path, ie the instance name.
pub fn trim_instance_id(instance_id: &str) -> &str {
    match instance_id.rfind('/') {
        Some(index) => &instance_id[index + 1 ..],
        None => instance_id,
    }
}

/// Read access to named secrets holding provider credentials.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// The key/value content of the secret.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<std::collections::HashMap<String, String>, ApiError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ApiError, InstanceResolver, SecretStore};
    use std::collections::HashMap;

    /// Resolves nodes to azure virtual machine resource ids of the same name.
    pub(crate) struct VmPerNode;

    #[async_trait::async_trait]
    impl InstanceResolver for VmPerNode {
        async fn instance_id(&self, node_name: &str) -> Result<String, ApiError> {
            if node_name.is_empty() {
                return Err("empty node name".into());
            }
            Ok(format!(
                "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{node_name}"
            ))
        }
    }

    /// Secrets kept in memory, by namespace and name.
    #[derive(Default)]
    pub(crate) struct InMemorySecrets {
        secrets: HashMap<(String, String), HashMap<String, String>>,
    }

    impl InMemorySecrets {
        pub(crate) fn with(mut self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
            self.secrets.insert(
                (namespace.to_string(), name.to_string()),
                data.iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            );
            self
        }
    }

    #[async_trait::async_trait]
    impl SecretStore for InMemorySecrets {
        async fn get_secret(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<HashMap<String, String>, ApiError> {
            self.secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| format!("secret {namespace}/{name} not found").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn luns(values: &[u32]) -> Vec<Lun> {
        values.iter().filter_map(|v| Lun::new(*v)).collect()
    }

    #[test]
    fn next_lun_scan() {
        assert_eq!(next_free_lun(luns(&[])), Lun::new(0));
        assert_eq!(next_free_lun(luns(&[0, 2, 5])), Lun::new(1));
        assert_eq!(next_free_lun(luns(&[1, 0])), Lun::new(2));
        assert_eq!(next_free_lun(Lun::all()), None);
        assert_eq!(next_free_lun(Lun::all().filter(|l| l.value() != 63)), Lun::new(63));
    }

    #[test]
    fn trim_instance() {
        assert_eq!(
            trim_instance_id("/subscriptions/s/resourceGroups/rg/providers/vm/node-1"),
            "node-1"
        );
        assert_eq!(trim_instance_id("node-1"), "node-1");
        assert_eq!(trim_instance_id("node-1/"), "");
    }
}
