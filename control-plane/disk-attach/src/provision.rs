//! Dynamic provisioning and deletion of cloud disks backing persistent volumes.
use crate::{
    cloud::CloudDiskClient,
    error::Cloud,
    filesystem::FileSystem,
    volume::{CloudDisk, VolumeIdentity},
    Error,
};

use snafu::ResultExt;
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

/// Annotation recording who created a persistent volume.
pub const CREATED_BY_ANNOTATION: &str = "kubernetes.io/createdby";
/// Value of the `CREATED_BY_ANNOTATION` for disks created here.
pub const CREATED_BY: &str = "azure-disk-dynamic-provisioner";

const GIB: u64 = 1024 * 1024 * 1024;

/// Parameters of a provisioning request.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// Name of the cluster, prefixed to the disk name.
    pub cluster_name: String,
    /// Name of the persistent volume to create.
    pub pv_name: String,
    /// Requested capacity, in bytes.
    pub capacity_bytes: u64,
    /// Storage account type, `utils::DEFAULT_AZURE_DISK_KIND` if not set.
    pub kind: Option<String>,
    /// Location, `utils::DEFAULT_AZURE_LOCATION` if not set.
    pub location: Option<String>,
}

/// A persistent volume backed by a newly created disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVolume {
    /// Name of the persistent volume.
    pub pv_name: String,
    /// The created disk.
    pub disk: CloudDisk,
    /// Capacity of the disk, in GiB.
    pub capacity_gib: u64,
    /// Annotations of the persistent volume.
    pub annotations: BTreeMap<String, String>,
}

impl ProvisionedVolume {
    /// The capacity as a quantity string, eg: `5Gi`.
    pub fn capacity(&self) -> String {
        format!("{}Gi", self.capacity_gib)
    }
}

/// Generates a disk name of at most `max_len` characters, `<cluster>-dynamic-<pv name>`.
/// The cluster prefix is truncated first, the pv name is always kept whole.
pub fn generate_volume_name(cluster_name: &str, pv_name: &str, max_len: usize) -> String {
    let prefix = format!("{cluster_name}-dynamic");
    let budget = max_len.saturating_sub(pv_name.chars().count() + 1);
    let prefix = prefix.chars().take(budget).collect::<String>();
    format!("{prefix}-{pv_name}")
}

/// Rounds a size in bytes up to whole GiB.
pub fn round_up_gib(bytes: u64) -> u64 {
    bytes / GIB + u64::from(bytes % GIB != 0)
}

/// Creates and deletes the disks backing persistent volumes.
pub struct DiskProvisioner {
    client: Arc<dyn CloudDiskClient>,
}

impl DiskProvisioner {
    /// Returns a new provisioner creating disks through the client.
    pub fn new(client: Arc<dyn CloudDiskClient>) -> Self {
        Self { client }
    }

    /// Creates a disk for the requested persistent volume.
    pub async fn provision(&self, options: &ProvisionOptions) -> Result<ProvisionedVolume, Error> {
        let name = generate_volume_name(
            &options.cluster_name,
            &options.pv_name,
            utils::MAX_VOLUME_NAME_LEN,
        );
        let size_gib = round_up_gib(options.capacity_bytes);
        let kind = options
            .kind
            .as_deref()
            .unwrap_or(utils::DEFAULT_AZURE_DISK_KIND);
        let location = options
            .location
            .as_deref()
            .unwrap_or(utils::DEFAULT_AZURE_LOCATION);

        let created = self
            .client
            .create_volume(&name, kind, location, size_gib)
            .await
            .context(Cloud {
                operation: "create",
                volume: &name,
            })?;
        info!(
            volume.name = %created.name,
            volume.uri = %created.uri,
            size_gib = created.size_gib,
            "Volume created"
        );

        let mut disk = CloudDisk::new(VolumeIdentity::with_uri(created.name, created.uri));
        disk.fs_type = FileSystem::Ext4;
        Ok(ProvisionedVolume {
            pv_name: options.pv_name.clone(),
            disk,
            capacity_gib: created.size_gib,
            annotations: BTreeMap::from([(
                CREATED_BY_ANNOTATION.to_string(),
                CREATED_BY.to_string(),
            )]),
        })
    }

    /// Deletes the disk backing a persistent volume.
    pub async fn delete(&self, identity: &VolumeIdentity) -> Result<(), Error> {
        self.client
            .delete_volume(identity)
            .await
            .context(Cloud {
                operation: "delete",
                volume: identity.name(),
            })?;
        info!(volume.name = identity.name(), "Volume deleted");
        Ok(())
    }
}
