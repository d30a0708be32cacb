//! The volume plugins and the capability set of those which attach a device to the node.
use crate::{
    attacher::DiskAttacher,
    azure_file::AzureFileService,
    detacher::DiskDetacher,
    error::{InvalidGlobalPath, InvalidSource, NotAttachable, ProviderNotConfigured},
    volume::{CloudDisk, VolumeIdentity, VolumeSource},
    Error,
};

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// The supported volume plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum PluginKind {
    AzureDisk,
    AwsEbs,
    Cinder,
    Iscsi,
    Glusterfs,
    AzureFile,
}

impl PluginKind {
    /// The qualified plugin name, eg: `kubernetes.io/azure-disk`.
    pub fn plugin_name(&self) -> String {
        utils::plugin_name(self.as_ref())
    }
    /// Whether the plugin attaches a device to the node before mounting it.
    pub fn is_attachable(&self) -> bool {
        !matches!(self, Self::Glusterfs | Self::AzureFile)
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Operations of a plugin whose volumes are attached to the node as block devices, mounted
/// once at a node global path and then bind mounted into the pods.
#[async_trait::async_trait]
pub trait AttachableVolume: Send + Sync {
    /// Attaches the volume to the node, returning a token which `wait_for_attach` resolves.
    async fn attach(&self, source: &VolumeSource, node_name: &str) -> Result<String, Error>;
    /// Waits for the attached device to show up, returning its path.
    async fn wait_for_attach(
        &self,
        source: &VolumeSource,
        token: &str,
        timeout: Duration,
    ) -> Result<PathBuf, Error>;
    /// The node global path the device is mounted at.
    fn device_mount_path(&self, source: &VolumeSource) -> Result<PathBuf, Error>;
    /// Formats the device if needed and mounts it at the global path.
    async fn mount_device(
        &self,
        source: &VolumeSource,
        device: &Path,
        global_path: &Path,
    ) -> Result<(), Error>;
    /// Recovers the volume identity from its global mount path.
    fn identity_from_global_path(&self, global_path: &Path) -> Result<VolumeIdentity, Error>;
    /// Unmounts the global path and removes it.
    async fn unmount_device(&self, global_path: &Path) -> Result<(), Error>;
    /// Detaches the volume from the node.
    async fn detach(&self, identity: &VolumeIdentity, node_name: &str) -> Result<(), Error>;
    /// Waits for the detached device to go away.
    async fn wait_for_detach(&self, device: &Path, timeout: Duration) -> Result<(), Error>;
}

/// A cloud provider disk plugin, attaching through the provider's compute api.
pub struct CloudDiskPlugin {
    kind: PluginKind,
    attacher: DiskAttacher,
    detacher: DiskDetacher,
}

impl CloudDiskPlugin {
    /// Returns a new plugin of the given kind.
    pub fn new(kind: PluginKind, attacher: DiskAttacher, detacher: DiskDetacher) -> Self {
        Self {
            kind,
            attacher,
            detacher,
        }
    }

    fn disk<'a>(&self, source: &'a VolumeSource) -> Result<&'a CloudDisk, Error> {
        match source.cloud_disk() {
            Some(disk) if source.kind() == self.kind => Ok(disk),
            _ => InvalidSource {
                details: format!("{} plugin cannot handle a {} volume", self.kind, source.kind()),
            }
            .fail(),
        }
    }
}

#[async_trait::async_trait]
impl AttachableVolume for CloudDiskPlugin {
    async fn attach(&self, source: &VolumeSource, node_name: &str) -> Result<String, Error> {
        self.attacher.attach(self.disk(source)?, node_name).await
    }

    async fn wait_for_attach(
        &self,
        source: &VolumeSource,
        token: &str,
        timeout: Duration,
    ) -> Result<PathBuf, Error> {
        self.attacher
            .wait_for_attach(self.disk(source)?, token, timeout)
            .await
    }

    fn device_mount_path(&self, source: &VolumeSource) -> Result<PathBuf, Error> {
        Ok(self.attacher.device_mount_path(self.disk(source)?))
    }

    async fn mount_device(
        &self,
        source: &VolumeSource,
        device: &Path,
        global_path: &Path,
    ) -> Result<(), Error> {
        self.attacher
            .mount_device(self.disk(source)?, device, global_path)
            .await
    }

    fn identity_from_global_path(&self, global_path: &Path) -> Result<VolumeIdentity, Error> {
        match global_path.file_name() {
            Some(name) => Ok(VolumeIdentity::new(name.to_string_lossy())),
            None => InvalidGlobalPath {
                plugin: self.kind.plugin_name(),
                path: global_path.to_path_buf(),
            }
            .fail(),
        }
    }

    async fn unmount_device(&self, global_path: &Path) -> Result<(), Error> {
        self.detacher.unmount_device(global_path).await
    }

    async fn detach(&self, identity: &VolumeIdentity, node_name: &str) -> Result<(), Error> {
        self.detacher.detach(identity, node_name).await
    }

    async fn wait_for_detach(&self, device: &Path, timeout: Duration) -> Result<(), Error> {
        self.detacher.wait_for_detach(device, timeout).await
    }
}

/// The attachable plugins configured on this node.
/// A plugin whose provider is not configured is simply absent.
#[derive(Default, Clone)]
pub struct VolumePlugins {
    pub azure_disk: Option<Arc<dyn AttachableVolume>>,
    pub aws_ebs: Option<Arc<dyn AttachableVolume>>,
    pub cinder: Option<Arc<dyn AttachableVolume>>,
    pub iscsi: Option<Arc<dyn AttachableVolume>>,
    pub azure_file: Option<Arc<AzureFileService>>,
}

impl VolumePlugins {
    /// The attachable plugin of the given kind.
    pub fn attachable(&self, kind: PluginKind) -> Result<Arc<dyn AttachableVolume>, Error> {
        let plugin = match kind {
            PluginKind::AzureDisk => &self.azure_disk,
            PluginKind::AwsEbs => &self.aws_ebs,
            PluginKind::Cinder => &self.cinder,
            PluginKind::Iscsi => &self.iscsi,
            PluginKind::Glusterfs | PluginKind::AzureFile => {
                return NotAttachable {
                    plugin: kind.plugin_name(),
                }
                .fail()
            }
        };
        plugin.clone().ok_or_else(|| {
            ProviderNotConfigured {
                plugin: kind.plugin_name(),
            }
            .build()
        })
    }

    /// The azure file share service.
    pub fn azure_file(&self) -> Result<Arc<AzureFileService>, Error> {
        self.azure_file.clone().ok_or_else(|| {
            ProviderNotConfigured {
                plugin: PluginKind::AzureFile.plugin_name(),
            }
            .build()
        })
    }
}

impl std::fmt::Debug for VolumePlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumePlugins")
            .field("azure_disk", &self.azure_disk.is_some())
            .field("aws_ebs", &self.aws_ebs.is_some())
            .field("cinder", &self.cinder.is_some())
            .field("iscsi", &self.iscsi.is_some())
            .field("azure_file", &self.azure_file.is_some())
            .finish()
    }
}
