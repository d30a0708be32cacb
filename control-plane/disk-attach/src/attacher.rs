use crate::{
    cloud::{trim_instance_id, CloudDiskClient, CloudError, InstanceResolver},
    dev::DeviceFinder,
    error::{Cloud, DeviceNotFound, InstanceId, InvalidAttachToken, Io, Mount},
    filesystem::FileSystem,
    host::{create_volume_dir, remove_volume_dir, VolumeHost},
    keyed_lock::{attach_detach_lock, KeyedLock},
    mount::Mounter,
    plugin::PluginKind,
    volume::{CloudDisk, Lun},
    wait::poll_with_deadline,
    Error, NodeConfig,
};

use snafu::ResultExt;
use std::{
    convert::Infallible,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Resolves the provider instance name of the given node.
pub(crate) async fn instance_name(
    resolver: &dyn InstanceResolver,
    node_name: &str,
) -> Result<String, Error> {
    let instance_id = resolver
        .instance_id(node_name)
        .await
        .context(InstanceId { node: node_name })?;
    Ok(trim_instance_id(&instance_id).to_string())
}

/// Attaches cloud disks to the node, waits for their devices and mounts them at the node
/// global path.
pub struct DiskAttacher {
    kind: PluginKind,
    client: Arc<dyn CloudDiskClient>,
    finder: Arc<dyn DeviceFinder>,
    instances: Arc<dyn InstanceResolver>,
    mounter: Arc<dyn Mounter>,
    host: VolumeHost,
    poll_interval: Duration,
    lock: &'static KeyedLock,
}

impl DiskAttacher {
    /// Returns a new attacher for disks of the given plugin kind.
    pub fn new(
        kind: PluginKind,
        client: Arc<dyn CloudDiskClient>,
        finder: Arc<dyn DeviceFinder>,
        instances: Arc<dyn InstanceResolver>,
        mounter: Arc<dyn Mounter>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            kind,
            client,
            finder,
            instances,
            mounter,
            host: VolumeHost::new(&config.root_dir),
            poll_interval: config.poll_interval,
            lock: attach_detach_lock(),
        }
    }

    /// Attaches the disk to the instance of the given node, returning the lun it's attached at.
    /// A disk which is already attached is left where it is.
    pub async fn attach(&self, disk: &CloudDisk, node_name: &str) -> Result<String, Error> {
        let instance = instance_name(self.instances.as_ref(), node_name).await?;
        let identity = &disk.identity;
        let _guard = self.lock.lock(identity.lock_key()).await;

        let lun = match self.client.get_disk_lun(identity, &instance).await {
            Ok(lun) => {
                info!(
                    volume.name = identity.name(),
                    %instance,
                    %lun,
                    "Volume is already attached"
                );
                lun
            }
            Err(lookup_error) => {
                match &lookup_error {
                    CloudError::VolumeNotFound { .. } => {}
                    _ => warn!(
                        volume.name = identity.name(),
                        %instance,
                        error = %lookup_error,
                        "Failed to check if the volume is already attached, attaching anyway"
                    ),
                }
                let lun = self
                    .client
                    .get_next_disk_lun(&instance)
                    .await
                    .context(Cloud {
                        operation: "attach",
                        volume: identity.name(),
                    })?;
                debug!(volume.name = identity.name(), %instance, %lun, "Attaching volume");
                self.client
                    .attach_disk(identity, &instance, lun, disk.caching)
                    .await
                    .context(Cloud {
                        operation: "attach",
                        volume: identity.name(),
                    })?;
                info!(volume.name = identity.name(), %instance, %lun, "Volume attached");
                lun
            }
        };
        Ok(lun.to_string())
    }

    /// Waits for the device of the disk attached at the lun held by the token to show up.
    pub async fn wait_for_attach(
        &self,
        disk: &CloudDisk,
        token: &str,
        timeout: Duration,
    ) -> Result<PathBuf, Error> {
        let identity = &disk.identity;
        if token.is_empty() {
            return InvalidAttachToken {
                volume: identity.name(),
                token,
                reason: "token is empty",
            }
            .fail();
        }
        let lun = token.parse::<Lun>().map_err(|reason| {
            InvalidAttachToken {
                volume: identity.name(),
                token,
                reason,
            }
            .build()
        })?;

        let found = poll_with_deadline(self.poll_interval, timeout, || {
            match self.finder.find_device(identity, lun) {
                Ok(device) => Ok::<_, Infallible>(device),
                Err(error) => {
                    error!(volume.name = identity.name(), %lun, %error, "Failed to scan for the device");
                    Ok(None)
                }
            }
        })
        .await
        .unwrap_or_else(|never| match never {});

        let Some(device) = found else {
            return DeviceNotFound {
                volume: identity.name(),
                elapsed: timeout,
            }
            .fail();
        };
        info!(volume.name = identity.name(), device = %device.display(), "Found attached device");

        Ok(match disk.partition {
            Some(partition) => {
                let mut device = device.into_os_string();
                device.push(partition.to_string());
                PathBuf::from(device)
            }
            None => device,
        })
    }

    /// The node global path the disk's device is mounted at.
    pub fn device_mount_path(&self, disk: &CloudDisk) -> PathBuf {
        self.host
            .plugin_dir(self.kind)
            .join("mounts")
            .join(disk.identity.name())
    }

    /// Mounts the device at the global path, formatting it first if it's blank.
    pub async fn mount_device(
        &self,
        disk: &CloudDisk,
        device: &Path,
        global_path: &Path,
    ) -> Result<(), Error> {
        mount_global_path(
            self.mounter.as_ref(),
            disk.identity.name(),
            device,
            global_path,
            disk.fs_type,
            disk.read_only,
        )
        .await
    }
}

/// Mounts the device at the global path unless it's already mounted, formatting it first if
/// it's blank. On failure nothing is left mounted and the directory is removed.
pub(crate) async fn mount_global_path(
    mounter: &dyn Mounter,
    volume: &str,
    device: &Path,
    global_path: &Path,
    fs_type: FileSystem,
    read_only: bool,
) -> Result<(), Error> {
    let not_mounted = match mounter.is_likely_not_mount_point(global_path).await {
        Ok(not_mounted) => not_mounted,
        Err(error) if error.is_not_found() => {
            create_volume_dir(global_path)
                .await
                .context(Io { path: global_path })?;
            true
        }
        Err(error) => return Err(error).context(Mount { volume }),
    };
    if !not_mounted {
        debug!(volume.name = volume, path = %global_path.display(), "Device is already mounted");
        return Ok(());
    }

    let options = match read_only {
        true => vec!["ro".to_string()],
        false => vec![],
    };
    if let Err(mount_error) = mounter
        .format_and_mount(device, global_path, fs_type, &options)
        .await
    {
        rollback(mounter, global_path).await;
        return Err(mount_error).context(Mount { volume });
    }
    info!(
        volume.name = volume,
        device = %device.display(),
        path = %global_path.display(),
        "Device mounted"
    );
    Ok(())
}

async fn rollback(mounter: &dyn Mounter, global_path: &Path) {
    if let Ok(false) = mounter.is_likely_not_mount_point(global_path).await {
        if let Err(error) = mounter.unmount(global_path).await {
            error!(path = %global_path.display(), %error, "Failed to roll back the device mount");
            return;
        }
    }
    remove_volume_dir(global_path).await;
}
