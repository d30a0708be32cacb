use crate::{
    attacher::instance_name,
    cloud::{CloudDiskClient, InstanceResolver},
    error::{Cloud, DeviceCheck, DeviceStillAttached, Mount},
    host::remove_volume_dir,
    keyed_lock::{attach_detach_lock, KeyedLock},
    mount::Mounter,
    volume::VolumeIdentity,
    wait::poll_with_deadline,
    Error, NodeConfig,
};

use snafu::ResultExt;
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Unmounts cloud disks from the node global path and detaches them from the node.
pub struct DiskDetacher {
    client: Arc<dyn CloudDiskClient>,
    instances: Arc<dyn InstanceResolver>,
    mounter: Arc<dyn Mounter>,
    poll_interval: Duration,
    lock: &'static KeyedLock,
}

impl DiskDetacher {
    /// Returns a new detacher.
    pub fn new(
        client: Arc<dyn CloudDiskClient>,
        instances: Arc<dyn InstanceResolver>,
        mounter: Arc<dyn Mounter>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            client,
            instances,
            mounter,
            poll_interval: config.poll_interval,
            lock: attach_detach_lock(),
        }
    }

    /// Detaches the disk from the instance of the given node.
    /// A disk which is not attached is considered detached.
    pub async fn detach(&self, identity: &VolumeIdentity, node_name: &str) -> Result<(), Error> {
        let instance = instance_name(self.instances.as_ref(), node_name).await?;
        let _guard = self.lock.lock(identity.lock_key()).await;

        let result = self
            .client
            .detach_disk_by_name(identity, &instance)
            .await
            .context(Cloud {
                operation: "detach",
                volume: identity.name(),
            });
        match result {
            Err(error) if error.is_volume_not_found() => {
                info!(volume.name = identity.name(), %instance, "Volume is not attached");
                Ok(())
            }
            Err(error) => Err(error),
            Ok(()) => {
                info!(volume.name = identity.name(), %instance, "Volume detached");
                Ok(())
            }
        }
    }

    /// Waits for the device to go away.
    pub async fn wait_for_detach(&self, device: &Path, timeout: Duration) -> Result<(), Error> {
        wait_for_device_removal(device, self.poll_interval, timeout).await
    }

    /// Unmounts the global path and removes it. A missing path is already unmounted.
    pub async fn unmount_device(&self, global_path: &Path) -> Result<(), Error> {
        unmount_global_path(self.mounter.as_ref(), global_path).await
    }
}

/// Polls the device path until it no longer exists.
pub(crate) async fn wait_for_device_removal(
    device: &Path,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let gone = poll_with_deadline(poll_interval, timeout, || {
        debug!(device = %device.display(), "Checking if the device is detached");
        match device.try_exists() {
            Ok(true) => Ok(None),
            Ok(false) => Ok(Some(())),
            Err(source) => Err(source),
        }
    })
    .await
    .context(DeviceCheck { device })?;

    match gone {
        Some(()) => Ok(()),
        None => DeviceStillAttached {
            device,
            elapsed: timeout,
        }
        .fail(),
    }
}

/// Unmounts the global path, if mounted, and removes it.
pub(crate) async fn unmount_global_path(
    mounter: &dyn Mounter,
    global_path: &Path,
) -> Result<(), Error> {
    let volume = global_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    match mounter.is_likely_not_mount_point(global_path).await {
        Err(error) if error.is_not_found() => {
            debug!(path = %global_path.display(), "Unmount skipped, the path does not exist");
            return Ok(());
        }
        Err(error) => return Err(error).context(Mount { volume }),
        Ok(true) => {}
        Ok(false) => {
            mounter
                .unmount(global_path)
                .await
                .context(Mount { volume: &volume })?;
            info!(volume.name = %volume, path = %global_path.display(), "Device unmounted");
        }
    }
    remove_volume_dir(global_path).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cloud::{
            azure::testing::{client, InMemoryVms},
            testing::VmPerNode,
            CloudDiskClient,
        },
        mount::fake::FakeMounter,
        volume::{CachingMode, Lun},
    };

    fn detacher(vms: Arc<InMemoryVms>, mounter: Arc<FakeMounter>) -> DiskDetacher {
        DiskDetacher::new(
            Arc::new(client(vms)),
            Arc::new(VmPerNode),
            mounter,
            &NodeConfig::new("node-1"),
        )
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let vms = Arc::new(InMemoryVms::with_instance("node-1"));
        let disk = VolumeIdentity::new("detach-a");
        client(vms.clone())
            .attach_disk(&disk, "node-1", Lun::new(0).unwrap(), CachingMode::None)
            .await
            .unwrap();

        let detacher = detacher(vms.clone(), Arc::new(FakeMounter::default()));
        detacher.detach(&disk, "node-1").await.unwrap();
        assert!(vms.vms.lock().unwrap()["node-1"].data_disks.is_empty());
        detacher.detach(&disk, "node-1").await.unwrap();

        let error = detacher.detach(&disk, "node-2").await.unwrap_err();
        assert!(matches!(error, Error::Cloud { .. }), "{error}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_detach() {
        let detacher = detacher(
            Arc::new(InMemoryVms::default()),
            Arc::new(FakeMounter::default()),
        );
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("sdc");

        detacher
            .wait_for_detach(&device, Duration::from_secs(5))
            .await
            .unwrap();

        std::fs::write(&device, b"").unwrap();
        let error = detacher
            .wait_for_detach(&device, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::DeviceStillAttached { .. }), "{error}");
    }

    #[tokio::test]
    async fn unmount_device() {
        let mounter = Arc::new(FakeMounter::default());
        let detacher = detacher(Arc::new(InMemoryVms::default()), mounter.clone());
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("mounts/disk-a");

        // nothing to do for a missing path
        detacher.unmount_device(&global).await.unwrap();

        std::fs::create_dir_all(&global).unwrap();
        mounter
            .mount("/dev/sdc", &global, Some("ext4"), &[])
            .await
            .unwrap();
        detacher.unmount_device(&global).await.unwrap();
        assert!(!mounter.is_mounted(&global));
        assert!(!global.exists());
    }
}
