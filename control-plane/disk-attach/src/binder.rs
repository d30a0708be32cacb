//! Pod volume SetUp and TearDown.
//!
//! SetUp of an attachable volume attaches the disk, mounts its device once at the node global
//! path and bind mounts the global path into the pod volume directory. TearDown removes the
//! pod bind mount and, if the global mount is then the only remaining reference to the device,
//! unmounts it and detaches the disk.
//! Both hold the volume's key in the mounter's own `KeyedLock` and in the node wide
//! `HostLock`, so SetUp and TearDown of pods sharing a disk never interleave, even when they
//! run in separate agent processes. The attach and detach calls take the same key in the
//! separate attach/detach registry.
use crate::{
    azure_file::{mount_options, share_source},
    error::{InvalidSource, Io, Mount, NodeLock},
    host::{create_volume_dir, remove_volume_dir, VolumeHost},
    keyed_lock::{HostGuard, HostLock, KeyGuard, KeyedLock},
    mount::{find_mount, get_mount_refs, MountError, Mounter},
    plugin::{PluginKind, VolumePlugins},
    volume::{AzureFileVolume, GlusterfsVolume, VolumeSource, VolumeSpec},
    Error, NodeConfig,
};

use snafu::ResultExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Sets up and tears down the volumes of the pods running on this node.
pub struct PodVolumeMounter {
    host: VolumeHost,
    plugins: VolumePlugins,
    mounter: Arc<dyn Mounter>,
    lock: KeyedLock,
    host_lock: HostLock,
    node_name: String,
    attach_timeout: Duration,
    detach_timeout: Duration,
}

impl PodVolumeMounter {
    /// Returns a new mounter for the configured plugins.
    pub fn new(plugins: VolumePlugins, mounter: Arc<dyn Mounter>, config: &NodeConfig) -> Self {
        let host = VolumeHost::new(&config.root_dir);
        Self {
            host_lock: HostLock::new(host.lock_dir()),
            host,
            plugins,
            mounter,
            lock: KeyedLock::new(),
            node_name: config.node_name.clone(),
            attach_timeout: config.attach_timeout,
            detach_timeout: config.detach_timeout,
        }
    }

    /// Sets up the pod volume in its pod volume directory, which is returned.
    pub async fn set_up(&self, pod_uid: &str, volume: &VolumeSpec) -> Result<PathBuf, Error> {
        let dir = self
            .host
            .pod_volume_dir(pod_uid, volume.source.kind(), &volume.name);
        self.set_up_at(&volume.source, &dir).await?;
        Ok(dir)
    }

    /// Tears down the named pod volume.
    pub async fn tear_down(
        &self,
        pod_uid: &str,
        kind: PluginKind,
        volume_name: &str,
    ) -> Result<(), Error> {
        let dir = self.host.pod_volume_dir(pod_uid, kind, volume_name);
        self.tear_down_at(kind, &dir).await
    }

    /// Makes the volume available at `dir`. Nothing is done if `dir` is already a mount point.
    pub async fn set_up_at(&self, source: &VolumeSource, dir: &Path) -> Result<(), Error> {
        let plugin = match source {
            VolumeSource::Glusterfs(volume) => return self.set_up_glusterfs(volume, dir).await,
            VolumeSource::AzureFile(volume) => return self.set_up_azure_file(volume, dir).await,
            _ => self.plugins.attachable(source.kind())?,
        };
        let Some(identity) = source.identity() else {
            return InvalidSource {
                details: format!("{} volume has no identity", source.kind()),
            }
            .fail();
        };
        let volume = identity.name();
        let _guards = self.lock_volume(identity.lock_key()).await?;

        if self.is_set_up(dir).await.context(Mount { volume })? {
            debug!(volume.name = volume, dir = %dir.display(), "Volume is already set up");
            return Ok(());
        }

        let token = plugin.attach(source, &self.node_name).await?;
        let device = plugin
            .wait_for_attach(source, &token, self.attach_timeout)
            .await?;
        let global_path = plugin.device_mount_path(source)?;
        plugin.mount_device(source, &device, &global_path).await?;

        create_volume_dir(dir).await.context(Io { path: dir })?;
        let mut options = vec!["bind".to_string()];
        if source.read_only() {
            options.push("ro".to_string());
        }
        if let Err(mount_error) = self
            .mounter
            .mount(&global_path.to_string_lossy(), dir, None, &options)
            .await
        {
            self.clean_up_after_failure(dir).await;
            return Err(mount_error).context(Mount { volume });
        }
        info!(
            volume.name = volume,
            dir = %dir.display(),
            global_path = %global_path.display(),
            "Volume set up"
        );
        Ok(())
    }

    /// Removes the volume from `dir`, detaching the disk if no other pod uses it.
    pub async fn tear_down_at(&self, kind: PluginKind, dir: &Path) -> Result<(), Error> {
        if !kind.is_attachable() {
            let volume = dir_name(dir);
            return self.clean_up(dir).await.context(Mount { volume });
        }
        let plugin = self.plugins.attachable(kind)?;
        let volume = dir_name(dir);

        if !self.is_set_up(dir).await.context(Mount { volume: &volume })? {
            debug!(dir = %dir.display(), "Not a mount point, removing the directory");
            remove_volume_dir(dir).await;
            return Ok(());
        }

        let plugin_dir = self.host.plugin_dir(kind);
        let global_path = get_mount_refs(self.mounter.as_ref(), dir)
            .await
            .context(Mount { volume: &volume })?
            .into_iter()
            .find(|path| path.starts_with(&plugin_dir));
        let Some(global_path) = global_path else {
            warn!(dir = %dir.display(), "No global mount of the volume found, only unmounting");
            self.clean_up(dir).await.context(Mount { volume })?;
            return Ok(());
        };
        let identity = plugin.identity_from_global_path(&global_path)?;
        let _guards = self.lock_volume(identity.lock_key()).await?;

        // other pods may have come or gone while waiting for the key
        let refs = get_mount_refs(self.mounter.as_ref(), dir)
            .await
            .context(Mount { volume: &volume })?;
        let device = find_mount(self.mounter.as_ref(), &global_path)
            .await
            .context(Mount { volume: &volume })?
            .map(|mount| PathBuf::from(mount.device));

        self.mounter
            .unmount(dir)
            .await
            .context(Mount { volume: &volume })?;
        remove_volume_dir(dir).await;
        info!(volume.name = identity.name(), dir = %dir.display(), "Volume torn down");

        if refs != [global_path.clone()] {
            debug!(
                volume.name = identity.name(),
                references = refs.len(),
                "Volume is still in use, leaving it attached"
            );
            return Ok(());
        }

        info!(volume.name = identity.name(), "Last reference removed, detaching the volume");
        plugin.unmount_device(&global_path).await?;
        plugin.detach(&identity, &self.node_name).await?;
        if let Some(device) = device {
            plugin
                .wait_for_detach(&device, self.detach_timeout)
                .await?;
        }
        Ok(())
    }

    /// Takes the volume's key, first among the tasks of this process then among the processes
    /// of the node.
    async fn lock_volume(&self, key: &str) -> Result<(KeyGuard<'_>, HostGuard), Error> {
        let guard = self.lock.lock(key).await;
        let host_guard = self.host_lock.lock(key).await.context(NodeLock { key })?;
        Ok((guard, host_guard))
    }

    /// Whether `dir` is a mount point. A missing directory is not.
    async fn is_set_up(&self, dir: &Path) -> Result<bool, MountError> {
        match self.mounter.is_likely_not_mount_point(dir).await {
            Ok(not_mounted) => Ok(!not_mounted),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Unmounts `dir` if it's a mount point and removes it.
    async fn clean_up(&self, dir: &Path) -> Result<(), MountError> {
        if self.is_set_up(dir).await? {
            self.mounter.unmount(dir).await?;
        }
        remove_volume_dir(dir).await;
        Ok(())
    }

    async fn clean_up_after_failure(&self, dir: &Path) {
        if let Err(error) = self.clean_up(dir).await {
            error!(dir = %dir.display(), %error, "Failed to clean up the pod volume directory");
        }
    }

    /// Mounts the glusterfs volume into the pod directory, trying every host until one
    /// succeeds. The first host is picked randomly so that pods don't all hit the same one.
    async fn set_up_glusterfs(&self, volume: &GlusterfsVolume, dir: &Path) -> Result<(), Error> {
        let name = volume.path.as_str();
        if self.is_set_up(dir).await.context(Mount { volume: name })? {
            return Ok(());
        }
        if volume.hosts.is_empty() {
            return InvalidSource {
                details: format!("glusterfs volume '{name}' has no endpoint host"),
            }
            .fail();
        }
        create_volume_dir(dir).await.context(Io { path: dir })?;

        let options = [match volume.read_only {
            true => "ro".to_string(),
            false => "rw".to_string(),
        }];
        let start = rand::random::<usize>() % volume.hosts.len();
        let mut failure = None;
        for host in volume
            .hosts
            .iter()
            .cycle()
            .skip(start)
            .take(volume.hosts.len())
        {
            let source = format!("{host}:{name}");
            match self
                .mounter
                .mount(&source, dir, Some("glusterfs"), &options)
                .await
            {
                Ok(()) => {
                    info!(%source, dir = %dir.display(), "Glusterfs volume mounted");
                    return Ok(());
                }
                Err(error) => {
                    warn!(%source, %error, "Glusterfs mount failed");
                    failure = Some(error);
                }
            }
        }

        self.clean_up_after_failure(dir).await;
        match failure {
            Some(error) => Err(error).context(Mount { volume: name }),
            None => Ok(()),
        }
    }

    /// Creates the share if needed and mounts it over cifs into the pod directory.
    async fn set_up_azure_file(&self, volume: &AzureFileVolume, dir: &Path) -> Result<(), Error> {
        let name = volume.share_name.as_str();
        if self.is_set_up(dir).await.context(Mount { volume: name })? {
            return Ok(());
        }
        let key = self.plugins.azure_file()?.set_up_share(volume).await?;
        create_volume_dir(dir).await.context(Io { path: dir })?;

        let source = share_source(volume);
        if let Err(error) = self
            .mounter
            .mount(&source, dir, Some("cifs"), &mount_options(volume, &key))
            .await
        {
            self.clean_up_after_failure(dir).await;
            return Err(error).context(Mount { volume: name });
        }
        info!(%source, dir = %dir.display(), "Azure file share mounted");
        Ok(())
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        azure_file::AzureFileService,
        cloud::{
            azure::testing::{client, InMemoryShares, InMemoryVms},
            testing::{InMemorySecrets, VmPerNode},
        },
        dev::testing::FakeFinder,
        mount::fake::FakeMounter,
        plugin::CloudDiskPlugin,
        volume::{CloudDisk, Lun, VolumeIdentity},
        DiskAttacher, DiskDetacher,
    };
    use std::sync::atomic::Ordering;

    struct Fixture {
        vms: Arc<InMemoryVms>,
        shares: Arc<InMemoryShares>,
        mounter: Arc<FakeMounter>,
        binder: PodVolumeMounter,
        root: tempfile::TempDir,
    }

    impl Fixture {
        fn attached(&self) -> usize {
            self.vms.vms.lock().unwrap()["node-1"].data_disks.len()
        }
        fn global_path(&self, disk: &str) -> PathBuf {
            self.root
                .path()
                .join("plugins/kubernetes.io~azure-disk/mounts")
                .join(disk)
        }
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("node-1");
        config.root_dir = root.path().to_path_buf();

        let vms = Arc::new(InMemoryVms::with_instance("node-1"));
        let mounter = Arc::new(FakeMounter::default());
        let finder = Arc::new(FakeFinder::default());
        for lun in 0 .. 2 {
            finder.plug(
                Lun::new(lun).unwrap(),
                root.path().join(format!("dev/sd{lun}")),
            );
        }
        let client = Arc::new(client(vms.clone()));
        let plugin = CloudDiskPlugin::new(
            PluginKind::AzureDisk,
            DiskAttacher::new(
                PluginKind::AzureDisk,
                client.clone(),
                finder,
                Arc::new(VmPerNode),
                mounter.clone(),
                &config,
            ),
            DiskDetacher::new(client, Arc::new(VmPerNode), mounter.clone(), &config),
        );
        let shares = Arc::new(InMemoryShares::default());
        let secrets = InMemorySecrets::default().with(
            "team-a",
            "share-key",
            &[("azurestorageaccountkey", "a2V5")],
        );
        let plugins = VolumePlugins {
            azure_disk: Some(Arc::new(plugin)),
            azure_file: Some(Arc::new(AzureFileService::new(
                Arc::new(secrets),
                shares.clone(),
            ))),
            ..Default::default()
        };
        Fixture {
            vms,
            shares,
            binder: PodVolumeMounter::new(plugins, mounter.clone(), &config),
            mounter,
            root,
        }
    }

    fn azure_volume(disk: &str) -> VolumeSpec {
        VolumeSpec {
            name: "data".to_string(),
            source: VolumeSource::AzureDisk(CloudDisk::new(VolumeIdentity::new(disk))),
        }
    }

    #[tokio::test]
    async fn last_pod_detaches() {
        let fixture = fixture();
        let binder = &fixture.binder;
        let volume = azure_volume("binder-a");

        let (pod1, pod2) = tokio::join!(
            binder.set_up("pod-1", &volume),
            binder.set_up("pod-2", &volume)
        );
        let (pod1, pod2) = (pod1.unwrap(), pod2.unwrap());
        let global = fixture.global_path("binder-a");
        assert_eq!(fixture.attached(), 1);
        assert_eq!(fixture.mounter.formats.load(Ordering::SeqCst), 1);
        assert!(fixture.mounter.is_mounted(&global));
        assert!(fixture.mounter.is_mounted(&pod1));
        assert!(fixture.mounter.is_mounted(&pod2));

        // another pod still uses the disk
        binder
            .tear_down("pod-1", PluginKind::AzureDisk, "data")
            .await
            .unwrap();
        assert!(!pod1.exists());
        assert!(fixture.mounter.is_mounted(&global));
        assert_eq!(fixture.attached(), 1);

        binder
            .tear_down("pod-2", PluginKind::AzureDisk, "data")
            .await
            .unwrap();
        assert!(!pod2.exists());
        assert!(!global.exists());
        assert!(fixture.mounter.mounts().is_empty());
        assert_eq!(fixture.attached(), 0);
    }

    #[tokio::test]
    async fn set_up_is_idempotent() {
        let fixture = fixture();
        let volume = azure_volume("binder-b");
        let dir = fixture.binder.set_up("pod-1", &volume).await.unwrap();
        fixture.binder.set_up("pod-1", &volume).await.unwrap();

        let bind_mounts = fixture
            .mounter
            .mounts()
            .into_iter()
            .filter(|mount| mount.path == dir)
            .count();
        assert_eq!(bind_mounts, 1);
        assert_eq!(fixture.attached(), 1);
    }

    #[tokio::test]
    async fn read_only_bind_mount() {
        let fixture = fixture();
        let mut volume = azure_volume("binder-c");
        if let VolumeSource::AzureDisk(disk) = &mut volume.source {
            disk.read_only = true;
        }
        let dir = fixture.binder.set_up("pod-1", &volume).await.unwrap();
        let mounts = fixture.mounter.mounts();
        let bind = mounts.iter().find(|mount| mount.path == dir).unwrap();
        assert_eq!(bind.options, vec!["bind".to_string(), "ro".to_string()]);
    }

    #[tokio::test]
    async fn tear_down_of_unmounted_dir() {
        let fixture = fixture();
        let dir = fixture
            .root
            .path()
            .join("pods/pod-9/volumes/kubernetes.io~azure-disk/data");
        std::fs::create_dir_all(&dir).unwrap();

        fixture
            .binder
            .tear_down("pod-9", PluginKind::AzureDisk, "data")
            .await
            .unwrap();
        assert!(!dir.exists());
        // missing directory
        fixture
            .binder
            .tear_down("pod-9", PluginKind::AzureDisk, "data")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unconfigured_plugin() {
        let fixture = fixture();
        let volume = VolumeSpec {
            name: "data".to_string(),
            source: VolumeSource::AwsEbs(CloudDisk::new(VolumeIdentity::new("vol-1"))),
        };
        let error = fixture.binder.set_up("pod-1", &volume).await.unwrap_err();
        assert!(matches!(error, Error::ProviderNotConfigured { .. }), "{error}");
    }

    #[tokio::test]
    async fn glusterfs_mount() {
        let fixture = fixture();
        let volume = VolumeSpec {
            name: "shared".to_string(),
            source: VolumeSource::Glusterfs(GlusterfsVolume {
                hosts: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                path: "gv0".to_string(),
                read_only: true,
            }),
        };
        let dir = fixture.binder.set_up("pod-1", &volume).await.unwrap();
        let mounts = fixture.mounter.mounts();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].device.ends_with(":gv0"));
        assert_eq!(mounts[0].fs_type, "glusterfs");
        assert_eq!(mounts[0].options, vec!["ro".to_string()]);

        fixture
            .binder
            .tear_down("pod-1", PluginKind::Glusterfs, "shared")
            .await
            .unwrap();
        assert!(!dir.exists());
        assert!(fixture.mounter.mounts().is_empty());

        fixture.mounter.fail_mount.store(true, Ordering::SeqCst);
        let error = fixture.binder.set_up("pod-2", &volume).await.unwrap_err();
        assert!(matches!(error, Error::Mount { .. }), "{error}");
        assert!(!fixture
            .root
            .path()
            .join("pods/pod-2/volumes/kubernetes.io~glusterfs/shared")
            .exists());
    }

    #[tokio::test]
    async fn azure_file_mount() {
        let fixture = fixture();
        let mut volume = VolumeSpec {
            name: "reports".to_string(),
            source: VolumeSource::AzureFile(AzureFileVolume {
                secret_namespace: "team-a".to_string(),
                secret_name: "share-key".to_string(),
                account_name: "teamastore".to_string(),
                share_name: "reports".to_string(),
                read_only: false,
            }),
        };
        let dir = fixture.binder.set_up("pod-1", &volume).await.unwrap();
        fixture.binder.set_up("pod-1", &volume).await.unwrap();
        let mounts = fixture.mounter.mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].path, dir);
        assert_eq!(mounts[0].device, "//teamastore.file.core.windows.net/reports");
        assert_eq!(mounts[0].fs_type, "cifs");
        assert!(mounts[0].options.contains(&"password=a2V5".to_string()));
        assert_eq!(fixture.shares.shares.lock().unwrap().len(), 1);

        fixture
            .binder
            .tear_down("pod-1", PluginKind::AzureFile, "reports")
            .await
            .unwrap();
        assert!(!dir.exists());
        assert!(fixture.mounter.mounts().is_empty());

        if let VolumeSource::AzureFile(share) = &mut volume.source {
            share.secret_name = "missing".to_string();
        }
        let error = fixture.binder.set_up("pod-2", &volume).await.unwrap_err();
        assert!(matches!(error, Error::Credentials { .. }), "{error}");
        assert!(!fixture
            .root
            .path()
            .join("pods/pod-2/volumes/kubernetes.io~azure-file/reports")
            .exists());
    }

    #[tokio::test]
    async fn set_up_waits_for_other_agents() {
        let fixture = fixture();
        let volume = azure_volume("binder-d");
        // another agent process of the node working on the same disk
        let other_agent = HostLock::new(fixture.root.path().join("plugins/disk-attach/locks"));
        let guard = other_agent.lock("binder-d").await.unwrap();

        let set_up = fixture.binder.set_up("pod-1", &volume);
        tokio::pin!(set_up);
        let waited = tokio::time::timeout(Duration::from_millis(100), &mut set_up).await;
        assert!(waited.is_err());
        assert_eq!(fixture.attached(), 0);

        drop(guard);
        set_up.await.unwrap();
        assert_eq!(fixture.attached(), 1);
    }
}
