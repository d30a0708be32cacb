//! iSCSI volumes: the node logs in to the target itself and the lun shows up under
//! `/dev/disk/by-path`.
use crate::{
    attacher::mount_global_path,
    detacher::{unmount_global_path, wait_for_device_removal},
    error::{DeviceNotFound, InvalidAttachToken, InvalidGlobalPath, InvalidSource, Iscsi},
    host::VolumeHost,
    keyed_lock::{attach_detach_lock, KeyedLock},
    mount::Mounter,
    plugin::{AttachableVolume, PluginKind},
    volume::{IscsiDisk, Lun, VolumeIdentity, VolumeSource},
    wait::poll_with_deadline,
    Error, NodeConfig,
};

use std::{
    convert::Infallible,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info};

/// Session management with iSCSI targets.
#[async_trait::async_trait]
pub trait IscsiAdm: Send + Sync {
    /// Logs in to the target through the portal.
    async fn login(&self, portal: &str, iqn: &str) -> Result<(), String>;
    /// Logs out of the target.
    async fn logout(&self, portal: &str, iqn: &str) -> Result<(), String>;
}

/// Runs the `iscsiadm` executable.
#[derive(Debug, Default, Clone)]
pub struct IscsiAdmCommand {}

impl IscsiAdmCommand {
    async fn node(&self, portal: &str, iqn: &str, action: &str) -> Result<(), String> {
        let binary = "iscsiadm";
        let output = Command::new(binary)
            .args(["-m", "node", "-p", portal, "-T", iqn, action])
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        if !output.status.success() {
            return Err(format!(
                "{binary} {action} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IscsiAdm for IscsiAdmCommand {
    async fn login(&self, portal: &str, iqn: &str) -> Result<(), String> {
        self.node(portal, iqn, "--login").await
    }
    async fn logout(&self, portal: &str, iqn: &str) -> Result<(), String> {
        self.node(portal, iqn, "--logout").await
    }
}

/// The target portal, iqn and lun encoded by an iSCSI volume identity.
fn target_of(identity: &VolumeIdentity) -> Option<(&str, &str, Lun)> {
    let mut parts = identity.name().splitn(3, '/');
    let portal = parts.next().filter(|p| !p.is_empty())?;
    let iqn = parts.next().filter(|i| !i.is_empty())?;
    let lun = parts.next()?.strip_prefix("lun-")?.parse().ok()?;
    Some((portal, iqn, lun))
}

/// The iSCSI volume plugin.
pub struct IscsiPlugin {
    adm: Arc<dyn IscsiAdm>,
    mounter: Arc<dyn Mounter>,
    host: VolumeHost,
    dev_dir: PathBuf,
    poll_interval: Duration,
    lock: &'static KeyedLock,
}

impl IscsiPlugin {
    /// Returns a new plugin.
    pub fn new(adm: Arc<dyn IscsiAdm>, mounter: Arc<dyn Mounter>, config: &NodeConfig) -> Self {
        Self {
            adm,
            mounter,
            host: VolumeHost::new(&config.root_dir),
            dev_dir: config.dev_dir.clone(),
            poll_interval: config.poll_interval,
            lock: attach_detach_lock(),
        }
    }

    fn disk<'a>(&self, source: &'a VolumeSource) -> Result<&'a IscsiDisk, Error> {
        match source {
            VolumeSource::Iscsi(disk) => Ok(disk),
            other => InvalidSource {
                details: format!("iscsi plugin cannot handle a {} volume", other.kind()),
            }
            .fail(),
        }
    }

    /// The stable device path of the target lun once logged in.
    pub fn device_path(&self, disk: &IscsiDisk) -> PathBuf {
        self.dev_dir.join("disk/by-path").join(format!(
            "ip-{}-iscsi-{}-lun-{}",
            disk.portal, disk.iqn, disk.lun
        ))
    }

    fn global_root(&self) -> PathBuf {
        self.host.plugin_dir(PluginKind::Iscsi).join("iscsi")
    }
}

#[async_trait::async_trait]
impl AttachableVolume for IscsiPlugin {
    async fn attach(&self, source: &VolumeSource, _node_name: &str) -> Result<String, Error> {
        let disk = self.disk(source)?;
        let identity = disk.identity();
        let _guard = self.lock.lock(identity.lock_key()).await;

        let device = self.device_path(disk);
        if device.exists() {
            info!(volume.name = identity.name(), device = %device.display(), "Target is already logged in");
        } else {
            self.adm
                .login(&disk.portal, &disk.iqn)
                .await
                .map_err(|details| {
                    Iscsi {
                        target: &disk.iqn,
                        details,
                    }
                    .build()
                })?;
            info!(volume.name = identity.name(), portal = %disk.portal, "Logged in to target");
        }
        Ok(device.to_string_lossy().to_string())
    }

    async fn wait_for_attach(
        &self,
        source: &VolumeSource,
        token: &str,
        timeout: Duration,
    ) -> Result<PathBuf, Error> {
        let disk = self.disk(source)?;
        let expected = self.device_path(disk);
        if token.is_empty() || Path::new(token) != expected {
            return InvalidAttachToken {
                volume: disk.identity().name(),
                token,
                reason: format!("expected {}", expected.display()),
            }
            .fail();
        }

        let found = poll_with_deadline(self.poll_interval, timeout, || {
            Ok::<_, Infallible>(expected.exists().then(|| expected.clone()))
        })
        .await
        .unwrap_or_else(|never| match never {});
        found.ok_or_else(|| {
            DeviceNotFound {
                volume: disk.identity().name(),
                elapsed: timeout,
            }
            .build()
        })
    }

    fn device_mount_path(&self, source: &VolumeSource) -> Result<PathBuf, Error> {
        let disk = self.disk(source)?;
        Ok(self
            .global_root()
            .join(&disk.portal)
            .join(&disk.iqn)
            .join("lun")
            .join(disk.lun.to_string()))
    }

    async fn mount_device(
        &self,
        source: &VolumeSource,
        device: &Path,
        global_path: &Path,
    ) -> Result<(), Error> {
        let disk = self.disk(source)?;
        let identity = disk.identity();
        mount_global_path(
            self.mounter.as_ref(),
            identity.name(),
            device,
            global_path,
            disk.fs_type,
            disk.read_only,
        )
        .await
    }

    fn identity_from_global_path(&self, global_path: &Path) -> Result<VolumeIdentity, Error> {
        let invalid = || {
            InvalidGlobalPath {
                plugin: PluginKind::Iscsi.plugin_name(),
                path: global_path,
            }
            .build()
        };
        let relative = global_path
            .strip_prefix(self.global_root())
            .map_err(|_| invalid())?;
        let parts = relative
            .components()
            .map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(invalid)?;
        match parts.as_slice() {
            [portal, iqn, "lun", lun] => {
                let lun = lun.parse::<Lun>().map_err(|_| invalid())?;
                Ok(VolumeIdentity::new(format!("{portal}/{iqn}/lun-{lun}")))
            }
            _ => Err(invalid()),
        }
    }

    async fn unmount_device(&self, global_path: &Path) -> Result<(), Error> {
        unmount_global_path(self.mounter.as_ref(), global_path).await
    }

    async fn detach(&self, identity: &VolumeIdentity, _node_name: &str) -> Result<(), Error> {
        let Some((portal, iqn, lun)) = target_of(identity) else {
            return InvalidSource {
                details: format!("'{identity}' is not an iscsi target lun"),
            }
            .fail();
        };
        let _guard = self.lock.lock(identity.lock_key()).await;
        debug!(%portal, %iqn, %lun, "Logging out of target");
        self.adm.logout(portal, iqn).await.map_err(|details| {
            Iscsi {
                target: iqn,
                details,
            }
            .build()
        })?;
        info!(volume.name = identity.name(), %portal, "Logged out of target");
        Ok(())
    }

    async fn wait_for_detach(&self, device: &Path, timeout: Duration) -> Result<(), Error> {
        wait_for_device_removal(device, self.poll_interval, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::fake::FakeMounter;
    use std::sync::Mutex;

    /// Creates the by-path device link on login and removes it on logout.
    struct FakeAdm {
        device: PathBuf,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl IscsiAdm for FakeAdm {
        async fn login(&self, portal: &str, iqn: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(format!("login {portal} {iqn}"));
            std::fs::create_dir_all(self.device.parent().unwrap()).unwrap();
            std::fs::write(&self.device, b"").map_err(|e| e.to_string())
        }
        async fn logout(&self, portal: &str, iqn: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(format!("logout {portal} {iqn}"));
            std::fs::remove_file(&self.device).map_err(|e| e.to_string())
        }
    }

    fn source() -> VolumeSource {
        let url = url::Url::parse("iscsi://10.0.0.5/iqn.2015-01.io.example:storage/2").unwrap();
        VolumeSource::Iscsi(IscsiDisk::try_from(&url).unwrap())
    }

    fn plugin(root: &Path) -> (IscsiPlugin, Arc<FakeAdm>) {
        let mut config = NodeConfig::new("node-1");
        config.root_dir = root.join("kubelet");
        config.dev_dir = root.join("dev");
        let adm = Arc::new(FakeAdm {
            device: root.join(
                "dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2015-01.io.example:storage-lun-2",
            ),
            calls: Mutex::default(),
        });
        let plugin = IscsiPlugin::new(adm.clone(), Arc::new(FakeMounter::default()), &config);
        (plugin, adm)
    }

    #[tokio::test(start_paused = true)]
    async fn login_and_logout() {
        let root = tempfile::tempdir().unwrap();
        let (plugin, adm) = plugin(root.path());
        let source = source();

        let token = plugin.attach(&source, "node-1").await.unwrap();
        let device = plugin
            .wait_for_attach(&source, &token, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(device, adm.device);

        // the device is present, no second login
        assert_eq!(plugin.attach(&source, "node-1").await.unwrap(), token);
        assert_eq!(adm.calls.lock().unwrap().len(), 1);

        let error = plugin
            .wait_for_attach(&source, "/dev/sdb", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidAttachToken { .. }), "{error}");

        let identity = source.identity().unwrap();
        plugin.detach(&identity, "node-1").await.unwrap();
        plugin
            .wait_for_detach(&device, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            adm.calls.lock().unwrap().last().unwrap(),
            "logout 10.0.0.5:3260 iqn.2015-01.io.example:storage"
        );
    }

    #[test]
    fn global_path_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let (plugin, _) = plugin(root.path());
        let source = source();

        let global = plugin.device_mount_path(&source).unwrap();
        assert!(global.ends_with(
            "plugins/kubernetes.io~iscsi/iscsi/10.0.0.5:3260/iqn.2015-01.io.example:storage/lun/2"
        ));
        let identity = plugin.identity_from_global_path(&global).unwrap();
        assert_eq!(Some(identity.clone()), source.identity());
        assert_eq!(
            target_of(&identity),
            Some(("10.0.0.5:3260", "iqn.2015-01.io.example:storage", Lun::new(2).unwrap()))
        );

        for invalid in [
            global.join("extra"),
            global.parent().unwrap().join("x"),
            PathBuf::from("/elsewhere/iscsi/p/iqn/lun/1"),
        ] {
            let error = plugin.identity_from_global_path(&invalid).unwrap_err();
            assert!(matches!(error, Error::InvalidGlobalPath { .. }), "{error}");
        }
    }
}
