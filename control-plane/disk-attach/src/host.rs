//! Node directory layout shared by the volume plugins.
use crate::plugin::PluginKind;

use std::path::{Path, PathBuf};
use tracing::warn;

/// Permissions of the global and pod volume directories.
const VOLUME_DIR_MODE: u32 = 0o750;

/// Escapes a qualified plugin name so it can be used as a single path component.
pub fn escape_plugin_name(name: &str) -> String {
    name.replace('/', "~")
}

/// Root of the pod and plugin directories of a node.
#[derive(Debug, Clone)]
pub struct VolumeHost {
    root_dir: PathBuf,
}

impl VolumeHost {
    /// Returns a new host rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// The root directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Directory private to a volume plugin, where global device mounts live.
    pub fn plugin_dir(&self, kind: PluginKind) -> PathBuf {
        self.root_dir
            .join("plugins")
            .join(escape_plugin_name(&kind.plugin_name()))
    }

    /// Directory of the lock files serializing the volume operations of every agent process
    /// of the node.
    pub fn lock_dir(&self) -> PathBuf {
        self.root_dir
            .join("plugins")
            .join(utils::PRODUCT_NAME)
            .join("locks")
    }

    /// Directory in which the named volume of a pod is mounted.
    pub fn pod_volume_dir(&self, pod_uid: &str, kind: PluginKind, volume_name: &str) -> PathBuf {
        self.root_dir
            .join("pods")
            .join(pod_uid)
            .join("volumes")
            .join(escape_plugin_name(&kind.plugin_name()))
            .join(volume_name)
    }
}

/// Creates a volume directory, along with its missing parents.
pub(crate) async fn create_volume_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(VOLUME_DIR_MODE);
    builder.create(path).await
}

/// Removes an empty volume directory. A missing directory is not an error, any other failure
/// is only logged: the mount it held is gone and a leftover directory is harmless.
pub(crate) async fn remove_volume_dir(path: &Path) {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "Failed to remove volume directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let host = VolumeHost::new("/var/lib/kubelet");
        assert_eq!(
            host.plugin_dir(PluginKind::AzureDisk),
            PathBuf::from("/var/lib/kubelet/plugins/kubernetes.io~azure-disk")
        );
        assert_eq!(
            host.pod_volume_dir("uid-1", PluginKind::Iscsi, "data"),
            PathBuf::from("/var/lib/kubelet/pods/uid-1/volumes/kubernetes.io~iscsi/data")
        );
        assert_eq!(
            host.lock_dir(),
            PathBuf::from("/var/lib/kubelet/plugins/disk-attach/locks")
        );
    }

    #[tokio::test]
    async fn volume_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("plugins/a/mounts/disk");
        create_volume_dir(&dir).await.unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        // the umask may only remove bits
        assert_eq!(mode & !VOLUME_DIR_MODE & 0o777, 0);

        remove_volume_dir(&dir).await;
        assert!(!dir.exists());
        remove_volume_dir(&dir).await;
    }
}
