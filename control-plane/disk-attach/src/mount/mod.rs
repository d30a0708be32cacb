//! Mount table primitives.
//!
//! Every decision about whether a path is mounted, or who else references the same device, is
//! derived from the live mount table. No in-memory bookkeeping of mounts is kept.

#[cfg(test)]
pub(crate) mod fake;
#[cfg(target_os = "linux")]
mod daemon;
#[cfg(target_os = "linux")]
mod linux;
mod request;

#[cfg(target_os = "linux")]
pub use daemon::HostDaemonMounter;
#[cfg(target_os = "linux")]
pub use linux::LinuxMounter;
pub use request::{MountRequest, MOUNT_PATH};

use crate::filesystem::FileSystem;

use snafu::Snafu;
use std::path::{Path, PathBuf};

/// Mount operation error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum MountError {
    #[snafu(display("Path {} does not exist", path.display()))]
    NotFound { path: PathBuf },
    #[snafu(display("Failed to stat {}: {}", path.display(), source))]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to mount {} onto {}: {}", device, target.display(), source))]
    MountFailed {
        device: String,
        target: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to unmount {}: {}", target.display(), source))]
    UnmountFailed {
        target: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to format {} with {}: {}", device.display(), fs_type, details))]
    Format {
        device: PathBuf,
        fs_type: FileSystem,
        details: String,
    },
    #[snafu(display("Failed to read the mount table: {}", source))]
    ReadMounts { source: std::io::Error },
}

impl MountError {
    /// Whether the error reports a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// An entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Mounted device, or source for pseudo filesystems.
    pub device: String,
    /// Where it's mounted.
    pub path: PathBuf,
    /// Filesystem type.
    pub fs_type: String,
    /// Mount options.
    pub options: Vec<String>,
}

/// Mounts, unmounts and inspects the mount table.
#[async_trait::async_trait]
pub trait Mounter: Send + Sync {
    /// Mounts `source` onto `target`. A `bind` option bind mounts `source`, which is then a path.
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError>;
    /// Unmounts `target`.
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;
    /// The current mount table.
    async fn list(&self) -> Result<Vec<MountPoint>, MountError>;
    /// Whether `path` is likely not a mount point, by comparing the device ids of the path and
    /// of its parent. Bind mounts of the same filesystem are not detected.
    /// A missing path yields `MountError::NotFound`.
    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError>;
    /// Creates the filesystem on the device unless it already carries one, then mounts it.
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FileSystem,
        options: &[String],
    ) -> Result<(), MountError> {
        crate::format::prepare_device(device, fs_type).await?;
        self.mount(
            &device.to_string_lossy(),
            target,
            Some(fs_type.as_ref()),
            options,
        )
        .await
    }
}

/// Every other mount point of the device mounted at `path`, ie all the mounts sharing the same
/// source, excluding `path` itself. Empty if nothing is mounted at `path`.
pub async fn get_mount_refs(
    mounter: &dyn Mounter,
    path: &Path,
) -> Result<Vec<PathBuf>, MountError> {
    let mounts = mounter.list().await?;
    let Some(device) = mounts
        .iter()
        .rev()
        .find(|mount| mount.path == path)
        .map(|mount| mount.device.clone())
    else {
        return Ok(vec![]);
    };
    Ok(mounts
        .into_iter()
        .filter(|mount| mount.device == device && mount.path != path)
        .map(|mount| mount.path)
        .collect())
}

/// The mount entry at the given path, if any.
pub async fn find_mount(
    mounter: &dyn Mounter,
    path: &Path,
) -> Result<Option<MountPoint>, MountError> {
    let mounts = mounter.list().await?;
    Ok(mounts.into_iter().rev().find(|mount| mount.path == path))
}

/// Mount options safe to log: secrets are masked.
pub fn redact(options: &[String]) -> Vec<String> {
    options
        .iter()
        .map(|option| match option.split_once('=') {
            Some((name @ ("password" | "pass"), _)) => format!("{name}=***"),
            _ => option.clone(),
        })
        .collect()
}

/// Parses a mount table in the `/proc/mounts` format.
pub fn parse_mounts(table: &str) -> Vec<MountPoint> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountPoint {
                device: unescape(device),
                path: PathBuf::from(unescape(path)),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(ToString::to_string).collect(),
            })
        })
        .collect()
}

/// Decodes the octal escapes (`\040` for a space) the kernel uses in the mount table.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 4 <= bytes.len() {
            let octal = &bytes[index + 1 .. index + 4];
            if octal.iter().all(|b| (b'0' ..= b'7').contains(b)) {
                let value = octal
                    .iter()
                    .fold(0u32, |value, b| value * 8 + (b - b'0') as u32);
                if let Ok(value) = u8::try_from(value) {
                    decoded.push(value);
                    index += 4;
                    continue;
                }
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::{fake::FakeMounter, *};

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sdc /var/lib/kubelet/plugins/kubernetes.io~azure-disk/mounts/disk-a ext4 rw,relatime 0 0
/dev/sdc /var/lib/kubelet/pods/uid\\0401/volumes/kubernetes.io~azure-disk/vol ext4 rw,relatime 0 0
";

    #[test]
    fn parse_table() {
        let mounts = parse_mounts(TABLE);
        assert_eq!(mounts.len(), 4);
        assert_eq!(mounts[0].device, "/dev/sda1");
        assert_eq!(mounts[1].options[0], "rw");
        assert_eq!(
            mounts[3].path,
            PathBuf::from("/var/lib/kubelet/pods/uid 1/volumes/kubernetes.io~azure-disk/vol")
        );
    }

    #[test]
    fn unescape_fields() {
        assert_eq!(unescape("a\\040b"), "a b");
        assert_eq!(unescape("tab\\011"), "tab\t");
        assert_eq!(unescape("back\\134slash"), "back\\slash");
        assert_eq!(unescape("short\\04"), "short\\04");
        assert_eq!(unescape("bad\\09x"), "bad\\09x");
    }

    #[tokio::test]
    async fn mount_refs() {
        let mounter = FakeMounter::default();
        mounter.with_table(TABLE);
        let global =
            Path::new("/var/lib/kubelet/plugins/kubernetes.io~azure-disk/mounts/disk-a");

        let refs = get_mount_refs(&mounter, global).await.unwrap();
        assert_eq!(
            refs,
            vec![PathBuf::from(
                "/var/lib/kubelet/pods/uid 1/volumes/kubernetes.io~azure-disk/vol"
            )]
        );
        assert!(get_mount_refs(&mounter, Path::new("/nothing"))
            .await
            .unwrap()
            .is_empty());
        assert!(find_mount(&mounter, Path::new("/proc"))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn secrets_are_redacted() {
        let options = ["vers=3.0", "username=store", "password=a2V5", "ro"].map(String::from);
        assert_eq!(
            redact(&options),
            vec!["vers=3.0", "username=store", "password=***", "ro"]
        );
    }
}
