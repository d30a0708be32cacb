use super::{parse_mounts, redact, MountError, MountPoint, Mounter};

use nix::errno::Errno;
use std::path::{Path, PathBuf};
use sys_mount::{unmount, Mount, MountFlags, UnmountFlags};
use tokio::process::Command;
use tracing::debug;

/// Filesystems which need the `mount.<type>` helper of the `mount` executable, either to start
/// a userspace daemon or to resolve the server name.
const HELPER_FILESYSTEMS: [&str; 2] = ["glusterfs", "cifs"];

/// Mounts through the mount syscalls and reads the mount table from procfs.
#[derive(Debug, Clone)]
pub struct LinuxMounter {
    mount_table: PathBuf,
}

impl Default for LinuxMounter {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }
}

impl LinuxMounter {
    /// Returns a mounter reading the system mount table.
    pub fn new() -> Self {
        Self::default()
    }
    /// Returns a mounter reading the given mount table, eg: the host's one from a container.
    pub fn with_mount_table(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }
}

/// Splits mount options into syscall flags and the remaining filesystem specific data.
fn mount_flags(options: &[String]) -> (MountFlags, String) {
    let mut flags = MountFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "bind" => flags |= MountFlags::BIND,
            "ro" => flags |= MountFlags::RDONLY,
            "rw" => {}
            "remount" => flags |= MountFlags::REMOUNT,
            "nosuid" => flags |= MountFlags::NOSUID,
            "nodev" => flags |= MountFlags::NODEV,
            "noexec" => flags |= MountFlags::NOEXEC,
            "noatime" => flags |= MountFlags::NOATIME,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

fn to_io(error: Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(error as i32)
}

/// Mounts through the `mount` executable.
async fn mount_with_helper(
    source: &str,
    target: &Path,
    fs_type: &str,
    options: &[String],
) -> Result<(), MountError> {
    let failed = |source_error: std::io::Error| MountError::MountFailed {
        device: source.to_string(),
        target: target.to_path_buf(),
        source: source_error,
    };
    let mut command = Command::new("mount");
    command.args(["-t", fs_type, source]).arg(target);
    if !options.is_empty() {
        command.args(["-o", &options.join(",")]);
    }
    let output = command.output().await.map_err(failed)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(failed(std::io::Error::new(std::io::ErrorKind::Other, stderr)));
    }
    Ok(())
}

#[async_trait::async_trait]
impl Mounter for LinuxMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError> {
        debug!(source, target = %target.display(), ?fs_type, options = ?redact(options), "Mounting");
        if let Some(fs_type) = fs_type.filter(|fs| HELPER_FILESYSTEMS.contains(fs)) {
            return mount_with_helper(source, target, fs_type, options).await;
        }
        let (flags, data) = mount_flags(options);

        let mut builder = Mount::builder().flags(flags);
        if let Some(fs_type) = fs_type.filter(|_| !flags.contains(MountFlags::BIND)) {
            builder = builder.fstype(fs_type);
        }
        if !data.is_empty() {
            builder = builder.data(&data);
        }
        builder
            .mount(source, target)
            .map_err(|source_error| MountError::MountFailed {
                device: source.to_string(),
                target: target.to_path_buf(),
                source: source_error,
            })?;

        // the kernel ignores the read only flag on the initial bind mount
        if flags.contains(MountFlags::BIND | MountFlags::RDONLY) {
            Mount::builder()
                .flags(MountFlags::BIND | MountFlags::REMOUNT | MountFlags::RDONLY)
                .mount("none", target)
                .map_err(|source_error| MountError::MountFailed {
                    device: source.to_string(),
                    target: target.to_path_buf(),
                    source: source_error,
                })?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        debug!(target = %target.display(), "Unmounting");
        unmount(target, UnmountFlags::empty()).map_err(|source| MountError::UnmountFailed {
            target: target.to_path_buf(),
            source,
        })
    }

    async fn list(&self) -> Result<Vec<MountPoint>, MountError> {
        let table = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|source| MountError::ReadMounts { source })?;
        Ok(parse_mounts(&table))
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        let stat = |path: &Path| -> Result<u64, MountError> {
            match nix::sys::stat::lstat(path) {
                Ok(stat) => Ok(stat.st_dev as u64),
                Err(Errno::ENOENT) => Err(MountError::NotFound {
                    path: path.to_path_buf(),
                }),
                Err(error) => Err(MountError::Stat {
                    path: path.to_path_buf(),
                    source: to_io(error),
                }),
            }
        };
        let device = stat(path)?;
        let parent_device = stat(&path.join(".."))?;
        Ok(device == parent_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_to_flags() {
        let options = ["bind", "ro", "discard"].map(String::from);
        let (flags, data) = mount_flags(&options);
        assert!(flags.contains(MountFlags::BIND | MountFlags::RDONLY));
        assert_eq!(data, "discard");

        let (flags, data) = mount_flags(&[]);
        assert!(flags.is_empty());
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn mount_point_detection() {
        let mounter = LinuxMounter::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(mounter.is_likely_not_mount_point(dir.path()).await.unwrap());

        let missing = dir.path().join("missing");
        let error = mounter
            .is_likely_not_mount_point(&missing)
            .await
            .unwrap_err();
        assert!(error.is_not_found());

        // procfs is a different filesystem than its parent
        assert!(!mounter
            .is_likely_not_mount_point(Path::new("/proc"))
            .await
            .unwrap());
    }
}
