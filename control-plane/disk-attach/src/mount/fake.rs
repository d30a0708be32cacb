//! In memory mount table used by the tests.
use super::{parse_mounts, MountError, MountPoint, Mounter};
use crate::filesystem::FileSystem;

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

/// Records mounts in memory. Paths must exist on the real filesystem for the mount point
/// check, which is answered from the in memory table.
#[derive(Default)]
pub(crate) struct FakeMounter {
    table: Mutex<Vec<MountPoint>>,
    pub(crate) fail_mount: AtomicBool,
    pub(crate) formats: AtomicUsize,
}

impl FakeMounter {
    pub(crate) fn with_table(&self, table: &str) {
        *self.table.lock().unwrap() = parse_mounts(table);
    }
    pub(crate) fn mounts(&self) -> Vec<MountPoint> {
        self.table.lock().unwrap().clone()
    }
    pub(crate) fn is_mounted(&self, path: &Path) -> bool {
        self.table.lock().unwrap().iter().any(|m| m.path == path)
    }
}

#[async_trait::async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(MountError::MountFailed {
                device: source.to_string(),
                target: target.to_path_buf(),
                source: std::io::Error::from_raw_os_error(einval()),
            });
        }
        let mut table = self.table.lock().unwrap();
        let bind = options.iter().any(|o| o == "bind");
        // bind mounts show up with the device of the mount they re-expose
        let origin = table
            .iter()
            .rev()
            .find(|m| bind && m.path == Path::new(source));
        let (device, fs_type) = match origin {
            Some(origin) => (origin.device.clone(), origin.fs_type.clone()),
            None => (source.to_string(), fs_type.unwrap_or("none").to_string()),
        };
        table.push(MountPoint {
            device,
            path: target.to_path_buf(),
            fs_type,
            options: options.to_vec(),
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut table = self.table.lock().unwrap();
        match table.iter().rposition(|m| m.path == target) {
            Some(index) => {
                table.remove(index);
                Ok(())
            }
            None => Err(MountError::UnmountFailed {
                target: target.to_path_buf(),
                source: std::io::Error::from_raw_os_error(einval()),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<MountPoint>, MountError> {
        Ok(self.mounts())
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        if !path.exists() {
            return Err(MountError::NotFound {
                path: PathBuf::from(path),
            });
        }
        Ok(!self.is_mounted(path))
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FileSystem,
        options: &[String],
    ) -> Result<(), MountError> {
        self.formats.fetch_add(1, Ordering::SeqCst);
        self.mount(
            &device.to_string_lossy(),
            target,
            Some(fs_type.as_ref()),
            options,
        )
        .await
    }
}

fn einval() -> i32 {
    nix::errno::Errno::EINVAL as i32
}
