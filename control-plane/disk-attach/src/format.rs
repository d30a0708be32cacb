//! Utility function for formatting a device with filesystem
use crate::{filesystem::FileSystem, mount::MountError};

use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// `blkid` exit code when the device carries no recognizable signature.
const BLKID_NOT_FOUND: i32 = 2;

/// Probes the filesystem type of a device, `None` if it's blank.
pub(crate) async fn probe_filesystem(device: &Path) -> Result<Option<String>, MountError> {
    let binary = "blkid";
    let output = Command::new(binary)
        .args(["-p", "-s", "TYPE", "-o", "value"])
        .arg(device)
        .output()
        .await
        .map_err(|error| MountError::Format {
            device: device.to_path_buf(),
            fs_type: FileSystem::default(),
            details: format!("failed to execute {binary}: {error}"),
        })?;

    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok((!fs.is_empty()).then_some(fs))
        }
        Some(BLKID_NOT_FOUND) => Ok(None),
        _ => Err(MountError::Format {
            device: device.to_path_buf(),
            fs_type: FileSystem::default(),
            details: format!(
                "{binary} command failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ),
        }),
    }
}

/// Creates the filesystem on the device unless it already carries one.
/// An existing filesystem is never overwritten, even if of a different type.
pub(crate) async fn prepare_device(device: &Path, fs_type: FileSystem) -> Result<(), MountError> {
    debug!("Probing device {}", device.display());

    if let Some(existing) = probe_filesystem(device).await? {
        if existing != fs_type.as_ref() {
            warn!(
                device = %device.display(),
                %existing,
                requested = %fs_type,
                "Device already carries a different filesystem, leaving it untouched"
            );
        } else {
            debug!("Found existing filesystem ({}) on device {}", existing, device.display());
        }
        return Ok(());
    }

    debug!("Creating new filesystem ({}) on device {}", fs_type, device.display());
    let binary = fs_type.mkfs_binary();
    let output = Command::new(&binary)
        .args(force_flag(fs_type))
        .arg(device)
        .output()
        .await
        .map_err(|error| MountError::Format {
            device: device.to_path_buf(),
            fs_type,
            details: format!("failed to execute {binary}: {error}"),
        })?;
    if !output.status.success() {
        return Err(MountError::Format {
            device: device.to_path_buf(),
            fs_type,
            details: format!(
                "{binary} command failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }
    Ok(())
}

/// The flag which stops the mkfs binary from prompting on whole disk devices.
fn force_flag(fs_type: FileSystem) -> &'static [&'static str] {
    match fs_type {
        FileSystem::Ext4 => &["-F"],
        FileSystem::Xfs | FileSystem::Btrfs => &["-f"],
    }
}
