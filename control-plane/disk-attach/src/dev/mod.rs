//! Discovery of the kernel block device backing an attached disk.
//!
//! The cloud provider only reports the LUN (or slot) it attached a disk at. How that slot
//! materializes on the node differs per provider:
//! ```ignore
//!     // azure: scan the scsi bus for the MSFT virtual disk at the lun
//!     let finder = ScsiDeviceScanner::new("/sys", "/dev");
//!     // aws/openstack: look for the device name the slot was requested as
//!     let finder = NamedDeviceFinder::new(DeviceNameScheme::Ebs, "/dev");
//!
//!     if let Some(path) = finder.find_device(&identity, lun)? {
//!         // device is present
//!     }
//! ```
//! Not finding a device is not an error, callers poll until it shows up.

/// Device name based discovery.
pub mod named;
/// Scsi bus based discovery.
pub mod scsi;

pub use named::{DeviceNameScheme, NamedDeviceFinder};
pub use scsi::ScsiDeviceScanner;

use crate::volume::{Lun, VolumeIdentity};
use std::path::{Path, PathBuf};

/// Maps attachment slots to kernel block devices and back.
pub trait DeviceFinder: Send + Sync {
    /// The device of the disk attached at the given lun, if present.
    fn find_device(&self, disk: &VolumeIdentity, lun: Lun) -> std::io::Result<Option<PathBuf>>;
    /// The lun the given device is attached at, if it is one of ours.
    fn find_lun(&self, device: &Path) -> std::io::Result<Option<Lun>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    /// Devices which are present, by lun.
    #[derive(Default)]
    pub(crate) struct FakeFinder {
        pub(crate) devices: Mutex<HashMap<Lun, PathBuf>>,
    }

    impl FakeFinder {
        pub(crate) fn plug(&self, lun: Lun, device: impl Into<PathBuf>) {
            self.devices.lock().unwrap().insert(lun, device.into());
        }
    }

    impl DeviceFinder for FakeFinder {
        fn find_device(
            &self,
            _disk: &VolumeIdentity,
            lun: Lun,
        ) -> std::io::Result<Option<PathBuf>> {
            Ok(self.devices.lock().unwrap().get(&lun).cloned())
        }
        fn find_lun(&self, device: &Path) -> std::io::Result<Option<Lun>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .find(|(_, path)| path.as_path() == device)
                .map(|(lun, _)| *lun))
        }
    }
}
