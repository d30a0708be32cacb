//! Scans the scsi bus topology exposed in sysfs for Azure data disks.
//!
//! Every scsi device is listed under `bus/scsi/devices` as `<target>:<bus>:<lun>:<id>`.
//! Targets 0 to 2 carry the OS and resource disks and are never data disks.
//! A data disk is identified by its vendor and model strings, and its block device name is
//! the (single) entry of its `block` directory.
use crate::{
    dev::DeviceFinder,
    volume::{Lun, VolumeIdentity},
};

use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, trace};

const DATA_DISK_VENDOR: &str = "MSFT";
const DATA_DISK_MODEL: &str = "VIRTUAL DISK";
/// Targets up to and including this one are reserved for OS disks.
const RESERVED_TARGETS: u32 = 2;

static SCSI_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+):(\d+):(\d+):(\d+)$").expect("valid regex"));

/// The address of a scsi device, parsed from its sysfs entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScsiAddress {
    target: u32,
    lun: u32,
}

impl ScsiAddress {
    fn parse(name: &str) -> Option<Self> {
        let captures = SCSI_ADDRESS.captures(name)?;
        Some(Self {
            target: captures[1].parse().ok()?,
            lun: captures[3].parse().ok()?,
        })
    }
    fn is_data_disk_slot(&self) -> bool {
        self.target > RESERVED_TARGETS
    }
}

/// Finds Azure data disks on the scsi bus by lun.
#[derive(Debug, Clone)]
pub struct ScsiDeviceScanner {
    sysfs_dir: PathBuf,
    dev_dir: PathBuf,
}

impl ScsiDeviceScanner {
    /// Returns a new scanner of the sysfs tree mounted at `sysfs_dir`, resolving block devices
    /// under `dev_dir`.
    pub fn new(sysfs_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            dev_dir: dev_dir.into(),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.sysfs_dir.join("bus/scsi/devices")
    }

    /// The device of the data disk attached at the given lun, `None` if there's none.
    pub fn find_device_by_lun(&self, lun: Lun) -> std::io::Result<Option<PathBuf>> {
        for (name, address) in self.data_disk_slots()? {
            if address.lun != lun.value() {
                continue;
            }
            let entry = self.devices_dir().join(&name);
            if !is_data_disk(&entry) {
                trace!(entry = %name, "Skipping scsi device which is not a data disk");
                continue;
            }
            if let Some(block) = first_block_device(&entry)? {
                let device = self.dev_dir.join(block);
                debug!(%lun, device = %device.display(), "Found data disk");
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    /// The lun of the data disk exposed as the given device, `None` if it's not a data disk.
    pub fn find_lun_by_device_path(&self, device: &Path) -> std::io::Result<Option<Lun>> {
        let Some(device_name) = device.file_name() else {
            return Ok(None);
        };
        for (name, address) in self.data_disk_slots()? {
            let entry = self.devices_dir().join(&name);
            if !is_data_disk(&entry) {
                continue;
            }
            if first_block_device(&entry)?.as_deref() == Some(&*device_name.to_string_lossy()) {
                return Ok(Lun::new(address.lun));
            }
        }
        Ok(None)
    }

    /// Scsi device entries outside of the reserved targets, ordered by name.
    fn data_disk_slots(&self) -> std::io::Result<Vec<(String, ScsiAddress)>> {
        let entries = match std::fs::read_dir(self.devices_dir()) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(error),
        };
        let mut slots = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| ScsiAddress::parse(&name).map(|address| (name, address)))
            .filter(|(_, address)| address.is_data_disk_slot())
            .collect::<Vec<_>>();
        slots.sort();
        Ok(slots)
    }
}

impl DeviceFinder for ScsiDeviceScanner {
    fn find_device(&self, _disk: &VolumeIdentity, lun: Lun) -> std::io::Result<Option<PathBuf>> {
        self.find_device_by_lun(lun)
    }
    fn find_lun(&self, device: &Path) -> std::io::Result<Option<Lun>> {
        self.find_lun_by_device_path(device)
    }
}

/// Compares a sysfs attribute, ignoring case and the trailing padding the kernel adds.
fn attribute_is(entry: &Path, attribute: &str, expected: &str) -> bool {
    std::fs::read_to_string(entry.join(attribute))
        .map(|value| value.trim_end().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

fn is_data_disk(entry: &Path) -> bool {
    attribute_is(entry, "vendor", DATA_DISK_VENDOR) && attribute_is(entry, "model", DATA_DISK_MODEL)
}

fn first_block_device(entry: &Path) -> std::io::Result<Option<String>> {
    let entries = match std::fs::read_dir(entry.join("block")) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };
    let mut names = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names.into_iter().next())
}
