//! Device discovery through the device names a provider assigns to attachment slots.
use crate::{
    dev::DeviceFinder,
    volume::{Lun, VolumeIdentity},
};

use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, EnumString};

/// Bijective base-26 lowercase letters of a zero based index: a..z, aa..az, ba..
pub fn device_letters(index: usize) -> String {
    let mut letters = Vec::new();
    let mut value = index + 1;
    while value > 0 {
        value -= 1;
        letters.push(b'a' + (value % 26) as u8);
        value /= 26;
    }
    letters.iter().rev().map(|b| *b as char).collect()
}

/// Inverse of `device_letters`.
pub fn parse_device_letters(letters: &str) -> Option<usize> {
    if letters.is_empty() || !letters.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    letters
        .bytes()
        .try_fold(0usize, |value, b| {
            value.checked_mul(26)?.checked_add((b - b'a') as usize + 1)
        })
        .map(|value| value - 1)
}

/// How a provider names the device of an attachment slot.
#[derive(EnumString, AsRefStr, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceNameScheme {
    /// `/dev/xvdba` .. `/dev/xvddl`, exposed by the kernel as either xvd or sd.
    Ebs,
    /// `/dev/vdb` onwards, `vda` being the root disk.
    Cinder,
}

impl DeviceNameScheme {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Ebs => "xvd",
            Self::Cinder => "vd",
        }
    }
    fn offset(&self) -> usize {
        match self {
            Self::Ebs => 52,
            Self::Cinder => 1,
        }
    }

    /// The device name requested from the provider for the given lun.
    pub fn device_name(&self, lun: Lun) -> String {
        format!(
            "/dev/{}{}",
            self.prefix(),
            device_letters(lun.index() + self.offset())
        )
    }

    /// The lun of a provider device name, with or without the `/dev/` prefix.
    pub fn lun_of(&self, device_name: &str) -> Option<Lun> {
        let name = device_name.strip_prefix("/dev/").unwrap_or(device_name);
        let letters = match self {
            Self::Ebs => name
                .strip_prefix("xvd")
                .or_else(|| name.strip_prefix("sd"))?,
            Self::Cinder => name.strip_prefix("vd")?,
        };
        let index = parse_device_letters(letters)?.checked_sub(self.offset())?;
        Lun::new(u32::try_from(index).ok()?)
    }

    /// Kernel device names the attachment may show up as, in order of preference.
    fn candidates(&self, dev_dir: &Path, disk: &VolumeIdentity, lun: Lun) -> Vec<PathBuf> {
        let letters = device_letters(lun.index() + self.offset());
        match self {
            Self::Ebs => vec![
                dev_dir.join(format!("xvd{letters}")),
                dev_dir.join(format!("sd{letters}")),
            ],
            Self::Cinder => {
                // virtio serials are truncated to 20 characters
                let serial = disk.name().chars().take(20).collect::<String>();
                vec![
                    dev_dir.join("disk/by-id").join(format!("virtio-{serial}")),
                    dev_dir.join(format!("vd{letters}")),
                ]
            }
        }
    }
}

/// Finds devices under a device directory using a provider device name scheme.
#[derive(Debug, Clone)]
pub struct NamedDeviceFinder {
    scheme: DeviceNameScheme,
    dev_dir: PathBuf,
}

impl NamedDeviceFinder {
    /// Returns a new finder for the scheme, looking under `dev_dir`.
    pub fn new(scheme: DeviceNameScheme, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            scheme,
            dev_dir: dev_dir.into(),
        }
    }
}

impl DeviceFinder for NamedDeviceFinder {
    fn find_device(
        &self,
        disk: &VolumeIdentity,
        lun: Lun,
    ) -> std::io::Result<Option<PathBuf>> {
        for candidate in self.scheme.candidates(&self.dev_dir, disk, lun) {
            match candidate.try_exists() {
                Ok(true) => return Ok(Some(candidate)),
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(
                        device = %candidate.display(),
                        %error,
                        "Error verifying device path"
                    );
                }
            }
        }
        Ok(None)
    }

    fn find_lun(&self, device: &Path) -> std::io::Result<Option<Lun>> {
        let name = device.file_name().and_then(|name| name.to_str());
        Ok(name.and_then(|name| self.scheme.lun_of(name)))
    }
}
