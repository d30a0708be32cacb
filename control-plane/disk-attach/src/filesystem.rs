//! This module consists of the filesystem type definition used when formatting and mounting
//! the global device mount.
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// A type to enumerate the filesystems a disk may be formatted with.
#[derive(EnumString, AsRefStr, EnumIter, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FileSystem {
    #[default]
    Ext4,
    Xfs,
    Btrfs,
}

impl FileSystem {
    /// The binary which creates this filesystem.
    pub fn mkfs_binary(&self) -> String {
        format!("mkfs.{}", self.as_ref())
    }
}

// Implement Display for the filesystem
impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// The filesystems which can be created on this node, ie whose mkfs binary is available.
pub fn probe_filesystems() -> Vec<FileSystem> {
    use strum::IntoEnumIterator;
    FileSystem::iter()
        .filter(|fs| which::which(fs.mkfs_binary()).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::FileSystem;
    use std::str::FromStr;

    #[test]
    fn parse() {
        assert_eq!(FileSystem::from_str("ext4").unwrap(), FileSystem::Ext4);
        assert_eq!(FileSystem::from_str("XFS").unwrap(), FileSystem::Xfs);
        assert!(FileSystem::from_str("ntfs").is_err());
        assert_eq!(FileSystem::default().mkfs_binary(), "mkfs.ext4");
    }
}
