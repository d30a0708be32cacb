//! Volume sources as handed over by the volume spec resolver, and the identities derived
//! from them.
use crate::{filesystem::FileSystem, plugin::PluginKind};

use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, str::FromStr};
use strum_macros::{AsRefStr, EnumString};
use url::Url;

/// Number of LUN slots on an instance's virtual scsi bus.
pub const MAX_LUNS: usize = 64;

/// Logical Unit Number: the slot of a disk on an instance's virtual scsi bus, in [0, 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Lun(u8);

impl Lun {
    /// Returns the lun for the given value, if within range.
    pub fn new(value: u32) -> Option<Self> {
        (value < MAX_LUNS as u32).then_some(Self(value as u8))
    }
    /// The numeric value.
    pub fn value(&self) -> u32 {
        self.0 as u32
    }
    /// The slot index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
    /// Every lun, in ascending order.
    pub fn all() -> impl Iterator<Item = Lun> {
        (0 .. MAX_LUNS as u8).map(Lun)
    }
}

impl std::fmt::Display for Lun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for Lun {
    type Error = String;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Lun::new(value).ok_or_else(|| format!("lun {value} is out of range [0, {MAX_LUNS})"))
    }
}

impl From<Lun> for u32 {
    fn from(lun: Lun) -> Self {
        lun.value()
    }
}

impl FromStr for Lun {
    type Err = String;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value
            .parse::<u32>()
            .map_err(|error| format!("invalid lun '{value}': {error}"))?;
        Lun::try_from(value)
    }
}

/// Uniquely identifies a logical disk for a given provider.
/// The disk name is the key used for locking and for the global mount path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeIdentity {
    name: String,
    uri: Option<String>,
}

impl VolumeIdentity {
    /// Identity made of a disk name only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
        }
    }
    /// Identity made of a disk name and the uri of its backing blob.
    pub fn with_uri(name: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            name: name.into(),
            uri: (!uri.is_empty()).then_some(uri),
        }
    }
    /// The disk name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The backing blob uri, if known.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }
    /// The key under which operations on this disk are serialized.
    pub fn lock_key(&self) -> &str {
        &self.name
    }
    /// Whether a provider disk entry with the given name and uri refers to this identity.
    /// Either a matching non-empty name or a matching non-empty uri is sufficient.
    pub fn matches(&self, name: Option<&str>, uri: Option<&str>) -> bool {
        let name_match = matches!(name, Some(name) if !self.name.is_empty() && name == self.name);
        let uri_match = match (self.uri(), uri) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        };
        name_match || uri_match
    }
}

impl std::fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Host caching applied to an attached data disk.
#[derive(
    EnumString, AsRefStr, Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum CachingMode {
    None,
    ReadOnly,
    #[default]
    ReadWrite,
}

/// A disk provided by a cloud provider and attached through its compute api.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudDisk {
    /// The disk identity.
    pub identity: VolumeIdentity,
    /// Filesystem created on first use.
    pub fs_type: FileSystem,
    /// Host caching mode requested for the attachment.
    pub caching: CachingMode,
    /// Partition to mount, instead of the whole device.
    pub partition: Option<u32>,
    /// Mount read only.
    pub read_only: bool,
}

impl CloudDisk {
    /// A read-write ext4 disk with default caching.
    pub fn new(identity: VolumeIdentity) -> Self {
        Self {
            identity,
            fs_type: FileSystem::default(),
            caching: CachingMode::default(),
            partition: None,
            read_only: false,
        }
    }
}

/// An iSCSI target lun, logged in to directly from the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiDisk {
    /// Target portal, as `host:port`.
    pub portal: String,
    /// Target qualified name.
    pub iqn: String,
    /// Lun within the target.
    pub lun: Lun,
    /// Filesystem created on first use.
    pub fs_type: FileSystem,
    /// Mount read only.
    pub read_only: bool,
}

impl IscsiDisk {
    /// Identity of the target lun, used for locking.
    pub fn identity(&self) -> VolumeIdentity {
        VolumeIdentity::new(format!("{}/{}/lun-{}", self.portal, self.iqn, self.lun))
    }
}

impl TryFrom<&Url> for IscsiDisk {
    type Error = String;

    /// Parses `iscsi://<host>[:port]/<iqn>/<lun>`.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if url.scheme() != "iscsi" {
            return Err(format!("unsupported scheme: {}", url.scheme()));
        }
        let host = url.host_str().ok_or_else(|| "missing host".to_string())?;
        let port = url.port().unwrap_or(3260);

        let segments: Vec<&str> = url
            .path_segments()
            .ok_or_else(|| "no path segment".to_string())?
            .collect();
        let (iqn, lun) = match segments.as_slice() {
            [iqn, lun] if !iqn.is_empty() => (iqn.to_string(), lun.parse::<Lun>()?),
            [iqn] if !iqn.is_empty() => (iqn.to_string(), Lun(0)),
            _ => return Err("expected an iqn and an optional lun as path".to_string()),
        };

        Ok(Self {
            portal: format!("{host}:{port}"),
            iqn,
            lun,
            fs_type: FileSystem::default(),
            read_only: false,
        })
    }
}

/// A glusterfs volume, mounted straight into the pod directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlusterfsVolume {
    /// Endpoint hosts serving the volume.
    pub hosts: Vec<String>,
    /// Glusterfs volume path.
    pub path: String,
    /// Mount read only.
    pub read_only: bool,
}

/// An Azure file share, mounted over cifs straight into the pod directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureFileVolume {
    /// Namespace of the secret holding the storage account key, the pod's namespace.
    pub secret_namespace: String,
    /// Name of the secret holding the storage account key.
    pub secret_name: String,
    /// Storage account owning the share.
    pub account_name: String,
    /// Name of the share, created if it doesn't exist yet.
    pub share_name: String,
    /// Mount read only.
    pub read_only: bool,
}

/// The typed source of a pod volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    AzureDisk(CloudDisk),
    AwsEbs(CloudDisk),
    Cinder(CloudDisk),
    Iscsi(IscsiDisk),
    Glusterfs(GlusterfsVolume),
    AzureFile(AzureFileVolume),
}

impl VolumeSource {
    /// The plugin handling this source.
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::AzureDisk(_) => PluginKind::AzureDisk,
            Self::AwsEbs(_) => PluginKind::AwsEbs,
            Self::Cinder(_) => PluginKind::Cinder,
            Self::Iscsi(_) => PluginKind::Iscsi,
            Self::Glusterfs(_) => PluginKind::Glusterfs,
            Self::AzureFile(_) => PluginKind::AzureFile,
        }
    }
    /// Whether the volume is mounted read only.
    pub fn read_only(&self) -> bool {
        match self {
            Self::AzureDisk(disk) | Self::AwsEbs(disk) | Self::Cinder(disk) => disk.read_only,
            Self::Iscsi(disk) => disk.read_only,
            Self::Glusterfs(volume) => volume.read_only,
            Self::AzureFile(volume) => volume.read_only,
        }
    }
    /// The identity of the backing disk, for attachable sources.
    pub fn identity(&self) -> Option<VolumeIdentity> {
        match self {
            Self::AzureDisk(disk) | Self::AwsEbs(disk) | Self::Cinder(disk) => {
                Some(disk.identity.clone())
            }
            Self::Iscsi(disk) => Some(disk.identity()),
            Self::Glusterfs(_) | Self::AzureFile(_) => None,
        }
    }
    /// The cloud disk payload, for cloud provider sources.
    pub fn cloud_disk(&self) -> Option<&CloudDisk> {
        match self {
            Self::AzureDisk(disk) | Self::AwsEbs(disk) | Self::Cinder(disk) => Some(disk),
            _ => None,
        }
    }
}

/// A named volume of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Volume name within the pod.
    pub name: String,
    /// Where the volume comes from.
    pub source: VolumeSource,
}
