//! Node side disk attach, detach and mount lifecycle.
//!
//! A pod volume backed by a cloud disk goes through:
//! attach (cloud api) -> wait for the kernel device -> format and mount once at the
//! node global path -> bind mount into every consuming pod directory.
//! Teardown reverses this and only detaches the disk once the global mount is the last
//! remaining reference in the live mount table.

/// Azure File shares.
pub mod azure_file;
/// Pod volume SetUp and TearDown.
pub mod binder;
/// Cloud provider disk clients.
pub mod cloud;
/// Device discovery.
pub mod dev;
/// Error types.
pub mod error;
/// Filesystem type definition.
pub mod filesystem;
/// Node directory layout.
pub mod host;
/// Keyed lock registry.
pub mod keyed_lock;
/// Mount table primitives.
pub mod mount;
/// Volume plugin capability set and dispatch.
pub mod plugin;
/// Dynamic provisioning of cloud disks.
pub mod provision;
/// Volume sources and identities.
pub mod volume;

mod attacher;
mod detacher;
mod format;
mod iscsi;
mod wait;

pub use attacher::DiskAttacher;
pub use detacher::DiskDetacher;
pub use error::Error;
pub use iscsi::{IscsiAdm, IscsiAdmCommand, IscsiPlugin};

use std::time::Duration;

/// Tunables shared by the attach, detach and mount machinery.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name of the node this instance runs on.
    pub node_name: String,
    /// Root of the pod and plugin directories.
    pub root_dir: std::path::PathBuf,
    /// Sysfs mount point, used to scan the scsi bus.
    pub sysfs_dir: std::path::PathBuf,
    /// Device node directory.
    pub dev_dir: std::path::PathBuf,
    /// Interval between device presence checks.
    pub poll_interval: Duration,
    /// How long to wait for an attached device to show up.
    pub attach_timeout: Duration,
    /// How long to wait for a detached device to go away.
    pub detach_timeout: Duration,
}

impl NodeConfig {
    /// Configuration with the default directories and timeouts for the given node.
    pub fn new(node_name: impl Into<String>) -> Self {
        fn duration(value: &str) -> Duration {
            humantime::parse_duration(value).unwrap_or(Duration::from_secs(1))
        }
        Self {
            node_name: node_name.into(),
            root_dir: utils::DEFAULT_ROOT_DIR.into(),
            sysfs_dir: utils::DEFAULT_SYSFS_DIR.into(),
            dev_dir: utils::DEFAULT_DEV_DIR.into(),
            poll_interval: duration(utils::DEVICE_POLL_INTERVAL),
            attach_timeout: duration(utils::DEFAULT_ATTACH_TIMEOUT),
            detach_timeout: duration(utils::DEFAULT_DETACH_TIMEOUT),
        }
    }
}
