/// Various common constants used by the node disk attach components.

/// The product name.
pub const PRODUCT_NAME: &str = "disk-attach";

/// The domain under which the in-tree volume plugins are registered.
pub const PLUGIN_DOMAIN_NAME: &str = "kubernetes.io";

/// Default kubelet root directory, under which pod and plugin directories live.
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/kubelet";

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_DIR: &str = "/sys";

/// Default device node directory.
pub const DEFAULT_DEV_DIR: &str = "/dev";

/// Interval between two device presence checks while waiting for an attach or a detach.
pub const DEVICE_POLL_INTERVAL: &str = "1s";

/// Default time to wait for an attached device to show up.
pub const DEFAULT_ATTACH_TIMEOUT: &str = "2m";

/// Default time to wait for a detached device to go away.
pub const DEFAULT_DETACH_TIMEOUT: &str = "2m";

/// Default azure storage account type used for dynamically provisioned disks.
pub const DEFAULT_AZURE_DISK_KIND: &str = "Standard_LRS";

/// Default azure location used for dynamically provisioned disks.
pub const DEFAULT_AZURE_LOCATION: &str = "eastus";

/// Default listen address of the host mount daemon.
pub const DEFAULT_MOUNT_DAEMON_BIND: &str = "127.0.0.1:3000";

/// Where the host root is visible from a containerized node agent.
pub const DEFAULT_HOST_BIND_PATH: &str = "/rootfs";

/// Maximum length of a dynamically provisioned disk name.
pub const MAX_VOLUME_NAME_LEN: usize = 255;

/// The fully qualified name of a volume plugin.
pub fn plugin_name(short_name: &str) -> String {
    format!("{PLUGIN_DOMAIN_NAME}/{short_name}")
}
