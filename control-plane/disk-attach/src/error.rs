//! Definition of the errors returned by the attach, detach and mount operations.
use crate::{
    cloud::{azure::CredentialsError, ApiError, CloudError},
    mount::MountError,
};

use snafu::Snafu;
use std::{path::PathBuf, time::Duration};

/// Attach, detach and mount lifecycle error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to {} volume '{}': {}", operation, volume, source))]
    Cloud {
        operation: &'static str,
        volume: String,
        source: CloudError,
    },
    #[snafu(display("Mount operation failed for volume '{}': {}", volume, source))]
    Mount { volume: String, source: MountError },
    #[snafu(display(
        "Could not find attached disk '{}', timeout waiting for the device after {:?}",
        volume,
        elapsed
    ))]
    DeviceNotFound { volume: String, elapsed: Duration },
    #[snafu(display("Timeout reached, device {} is still attached after {:?}", device.display(), elapsed))]
    DeviceStillAttached { device: PathBuf, elapsed: Duration },
    #[snafu(display("Error checking if device path {} exists: {}", device.display(), source))]
    DeviceCheck {
        device: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Invalid attach token '{}' for volume '{}': {}", token, volume, reason))]
    InvalidAttachToken {
        volume: String,
        token: String,
        reason: String,
    },
    #[snafu(display("Path {} is not a global mount path of plugin {}", path.display(), plugin))]
    InvalidGlobalPath { plugin: String, path: PathBuf },
    #[snafu(display("No cloud provider configured for plugin {}", plugin))]
    ProviderNotConfigured { plugin: String },
    #[snafu(display("Volume plugin {} does not support attaching", plugin))]
    NotAttachable { plugin: String },
    #[snafu(display("Failed to get the instance id of node '{}': {}", node, source))]
    InstanceId { node: String, source: ApiError },
    #[snafu(display("iscsiadm failed for target {}: {}", target, details))]
    Iscsi { target: String, details: String },
    #[snafu(display("Invalid volume source: {}", details))]
    InvalidSource { details: String },
    #[snafu(display("Couldn't get the account key of share '{}': {}", share, source))]
    Credentials {
        share: String,
        source: CredentialsError,
    },
    #[snafu(display("Failed to create azure file share '{}' of account '{}': {}", share, account, source))]
    FileShare {
        account: String,
        share: String,
        source: ApiError,
    },
    #[snafu(display("Failed to take the node wide lock of '{}': {}", key, source))]
    NodeLock {
        key: String,
        source: std::io::Error,
    },
    #[snafu(display("IO error on {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// Whether the error reports the volume as absent from the instance, which best-effort
    /// detach and cleanup paths treat as success.
    pub fn is_volume_not_found(&self) -> bool {
        matches!(
            self,
            Self::Cloud {
                source: CloudError::VolumeNotFound { .. },
                ..
            }
        )
    }
}
