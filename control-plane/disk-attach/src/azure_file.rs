//! Azure File shares.
//!
//! A share is not attached to the node: its storage account key is read from the pod's secret,
//! the share is created on first use and then mounted over cifs into the pod volume directory.
use crate::{
    cloud::{
        azure::{FileShares, StorageAccountKey},
        SecretStore,
    },
    error::{Credentials, FileShare},
    volume::AzureFileVolume,
    Error,
};

use snafu::ResultExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Domain of the storage account file endpoints.
pub const FILE_ENDPOINT_DOMAIN: &str = "file.core.windows.net";

/// Prepares Azure File shares for mounting.
pub struct AzureFileService {
    secrets: Arc<dyn SecretStore>,
    shares: Arc<dyn FileShares>,
}

impl AzureFileService {
    /// Returns a new service reading account keys from `secrets`.
    pub fn new(secrets: Arc<dyn SecretStore>, shares: Arc<dyn FileShares>) -> Self {
        Self { secrets, shares }
    }

    /// Fetches the storage account key and creates the share if it does not exist yet.
    pub async fn set_up_share(&self, volume: &AzureFileVolume) -> Result<StorageAccountKey, Error> {
        let share = volume.share_name.as_str();
        let key = StorageAccountKey::load(
            self.secrets.as_ref(),
            &volume.secret_namespace,
            &volume.secret_name,
        )
        .await
        .context(Credentials { share })?;

        let created = self
            .shares
            .create_share_if_not_exists(&volume.account_name, key.expose(), share)
            .await
            .context(FileShare {
                account: &volume.account_name,
                share,
            })?;
        if created {
            info!(account = %volume.account_name, share, "Azure file share created");
        } else {
            debug!(account = %volume.account_name, share, "Azure file share already exists");
        }
        Ok(key)
    }
}

/// The cifs source of the share, `//<account>.file.core.windows.net/<share>`.
pub fn share_source(volume: &AzureFileVolume) -> String {
    format!(
        "//{}.{FILE_ENDPOINT_DOMAIN}/{}",
        volume.account_name, volume.share_name
    )
}

/// The cifs mount options authenticating with the account key.
pub fn mount_options(volume: &AzureFileVolume, key: &StorageAccountKey) -> Vec<String> {
    let mut options = vec![
        "vers=3.0".to_string(),
        format!("username={}", volume.account_name),
        format!("password={}", key.expose()),
        "dir_mode=0777".to_string(),
        "file_mode=0777".to_string(),
    ];
    if volume.read_only {
        options.push("ro".to_string());
    }
    options
}
