use crate::{
    cloud::{
        next_free_lun, Api, ApiError, AttachFailed, CloudDiskClient, CloudError, DetachFailed,
        InstanceNotFound, LunInUse, NoFreeLun, ProvisionedDisk, SecretStore, VolumeNotFound,
    },
    volume::{CachingMode, Lun, VolumeIdentity},
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A VHD blob backing a data disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHardDisk {
    pub uri: Option<String>,
}

/// A data disk entry of a virtual machine storage profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    pub name: Option<String>,
    pub lun: Option<Lun>,
    pub vhd: Option<VirtualHardDisk>,
    pub caching: Option<CachingMode>,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: Option<u64>,
}

impl DataDisk {
    fn uri(&self) -> Option<&str> {
        self.vhd.as_ref().and_then(|vhd| vhd.uri.as_deref())
    }
    fn refers_to(&self, disk: &VolumeIdentity) -> bool {
        disk.matches(self.name.as_deref(), self.uri())
    }
}

/// The part of a virtual machine which the attach protocol reads and writes back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub location: String,
    pub data_disks: Vec<DataDisk>,
}

/// Virtual machine resource api.
#[async_trait::async_trait]
pub trait VirtualMachines: Send + Sync {
    /// Gets the virtual machine, `None` if it does not exist.
    async fn get(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>, ApiError>;
    /// Replaces the virtual machine's data disk list.
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        vm: VirtualMachine,
    ) -> Result<(), ApiError>;
}

/// Storage account blob api, where VHDs live.
#[async_trait::async_trait]
pub trait StorageAccounts: Send + Sync {
    /// Creates a page blob VHD of the given size.
    async fn create_vhd(
        &self,
        name: &str,
        kind: &str,
        location: &str,
        size_gib: u64,
    ) -> Result<ProvisionedDisk, ApiError>;
    /// Deletes the VHD.
    async fn delete_vhd(&self, name: &str, uri: &str) -> Result<(), ApiError>;
}

/// File service of the storage accounts, where Azure File shares live.
#[async_trait::async_trait]
pub trait FileShares: Send + Sync {
    /// Creates the share unless it already exists. Returns whether it was created.
    async fn create_share_if_not_exists(
        &self,
        account_name: &str,
        account_key: &str,
        share_name: &str,
    ) -> Result<bool, ApiError>;
}

/// Service principal credentials of an Azure subscription.
#[derive(Clone, PartialEq, Eq)]
pub struct AzureCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub tenant_id: String,
}

/// Credentials loading error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CredentialsError {
    #[snafu(display("Couldn't get secret {}: {}", secret, source))]
    Secret { secret: String, source: ApiError },
    #[snafu(display("Invalid {}: not all keys can be found, missing {}", secret, missing))]
    MissingKeys { secret: String, missing: String },
}

impl AzureCredentials {
    const KEYS: [&'static str; 5] = [
        "azureclientid",
        "azureclientsecret",
        "azuresubscriptionid",
        "azureresourcegroupname",
        "azuretenantid",
    ];

    /// Builds the credentials from the key/values of the given secret.
    /// Every key must be present and non empty.
    pub fn from_secret(
        secret: &str,
        data: &HashMap<String, String>,
    ) -> Result<Self, CredentialsError> {
        let value = |key: &str| data.get(key).filter(|v| !v.is_empty()).cloned();
        let missing = Self::KEYS
            .iter()
            .copied()
            .filter(|key| value(*key).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return MissingKeys {
                secret,
                missing: missing.join(", "),
            }
            .fail();
        }
        let field = |key: &str| value(key).unwrap_or_default();
        Ok(Self {
            client_id: field("azureclientid"),
            client_secret: field("azureclientsecret"),
            subscription_id: field("azuresubscriptionid"),
            resource_group: field("azureresourcegroupname"),
            tenant_id: field("azuretenantid"),
        })
    }

    /// Loads the credentials from the secret store.
    pub async fn load(
        store: &dyn SecretStore,
        namespace: &str,
        name: &str,
    ) -> Result<Self, CredentialsError> {
        let secret = format!("{namespace}/{name}");
        let data = store
            .get_secret(namespace, name)
            .await
            .context(Secret {
                secret: secret.clone(),
            })?;
        Self::from_secret(&secret, &data)
    }
}

impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("client_id", &self.client_id)
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

/// Access key of a storage account.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageAccountKey(String);

impl StorageAccountKey {
    const KEY: &'static str = "azurestorageaccountkey";

    /// Picks the account key out of the given secret: the `azurestorageaccountkey` entry, or
    /// the only entry of a single valued secret.
    pub fn from_secret(
        secret: &str,
        data: &HashMap<String, String>,
    ) -> Result<Self, CredentialsError> {
        let key = match data.get(Self::KEY) {
            Some(key) => Some(key),
            None if data.len() == 1 => data.values().next(),
            None => None,
        };
        match key.filter(|key| !key.is_empty()) {
            Some(key) => Ok(Self(key.clone())),
            None => MissingKeys {
                secret,
                missing: Self::KEY,
            }
            .fail(),
        }
    }

    /// Loads the account key from the secret store.
    pub async fn load(
        store: &dyn SecretStore,
        namespace: &str,
        name: &str,
    ) -> Result<Self, CredentialsError> {
        let secret = format!("{namespace}/{name}");
        let data = store
            .get_secret(namespace, name)
            .await
            .context(Secret {
                secret: secret.clone(),
            })?;
        Self::from_secret(&secret, &data)
    }

    /// The key itself.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for StorageAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageAccountKey(..)")
    }
}

/// Attaches VHD data disks to Azure virtual machines.
pub struct AzureDiskClient {
    vms: Box<dyn VirtualMachines>,
    storage: Box<dyn StorageAccounts>,
    resource_group: String,
}

impl AzureDiskClient {
    /// Returns a new client operating on the given resource group.
    pub fn new(
        vms: Box<dyn VirtualMachines>,
        storage: Box<dyn StorageAccounts>,
        resource_group: impl Into<String>,
    ) -> Self {
        Self {
            vms,
            storage,
            resource_group: resource_group.into(),
        }
    }

    async fn virtual_machine(&self, instance: &str) -> Result<VirtualMachine, CloudError> {
        self.vms
            .get(&self.resource_group, instance)
            .await
            .context(Api)?
            .ok_or_else(|| InstanceNotFound { instance }.build())
    }

    async fn commit(&self, instance: &str, vm: VirtualMachine) -> Result<(), ApiError> {
        self.vms
            .create_or_update(&self.resource_group, instance, vm)
            .await
    }

    /// Removes the first data disk matching the predicate and commits the remaining list.
    async fn detach_where(
        &self,
        volume: String,
        instance: &str,
        predicate: impl Fn(&DataDisk) -> bool + Send,
    ) -> Result<(), CloudError> {
        let mut vm = self.virtual_machine(instance).await?;
        let Some(index) = vm.data_disks.iter().position(predicate) else {
            return VolumeNotFound { volume, instance }.fail();
        };
        let disk = vm.data_disks.remove(index);
        debug!(
            disk.name = disk.name.as_deref().unwrap_or_default(),
            disk.uri = disk.uri().unwrap_or_default(),
            disk.lun = ?disk.lun,
            instance,
            "Detaching data disk"
        );
        self.commit(instance, vm)
            .await
            .context(DetachFailed { volume, instance })
    }
}

#[async_trait::async_trait]
impl CloudDiskClient for AzureDiskClient {
    async fn attach_disk(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
        lun: Lun,
        caching: CachingMode,
    ) -> Result<(), CloudError> {
        let mut vm = self.virtual_machine(instance).await?;

        if let Some(attached) = vm.data_disks.iter().find(|d| d.refers_to(disk)) {
            if attached.lun != Some(lun) {
                warn!(
                    volume.name = disk.name(),
                    instance,
                    attached.lun = ?attached.lun,
                    requested.lun = %lun,
                    "Disk is already attached at a different lun"
                );
            }
            return Ok(());
        }
        if let Some(occupant) = vm.data_disks.iter().find(|d| d.lun == Some(lun)) {
            return LunInUse {
                lun,
                instance,
                occupant: occupant
                    .name
                    .clone()
                    .or_else(|| occupant.uri().map(ToString::to_string))
                    .unwrap_or_default(),
            }
            .fail();
        }

        vm.data_disks.push(DataDisk {
            name: (!disk.name().is_empty()).then(|| disk.name().to_string()),
            lun: Some(lun),
            vhd: disk.uri().map(|uri| VirtualHardDisk {
                uri: Some(uri.to_string()),
            }),
            caching: Some(caching),
            disk_size_gb: None,
        });
        self.commit(instance, vm).await.context(AttachFailed {
            volume: disk.name(),
            instance,
        })?;
        info!(volume.name = disk.name(), instance, %lun, "Attached data disk");
        Ok(())
    }

    async fn detach_disk_by_name(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<(), CloudError> {
        self.detach_where(disk.name().to_string(), instance, |d| d.refers_to(disk))
            .await
    }

    async fn detach_disk_by_lun(&self, lun: Lun, instance: &str) -> Result<(), CloudError> {
        self.detach_where(format!("lun {lun}"), instance, |d| d.lun == Some(lun))
            .await
    }

    async fn get_disk_lun(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<Lun, CloudError> {
        let vm = self.virtual_machine(instance).await?;
        vm.data_disks
            .iter()
            .filter(|d| d.refers_to(disk))
            .find_map(|d| d.lun)
            .ok_or_else(|| {
                VolumeNotFound {
                    volume: disk.name(),
                    instance,
                }
                .build()
            })
    }

    async fn get_next_disk_lun(&self, instance: &str) -> Result<Lun, CloudError> {
        let vm = self.virtual_machine(instance).await?;
        match next_free_lun(vm.data_disks.iter().filter_map(|d| d.lun)) {
            Some(lun) => Ok(lun),
            None => NoFreeLun { instance }.fail(),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        kind: &str,
        location: &str,
        size_gib: u64,
    ) -> Result<ProvisionedDisk, CloudError> {
        self.storage
            .create_vhd(name, kind, location, size_gib)
            .await
            .context(Api)
    }

    async fn delete_volume(&self, disk: &VolumeIdentity) -> Result<(), CloudError> {
        self.storage
            .delete_vhd(disk.name(), disk.uri().unwrap_or_default())
            .await
            .context(Api)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    /// Virtual machines kept in memory.
    #[derive(Default)]
    pub(crate) struct InMemoryVms {
        pub(crate) vms: Mutex<HashMap<String, VirtualMachine>>,
        pub(crate) fail_commits: AtomicBool,
        pub(crate) commits: AtomicUsize,
    }

    impl InMemoryVms {
        pub(crate) fn with_instance(instance: &str) -> Self {
            let vms = Self::default();
            vms.vms
                .lock()
                .unwrap()
                .insert(instance.to_string(), VirtualMachine::default());
            vms
        }
    }

    #[async_trait::async_trait]
    impl VirtualMachines for std::sync::Arc<InMemoryVms> {
        async fn get(
            &self,
            _resource_group: &str,
            name: &str,
        ) -> Result<Option<VirtualMachine>, ApiError> {
            Ok(self.vms.lock().unwrap().get(name).cloned())
        }
        async fn create_or_update(
            &self,
            _resource_group: &str,
            name: &str,
            vm: VirtualMachine,
        ) -> Result<(), ApiError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err("commit rejected".into());
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            self.vms.lock().unwrap().insert(name.to_string(), vm);
            Ok(())
        }
    }

    /// Storage which creates blobs under a fixed container.
    pub(crate) struct FakeStorage;

    #[async_trait::async_trait]
    impl StorageAccounts for FakeStorage {
        async fn create_vhd(
            &self,
            name: &str,
            _kind: &str,
            _location: &str,
            size_gib: u64,
        ) -> Result<ProvisionedDisk, ApiError> {
            Ok(ProvisionedDisk {
                name: name.to_string(),
                uri: format!("https://store.blob/vhds/{name}.vhd"),
                size_gib,
            })
        }
        async fn delete_vhd(&self, _name: &str, _uri: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    /// File shares kept in memory, per account.
    #[derive(Default)]
    pub(crate) struct InMemoryShares {
        pub(crate) shares: Mutex<Vec<(String, String)>>,
        pub(crate) fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl FileShares for InMemoryShares {
        async fn create_share_if_not_exists(
            &self,
            account_name: &str,
            account_key: &str,
            share_name: &str,
        ) -> Result<bool, ApiError> {
            if self.fail.load(Ordering::SeqCst) || account_key.is_empty() {
                return Err("authentication failed".into());
            }
            let share = (account_name.to_string(), share_name.to_string());
            let mut shares = self.shares.lock().unwrap();
            if shares.contains(&share) {
                return Ok(false);
            }
            shares.push(share);
            Ok(true)
        }
    }

    pub(crate) fn client(vms: std::sync::Arc<InMemoryVms>) -> AzureDiskClient {
        AzureDiskClient::new(Box::new(vms), Box::new(FakeStorage), "rg")
    }
}
