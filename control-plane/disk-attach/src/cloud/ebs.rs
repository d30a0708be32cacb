use crate::{
    cloud::{
        next_free_lun, Api, ApiError, AttachFailed, CloudDiskClient, CloudError, DetachFailed,
        InstanceNotFound, LunInUse, NoFreeLun, ProvisionedDisk, VolumeNotFound,
    },
    dev::DeviceNameScheme,
    volume::{CachingMode, Lun, VolumeIdentity},
};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{info, warn};

/// A volume mapped to a device name of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub volume_id: String,
}

/// Elastic compute cloud api.
#[async_trait::async_trait]
pub trait Ec2Api: Send + Sync {
    /// The block device mappings of the instance, `None` if it does not exist.
    async fn block_device_mappings(
        &self,
        instance: &str,
    ) -> Result<Option<Vec<BlockDeviceMapping>>, ApiError>;
    /// Attaches the volume as the given device name.
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance: &str,
        device_name: &str,
    ) -> Result<(), ApiError>;
    /// Detaches the volume from the instance.
    async fn detach_volume(&self, volume_id: &str, instance: &str) -> Result<(), ApiError>;
    /// Creates a volume, returning its id.
    async fn create_volume(
        &self,
        availability_zone: &str,
        volume_type: &str,
        size_gib: u64,
    ) -> Result<String, ApiError>;
    /// Deletes the volume.
    async fn delete_volume(&self, volume_id: &str) -> Result<(), ApiError>;
}

/// Attaches EBS volumes to EC2 instances.
/// The lun is the index of the `/dev/xvd[b-d][a-z]` device name range the volume is mapped to.
pub struct EbsDiskClient {
    ec2: Box<dyn Ec2Api>,
    scheme: DeviceNameScheme,
}

impl EbsDiskClient {
    /// Returns a new client.
    pub fn new(ec2: Box<dyn Ec2Api>) -> Self {
        Self {
            ec2,
            scheme: DeviceNameScheme::Ebs,
        }
    }

    async fn mappings(&self, instance: &str) -> Result<Vec<BlockDeviceMapping>, CloudError> {
        self.ec2
            .block_device_mappings(instance)
            .await
            .context(Api)?
            .ok_or_else(|| InstanceNotFound { instance }.build())
    }

    async fn detach(&self, volume_id: &str, instance: &str) -> Result<(), CloudError> {
        self.ec2
            .detach_volume(volume_id, instance)
            .await
            .context(DetachFailed {
                volume: volume_id,
                instance,
            })
    }
}

#[async_trait::async_trait]
impl CloudDiskClient for EbsDiskClient {
    async fn attach_disk(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
        lun: Lun,
        _caching: CachingMode,
    ) -> Result<(), CloudError> {
        let mappings = self.mappings(instance).await?;
        if let Some(mapping) = mappings
            .iter()
            .find(|m| disk.matches(Some(m.volume_id.as_str()), None))
        {
            if self.scheme.lun_of(&mapping.device_name) != Some(lun) {
                warn!(
                    volume.name = disk.name(),
                    instance,
                    device = %mapping.device_name,
                    "Volume is already attached as a different device"
                );
            }
            return Ok(());
        }
        if let Some(mapping) = mappings
            .iter()
            .find(|m| self.scheme.lun_of(&m.device_name) == Some(lun))
        {
            return LunInUse {
                lun,
                instance,
                occupant: &mapping.volume_id,
            }
            .fail();
        }

        let device_name = self.scheme.device_name(lun);
        self.ec2
            .attach_volume(disk.name(), instance, &device_name)
            .await
            .context(AttachFailed {
                volume: disk.name(),
                instance,
            })?;
        info!(volume.name = disk.name(), instance, %device_name, "Attached EBS volume");
        Ok(())
    }

    async fn detach_disk_by_name(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<(), CloudError> {
        let mappings = self.mappings(instance).await?;
        match mappings
            .iter()
            .find(|m| disk.matches(Some(m.volume_id.as_str()), None))
        {
            Some(mapping) => self.detach(&mapping.volume_id, instance).await,
            None => VolumeNotFound {
                volume: disk.name(),
                instance,
            }
            .fail(),
        }
    }

    async fn detach_disk_by_lun(&self, lun: Lun, instance: &str) -> Result<(), CloudError> {
        let mappings = self.mappings(instance).await?;
        match mappings
            .iter()
            .find(|m| self.scheme.lun_of(&m.device_name) == Some(lun))
        {
            Some(mapping) => self.detach(&mapping.volume_id, instance).await,
            None => VolumeNotFound {
                volume: format!("lun {lun}"),
                instance,
            }
            .fail(),
        }
    }

    async fn get_disk_lun(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<Lun, CloudError> {
        let mappings = self.mappings(instance).await?;
        mappings
            .iter()
            .filter(|m| disk.matches(Some(m.volume_id.as_str()), None))
            .find_map(|m| self.scheme.lun_of(&m.device_name))
            .ok_or_else(|| {
                VolumeNotFound {
                    volume: disk.name(),
                    instance,
                }
                .build()
            })
    }

    async fn get_next_disk_lun(&self, instance: &str) -> Result<Lun, CloudError> {
        let mappings = self.mappings(instance).await?;
        let used = mappings
            .iter()
            .filter_map(|m| self.scheme.lun_of(&m.device_name));
        match next_free_lun(used) {
            Some(lun) => Ok(lun),
            None => NoFreeLun { instance }.fail(),
        }
    }

    async fn create_volume(
        &self,
        _name: &str,
        kind: &str,
        location: &str,
        size_gib: u64,
    ) -> Result<ProvisionedDisk, CloudError> {
        let volume_id = self
            .ec2
            .create_volume(location, kind, size_gib)
            .await
            .context(Api)?;
        Ok(ProvisionedDisk {
            uri: format!("aws://{location}/{volume_id}"),
            name: volume_id,
            size_gib,
        })
    }

    async fn delete_volume(&self, disk: &VolumeIdentity) -> Result<(), CloudError> {
        self.ec2.delete_volume(disk.name()).await.context(Api)
    }
}
