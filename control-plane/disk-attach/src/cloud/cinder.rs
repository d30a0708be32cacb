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

/// A volume attached to a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub device: String,
}

/// Compute (nova) and block storage (cinder) api.
#[async_trait::async_trait]
pub trait ComputeApi: Send + Sync {
    /// The volume attachments of the server, `None` if it does not exist.
    async fn volume_attachments(
        &self,
        server_id: &str,
    ) -> Result<Option<Vec<VolumeAttachment>>, ApiError>;
    /// Attaches the volume, requesting the given device name.
    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: &str,
    ) -> Result<(), ApiError>;
    /// Detaches the volume from the server.
    async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<(), ApiError>;
    /// Creates a volume, returning its id.
    async fn create_volume(
        &self,
        name: &str,
        volume_type: &str,
        availability_zone: &str,
        size_gib: u64,
    ) -> Result<String, ApiError>;
    /// Deletes the volume.
    async fn delete_volume(&self, volume_id: &str) -> Result<(), ApiError>;
}

/// Attaches cinder volumes to nova servers.
/// The lun is the index of the `/dev/vd[b-]` device name the volume is attached as.
pub struct CinderDiskClient {
    compute: Box<dyn ComputeApi>,
    scheme: DeviceNameScheme,
}

impl CinderDiskClient {
    /// Returns a new client.
    pub fn new(compute: Box<dyn ComputeApi>) -> Self {
        Self {
            compute,
            scheme: DeviceNameScheme::Cinder,
        }
    }

    async fn attachments(&self, server_id: &str) -> Result<Vec<VolumeAttachment>, CloudError> {
        self.compute
            .volume_attachments(server_id)
            .await
            .context(Api)?
            .ok_or_else(|| {
                InstanceNotFound {
                    instance: server_id,
                }
                .build()
            })
    }

    async fn find_then_detach(
        &self,
        volume: String,
        server_id: &str,
        predicate: impl Fn(&VolumeAttachment) -> bool + Send,
    ) -> Result<(), CloudError> {
        let attachments = self.attachments(server_id).await?;
        let Some(attachment) = attachments.into_iter().find(|a| predicate(a)) else {
            return VolumeNotFound {
                volume,
                instance: server_id,
            }
            .fail();
        };
        self.compute
            .detach_volume(server_id, &attachment.volume_id)
            .await
            .context(DetachFailed {
                volume,
                instance: server_id,
            })
    }
}

#[async_trait::async_trait]
impl CloudDiskClient for CinderDiskClient {
    async fn attach_disk(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
        lun: Lun,
        _caching: CachingMode,
    ) -> Result<(), CloudError> {
        let attachments = self.attachments(instance).await?;
        if let Some(attachment) = attachments
            .iter()
            .find(|a| disk.matches(Some(a.volume_id.as_str()), None))
        {
            if self.scheme.lun_of(&attachment.device) != Some(lun) {
                warn!(
                    volume.name = disk.name(),
                    instance,
                    device = %attachment.device,
                    "Volume is already attached as a different device"
                );
            }
            return Ok(());
        }
        if let Some(attachment) = attachments
            .iter()
            .find(|a| self.scheme.lun_of(&a.device) == Some(lun))
        {
            return LunInUse {
                lun,
                instance,
                occupant: &attachment.volume_id,
            }
            .fail();
        }

        let device = self.scheme.device_name(lun);
        self.compute
            .attach_volume(instance, disk.name(), &device)
            .await
            .context(AttachFailed {
                volume: disk.name(),
                instance,
            })?;
        info!(volume.name = disk.name(), instance, %device, "Attached cinder volume");
        Ok(())
    }

    async fn detach_disk_by_name(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<(), CloudError> {
        self.find_then_detach(disk.name().to_string(), instance, |a| {
            disk.matches(Some(a.volume_id.as_str()), None)
        })
        .await
    }

    async fn detach_disk_by_lun(&self, lun: Lun, instance: &str) -> Result<(), CloudError> {
        let scheme = self.scheme;
        self.find_then_detach(format!("lun {lun}"), instance, move |a| {
            scheme.lun_of(&a.device) == Some(lun)
        })
        .await
    }

    async fn get_disk_lun(
        &self,
        disk: &VolumeIdentity,
        instance: &str,
    ) -> Result<Lun, CloudError> {
        let attachments = self.attachments(instance).await?;
        attachments
            .iter()
            .filter(|a| disk.matches(Some(a.volume_id.as_str()), None))
            .find_map(|a| self.scheme.lun_of(&a.device))
            .ok_or_else(|| {
                VolumeNotFound {
                    volume: disk.name(),
                    instance,
                }
                .build()
            })
    }

    async fn get_next_disk_lun(&self, instance: &str) -> Result<Lun, CloudError> {
        let attachments = self.attachments(instance).await?;
        let used = attachments
            .iter()
            .filter_map(|a| self.scheme.lun_of(&a.device));
        match next_free_lun(used) {
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
        let volume_id = self
            .compute
            .create_volume(name, kind, location, size_gib)
            .await
            .context(Api)?;
        Ok(ProvisionedDisk {
            name: volume_id,
            uri: String::new(),
            size_gib,
        })
    }

    async fn delete_volume(&self, disk: &VolumeIdentity) -> Result<(), CloudError> {
        self.compute.delete_volume(disk.name()).await.context(Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    #[derive(Default)]
    struct FakeCompute {
        servers: Mutex<HashMap<String, Vec<VolumeAttachment>>>,
    }

    #[async_trait::async_trait]
    impl ComputeApi for Arc<FakeCompute> {
        async fn volume_attachments(
            &self,
            server_id: &str,
        ) -> Result<Option<Vec<VolumeAttachment>>, ApiError> {
            Ok(self.servers.lock().unwrap().get(server_id).cloned())
        }
        async fn attach_volume(
            &self,
            server_id: &str,
            volume_id: &str,
            device: &str,
        ) -> Result<(), ApiError> {
            let mut servers = self.servers.lock().unwrap();
            let attachments = servers.get_mut(server_id).ok_or("no server")?;
            attachments.push(VolumeAttachment {
                volume_id: volume_id.to_string(),
                device: device.to_string(),
            });
            Ok(())
        }
        async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<(), ApiError> {
            let mut servers = self.servers.lock().unwrap();
            let attachments = servers.get_mut(server_id).ok_or("no server")?;
            attachments.retain(|a| a.volume_id != volume_id);
            Ok(())
        }
        async fn create_volume(
            &self,
            _name: &str,
            _volume_type: &str,
            _availability_zone: &str,
            _size_gib: u64,
        ) -> Result<String, ApiError> {
            Ok("5e1f".to_string())
        }
        async fn delete_volume(&self, _volume_id: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn attach_and_detach() {
        let compute = Arc::new(FakeCompute::default());
        compute
            .servers
            .lock()
            .unwrap()
            .insert("server-1".to_string(), vec![]);
        let client = CinderDiskClient::new(Box::new(compute.clone()));
        let disk = VolumeIdentity::new("5e1f");

        let lun = client.get_next_disk_lun("server-1").await.unwrap();
        client
            .attach_disk(&disk, "server-1", lun, CachingMode::default())
            .await
            .unwrap();
        assert_eq!(
            compute.servers.lock().unwrap()["server-1"][0].device,
            "/dev/vdb"
        );
        assert_eq!(client.get_disk_lun(&disk, "server-1").await.unwrap(), lun);

        client.detach_disk_by_name(&disk, "server-1").await.unwrap();
        let error = client
            .detach_disk_by_name(&disk, "server-1")
            .await
            .unwrap_err();
        assert!(matches!(error, CloudError::VolumeNotFound { .. }));
    }
}
