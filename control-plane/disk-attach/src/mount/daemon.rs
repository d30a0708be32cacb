//! Mounts through a daemon running in the host mount namespace, for node agents running in a
//! container which lacks the filesystem helpers of the host.
use super::{redact, LinuxMounter, MountError, MountPoint, MountRequest, Mounter, MOUNT_PATH};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

/// How long the daemon may take to perform a mount.
const MOUNT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends filesystem mounts to the host mount daemon listening on the loopback interface.
/// Bind mounts, unmounts and mount table reads are done locally, the kubelet directory being
/// shared with the host.
pub struct HostDaemonMounter {
    endpoint: String,
    host_bind_path: PathBuf,
    client: reqwest::Client,
    local: LinuxMounter,
}

impl HostDaemonMounter {
    /// Returns a mounter talking to the daemon on the given port. `host_bind_path` is where
    /// the container's root is visible from the host and `host_mount_table` the host's mount
    /// table as seen from the container.
    pub fn new(
        port: u16,
        host_bind_path: impl Into<PathBuf>,
        host_mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            endpoint: format!("http://127.0.0.1:{port}{MOUNT_PATH}"),
            host_bind_path: host_bind_path.into(),
            client: reqwest::Client::new(),
            local: LinuxMounter::with_mount_table(host_mount_table),
        }
    }

    /// The path of `target` as seen from the host.
    fn host_path(&self, target: &Path) -> PathBuf {
        self.host_bind_path
            .join(target.strip_prefix("/").unwrap_or(target))
    }

    async fn send(&self, request: &MountRequest) -> Result<(), String> {
        let url = format!("{}{}", self.endpoint, request.encode());
        let response = self
            .client
            .get(&url)
            .timeout(MOUNT_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|error| format!("mount daemon request failed: {error}"))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let output = response
            .text()
            .await
            .map_err(|error| format!("failed to mount: {error}"))?;
        Err(format!("failed to mount ({status}): {}", output.trim()))
    }
}

#[async_trait::async_trait]
impl Mounter for HostDaemonMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError> {
        let fs_type = match fs_type {
            Some(fs_type) if !options.iter().any(|option| option == "bind") => fs_type,
            _ => return self.local.mount(source, target, fs_type, options).await,
        };
        let request = MountRequest {
            fs_type: fs_type.to_string(),
            source: source.to_string(),
            target: self.host_path(target),
            options: options.to_vec(),
        };
        debug!(
            source,
            target = %request.target.display(),
            fs_type,
            options = ?redact(options),
            "Mounting through the host mount daemon"
        );
        self.send(&request)
            .await
            .map_err(|details| MountError::MountFailed {
                device: source.to_string(),
                target: target.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, details),
            })
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.local.unmount(target).await
    }

    async fn list(&self) -> Result<Vec<MountPoint>, MountError> {
        self.local.list().await
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        self.local.is_likely_not_mount_point(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Answers a single request with the given response, returning the request line.
    async fn daemon(response: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = stream.read(&mut buffer).await.unwrap();
                assert_ne!(read, 0, "connection closed before the end of the request");
                request.extend_from_slice(&buffer[.. read]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            let request = String::from_utf8(request).unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (port, handle)
    }

    #[tokio::test]
    async fn mounts_through_the_daemon() {
        let (port, daemon) =
            daemon("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n\"\"").await;
        let mounter = HostDaemonMounter::new(port, "/rootfs", "/rootfs/proc/1/mounts");

        mounter
            .mount(
                "10.0.0.1:gv0",
                Path::new("/var/lib/kubelet/pods/p1/volumes/kubernetes.io~glusterfs/v"),
                Some("glusterfs"),
                &["ro".to_string()],
            )
            .await
            .unwrap();

        let request_line = daemon.await.unwrap();
        let encoded = request_line
            .strip_prefix("GET /mount/")
            .and_then(|rest| rest.strip_suffix(" HTTP/1.1"))
            .unwrap();
        let request = MountRequest::decode(encoded).unwrap();
        assert_eq!(request.fs_type, "glusterfs");
        assert_eq!(request.source, "10.0.0.1:gv0");
        assert_eq!(
            request.target,
            PathBuf::from("/rootfs/var/lib/kubelet/pods/p1/volumes/kubernetes.io~glusterfs/v")
        );
        assert_eq!(request.options, vec!["ro".to_string()]);
    }

    #[tokio::test]
    async fn daemon_failure_is_surfaced() {
        let (port, daemon) = daemon(
            "HTTP/1.1 400 Bad Request\r\ncontent-length: 24\r\nconnection: close\r\n\r\n\"mount: unknown fs type\"",
        )
        .await;
        let mounter = HostDaemonMounter::new(port, "/rootfs", "/rootfs/proc/1/mounts");

        let error = mounter
            .mount("//a.file.core.windows.net/s", Path::new("/mnt/x"), Some("cifs"), &[])
            .await
            .unwrap_err();
        daemon.await.unwrap();
        assert!(matches!(error, MountError::MountFailed { .. }), "{error}");
        assert!(error.to_string().contains("mount: unknown fs type"), "{error}");
    }
}
