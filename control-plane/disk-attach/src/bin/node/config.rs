use clap::ArgMatches;
use disk_attach::NodeConfig;
use once_cell::sync::Lazy;
use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

/// Where to reach the host mount daemon, when the agent runs in a container.
#[derive(Debug, Clone)]
pub(crate) struct MountDaemon {
    pub(crate) port: u16,
    pub(crate) host_bind_path: PathBuf,
    pub(crate) host_mount_table: PathBuf,
}

/// Global configuration parameters.
#[derive(Debug)]
pub(crate) struct Config {
    node: NodeConfig,
    mount_daemon: Option<MountDaemon>,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::new(""),
            mount_daemon: None,
        }
    }
}
impl Config {
    /// Get the `NodeConfig`.
    pub(crate) fn node(&self) -> &NodeConfig {
        &self.node
    }
    /// Get the host mount daemon, if mounts go through it.
    pub(crate) fn mount_daemon(&self) -> Option<&MountDaemon> {
        self.mount_daemon.as_ref()
    }
}

/// Get a mutex guard over the `Config`.
pub(crate) fn config<'a>() -> MutexGuard<'a, Config> {
    static CONFIG: Lazy<Mutex<Config>> = Lazy::new(|| Mutex::new(Config::default()));
    CONFIG.lock().expect("not poisoned")
}

fn duration(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<Duration>> {
    matches
        .get_one::<String>(name)
        .map(|value| {
            humantime::parse_duration(value)
                .map_err(|error| anyhow::anyhow!("Invalid value for {name}: {error}"))
        })
        .transpose()
}

impl TryFrom<&ArgMatches> for Config {
    type Error = anyhow::Error;
    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        // only the cloud provider plugins need to know which instance the node is
        let node_name = matches
            .get_one::<String>("node-name")
            .map(String::as_str)
            .unwrap_or_default();
        let mut node = NodeConfig::new(node_name);
        if let Some(root_dir) = matches.get_one::<String>("root-dir") {
            node.root_dir = PathBuf::from(root_dir);
        }
        if let Some(sysfs_dir) = matches.get_one::<String>("sysfs-dir") {
            node.sysfs_dir = PathBuf::from(sysfs_dir);
        }
        if let Some(dev_dir) = matches.get_one::<String>("dev-dir") {
            node.dev_dir = PathBuf::from(dev_dir);
        }
        if let Some(interval) = duration(matches, "poll-interval")? {
            node.poll_interval = interval;
        }
        if let Some(timeout) = duration(matches, "attach-timeout")? {
            node.attach_timeout = timeout;
        }
        if let Some(timeout) = duration(matches, "detach-timeout")? {
            node.detach_timeout = timeout;
        }
        let mount_daemon = match matches.get_one::<String>("mount-daemon-port") {
            None => None,
            Some(port) => {
                let host_bind_path = matches
                    .get_one::<String>("host-bind-path")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(utils::DEFAULT_HOST_BIND_PATH));
                let host_mount_table = matches
                    .get_one::<String>("host-mount-table")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| host_bind_path.join("proc/1/mounts"));
                Some(MountDaemon {
                    port: port
                        .parse()
                        .map_err(|error| anyhow::anyhow!("Invalid mount daemon port: {error}"))?,
                    host_bind_path,
                    host_mount_table,
                })
            }
        };
        Ok(Self { node, mount_daemon })
    }
}
