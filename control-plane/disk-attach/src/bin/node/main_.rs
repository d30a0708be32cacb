//! Node disk attach agent.
//!
//! Exposes the node side building blocks of the volume lifecycle: device discovery, mount
//! reference inspection, and the SetUp and TearDown of volumes which the node attaches on its
//! own (iSCSI) or mounts directly (glusterfs).
//! In a container, filesystem mounts can be sent to the host mount daemon instead.

use crate::config::{config, Config};
use clap::{Arg, ArgAction, ArgMatches, Command};
use disk_attach::{
    binder::PodVolumeMounter,
    dev::{DeviceFinder, DeviceNameScheme, NamedDeviceFinder, ScsiDeviceScanner},
    filesystem::{probe_filesystems, FileSystem},
    mount::{get_mount_refs, HostDaemonMounter, LinuxMounter, Mounter},
    plugin::{PluginKind, VolumePlugins},
    volume::{GlusterfsVolume, IscsiDisk, Lun, VolumeIdentity, VolumeSource, VolumeSpec},
    IscsiAdmCommand, IscsiPlugin, NodeConfig,
};
use std::{path::Path, str::FromStr, sync::Arc};
use tracing::{debug, info};
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

fn pod_volume_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("pod-uid")
                .long("pod-uid")
                .value_name("UID")
                .required(true)
                .help("Uid of the pod owning the volume"),
        )
        .arg(
            Arg::new("volume")
                .long("volume")
                .value_name("NAME")
                .required(true)
                .help("Name of the volume within the pod"),
        )
}

fn cli() -> Command {
    Command::new(utils::package_description!())
        .about("Node agent attaching, mounting and tearing down pod volumes")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg(
            Arg::new("node-name")
                .short('n')
                .long("node-name")
                .env("NODE_NAME")
                .value_name("NAME")
                .global(true)
                .help("Unique node name where this instance runs"),
        )
        .arg(
            Arg::new("root-dir")
                .long("root-dir")
                .value_name("PATH")
                .global(true)
                .help(format!(
                    "Root of the pod and plugin directories (default {})",
                    utils::DEFAULT_ROOT_DIR
                )),
        )
        .arg(
            Arg::new("sysfs-dir")
                .long("sysfs-dir")
                .value_name("PATH")
                .global(true)
                .help(format!("Sysfs mount point (default {})", utils::DEFAULT_SYSFS_DIR)),
        )
        .arg(
            Arg::new("dev-dir")
                .long("dev-dir")
                .value_name("PATH")
                .global(true)
                .help(format!("Device node directory (default {})", utils::DEFAULT_DEV_DIR)),
        )
        .arg(
            Arg::new("poll-interval")
                .long("poll-interval")
                .value_name("DURATION")
                .global(true)
                .help(format!(
                    "Interval between device presence checks (default {})",
                    utils::DEVICE_POLL_INTERVAL
                )),
        )
        .arg(
            Arg::new("attach-timeout")
                .long("attach-timeout")
                .value_name("DURATION")
                .global(true)
                .help(format!(
                    "How long to wait for an attached device (default {})",
                    utils::DEFAULT_ATTACH_TIMEOUT
                )),
        )
        .arg(
            Arg::new("detach-timeout")
                .long("detach-timeout")
                .value_name("DURATION")
                .global(true)
                .help(format!(
                    "How long to wait for a detached device to go away (default {})",
                    utils::DEFAULT_DETACH_TIMEOUT
                )),
        )
        .arg(
            Arg::new("mount-daemon-port")
                .long("mount-daemon-port")
                .env("MOUNT_DAEMON_PORT")
                .value_name("PORT")
                .global(true)
                .help("Send filesystem mounts to the host mount daemon listening on this port"),
        )
        .arg(
            Arg::new("host-bind-path")
                .long("host-bind-path")
                .value_name("PATH")
                .global(true)
                .help(format!(
                    "Where the host root is visible from this container (default {})",
                    utils::DEFAULT_HOST_BIND_PATH
                )),
        )
        .arg(
            Arg::new("host-mount-table")
                .long("host-mount-table")
                .value_name("PATH")
                .global(true)
                .help("Mount table of the host (default <host-bind-path>/proc/1/mounts)"),
        )
        .arg(
            Arg::new("fmt-style")
                .long("fmt-style")
                .value_name("STYLE")
                .default_value(FmtStyle::Compact.as_ref().to_string())
                .global(true)
                .help("Formatting style of the logs: compact, pretty or json"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Sets the verbosity level"),
        )
        .subcommand(
            Command::new("scsi-device")
                .about("Finds the device of the data disk attached at the given lun")
                .arg(Arg::new("lun").long("lun").required(true).value_name("LUN")),
        )
        .subcommand(
            Command::new("scsi-lun")
                .about("Finds the lun of the given data disk device")
                .arg(Arg::new("device").long("device").required(true).value_name("PATH")),
        )
        .subcommand(
            Command::new("device-name")
                .about("Finds the device a provider exposes for the given attachment slot")
                .arg(
                    Arg::new("scheme")
                        .long("scheme")
                        .required(true)
                        .value_parser(["ebs", "cinder"]),
                )
                .arg(Arg::new("lun").long("lun").required(true).value_name("LUN"))
                .arg(
                    Arg::new("volume-id")
                        .long("volume-id")
                        .value_name("ID")
                        .help("Provider volume id, used to match the virtio serial"),
                ),
        )
        .subcommand(
            Command::new("mount-refs")
                .about("Lists the other mount points of the device mounted at the given path")
                .arg(Arg::new("path").required(true).value_name("PATH")),
        )
        .subcommand(pod_volume_args(
            Command::new("iscsi-set-up")
                .about("Logs in to an iscsi target and sets up the pod volume")
                .arg(
                    Arg::new("url")
                        .long("url")
                        .required(true)
                        .value_name("URL")
                        .help("Target lun, as iscsi://<portal>/<iqn>/<lun>"),
                )
                .arg(
                    Arg::new("fs-type")
                        .long("fs-type")
                        .value_name("FS")
                        .default_value(FileSystem::default().as_ref().to_string()),
                )
                .arg(Arg::new("read-only").long("read-only").action(ArgAction::SetTrue)),
        ))
        .subcommand(pod_volume_args(
            Command::new("iscsi-tear-down")
                .about("Tears down the pod volume, logging out of the target once unused"),
        ))
        .subcommand(pod_volume_args(
            Command::new("glusterfs-set-up")
                .about("Mounts a glusterfs volume into the pod volume directory")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .required(true)
                        .action(ArgAction::Append)
                        .value_name("HOST"),
                )
                .arg(Arg::new("path").long("path").required(true).value_name("VOLUME"))
                .arg(Arg::new("read-only").long("read-only").action(ArgAction::SetTrue)),
        ))
        .subcommand(pod_volume_args(
            Command::new("glusterfs-tear-down").about("Unmounts the glusterfs pod volume"),
        ))
}

pub(super) async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let style = matches
        .get_one::<String>("fmt-style")
        .map(|style| FmtStyle::from_str(style))
        .transpose()?
        .unwrap_or(FmtStyle::Compact);
    let level = match matches.get_count("v") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stderr)
        .with_style(style)
        .with_default_level(level)
        .init(utils::PRODUCT_NAME);
    utils::print_package_info!();

    *config() = Config::try_from(&matches)?;
    let node = config().node().clone();
    debug!(?node, "Node configuration");

    match matches.subcommand() {
        Some(("scsi-device", args)) => {
            let lun = lun(args)?;
            let scanner = ScsiDeviceScanner::new(&node.sysfs_dir, &node.dev_dir);
            match scanner.find_device_by_lun(lun)? {
                Some(device) => println!("{}", device.display()),
                None => anyhow::bail!("No data disk found at lun {lun}"),
            }
        }
        Some(("scsi-lun", args)) => {
            let device = required(args, "device")?;
            let scanner = ScsiDeviceScanner::new(&node.sysfs_dir, &node.dev_dir);
            match scanner.find_lun_by_device_path(Path::new(device))? {
                Some(lun) => println!("{lun}"),
                None => anyhow::bail!("{device} is not a data disk"),
            }
        }
        Some(("device-name", args)) => {
            let scheme = DeviceNameScheme::from_str(required(args, "scheme")?)?;
            let lun = lun(args)?;
            let identity = VolumeIdentity::new(
                args.get_one::<String>("volume-id")
                    .map(String::as_str)
                    .unwrap_or_default(),
            );
            println!("requested as {}", scheme.device_name(lun));
            let finder = NamedDeviceFinder::new(scheme, &node.dev_dir);
            match finder.find_device(&identity, lun)? {
                Some(device) => println!("present as {}", device.display()),
                None => println!("not present"),
            }
        }
        Some(("mount-refs", args)) => {
            let path = Path::new(required(args, "path")?);
            for path in get_mount_refs(mounter().as_ref(), path).await? {
                println!("{}", path.display());
            }
        }
        Some(("iscsi-set-up", args)) => {
            let url = url::Url::parse(required(args, "url")?)?;
            let mut disk = IscsiDisk::try_from(&url).map_err(|error| anyhow::anyhow!(error))?;
            disk.fs_type = FileSystem::from_str(required(args, "fs-type")?)?;
            disk.read_only = args.get_flag("read-only");
            let available = probe_filesystems();
            if !available.contains(&disk.fs_type) {
                anyhow::bail!(
                    "mkfs for {} is not available, the node supports {available:?}",
                    disk.fs_type
                );
            }
            let dir = set_up(&node, args, VolumeSource::Iscsi(disk)).await?;
            println!("{}", dir.display());
        }
        Some(("iscsi-tear-down", args)) => tear_down(&node, args, PluginKind::Iscsi).await?,
        Some(("glusterfs-set-up", args)) => {
            let volume = GlusterfsVolume {
                hosts: args
                    .get_many::<String>("host")
                    .map(|hosts| hosts.cloned().collect())
                    .unwrap_or_default(),
                path: required(args, "path")?.to_string(),
                read_only: args.get_flag("read-only"),
            };
            let dir = set_up(&node, args, VolumeSource::Glusterfs(volume)).await?;
            println!("{}", dir.display());
        }
        Some(("glusterfs-tear-down", args)) => {
            tear_down(&node, args, PluginKind::Glusterfs).await?
        }
        _ => anyhow::bail!("Unknown command"),
    }
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("--{name} is required"))
}

fn lun(args: &ArgMatches) -> anyhow::Result<Lun> {
    Lun::from_str(required(args, "lun")?).map_err(|error| anyhow::anyhow!(error))
}

/// Mounts locally, or through the host mount daemon when one is configured.
fn mounter() -> Arc<dyn Mounter> {
    let daemon = config().mount_daemon().cloned();
    match daemon {
        Some(daemon) => Arc::new(HostDaemonMounter::new(
            daemon.port,
            daemon.host_bind_path,
            daemon.host_mount_table,
        )),
        None => Arc::new(LinuxMounter::new()),
    }
}

/// The pod volume mounter with the plugins this agent can drive on its own.
fn pod_volume_mounter(node: &NodeConfig) -> PodVolumeMounter {
    let mounter = mounter();
    let plugins = VolumePlugins {
        iscsi: Some(Arc::new(IscsiPlugin::new(
            Arc::new(IscsiAdmCommand::default()),
            mounter.clone(),
            node,
        ))),
        ..Default::default()
    };
    PodVolumeMounter::new(plugins, mounter, node)
}

async fn set_up(
    node: &NodeConfig,
    args: &ArgMatches,
    source: VolumeSource,
) -> anyhow::Result<std::path::PathBuf> {
    let volume = VolumeSpec {
        name: required(args, "volume")?.to_string(),
        source,
    };
    let pod_uid = required(args, "pod-uid")?;
    let dir = pod_volume_mounter(node).set_up(pod_uid, &volume).await?;
    info!(pod.uid = pod_uid, volume = %volume.name, dir = %dir.display(), "Pod volume set up");
    Ok(dir)
}

async fn tear_down(node: &NodeConfig, args: &ArgMatches, kind: PluginKind) -> anyhow::Result<()> {
    let pod_uid = required(args, "pod-uid")?;
    let volume = required(args, "volume")?;
    pod_volume_mounter(node)
        .tear_down(pod_uid, kind, volume)
        .await?;
    info!(pod.uid = pod_uid, volume, "Pod volume torn down");
    Ok(())
}
