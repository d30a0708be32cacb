//! The mount command line a host mount daemon runs on behalf of a containerized node agent.
//!
//! The command is sent as `GET <MOUNT_PATH><command>`, the command being the `mount`
//! arguments `-t <type> <source> <target> [-o <options>]`, url safe base64 encoded.
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use std::path::PathBuf;

/// Path prefix of the mount requests.
pub const MOUNT_PATH: &str = "/mount/";

/// A mount to perform in the host mount namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Filesystem type.
    pub fs_type: String,
    /// What to mount.
    pub source: String,
    /// Where to mount it, as seen from the host.
    pub target: PathBuf,
    /// Mount options.
    pub options: Vec<String>,
}

impl MountRequest {
    /// The `mount` arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.fs_type.clone(),
            self.source.clone(),
            self.target.to_string_lossy().into_owned(),
        ];
        if !self.options.is_empty() {
            args.push("-o".to_string());
            args.push(self.options.join(","));
        }
        args
    }

    /// The encoded command, as sent to the daemon.
    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.args().join(" "))
    }

    /// Decodes a command sent by `encode`.
    pub fn decode(encoded: &str) -> Result<Self, String> {
        let command = URL_SAFE
            .decode(encoded)
            .map_err(|error| format!("invalid encoding: {error}"))?;
        let command =
            String::from_utf8(command).map_err(|error| format!("invalid command: {error}"))?;
        let args = command.split_whitespace().collect::<Vec<_>>();
        let (fs_type, source, target, options) = match args.as_slice() {
            ["-t", fs_type, source, target] => (fs_type, source, target, vec![]),
            ["-t", fs_type, source, target, "-o", options] => (
                fs_type,
                source,
                target,
                options.split(',').map(ToString::to_string).collect(),
            ),
            _ => return Err(format!("unexpected mount command '{command}'")),
        };
        Ok(Self {
            fs_type: fs_type.to_string(),
            source: source.to_string(),
            target: PathBuf::from(target),
            options,
        })
    }
}
