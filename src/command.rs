/// ptp4l command-line construction for each role and install flavour.
use crate::config::HostConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const STEP_THRESHOLD: &str = "--step_threshold";
pub const HWTS_FILTER: &str = "--hwts_filter";
pub const SERVER_ONLY: &str = "--serverOnly";
pub const CLIENT_ONLY: &str = "--clientOnly";
pub const CONFIG_FILE: &str = "-f";
pub const VERBOSE: &str = "--verbose";
pub const USE_SYSLOG: &str = "--use_syslog";
pub const INTERFACE: &str = "-i";
pub const SA_FILE: &str = "--sa_file";

pub const PTP4L: &str = "/usr/sbin/ptp4l";
pub const PTP4L_SNAP: &str = "linuxptp.ptp4l";

/// Directory holding the snap's unix domain sockets; it must exist before ptp4l starts.
pub const SNAP_UDS_DIR: &str = "/run/snap.linuxptp";

/// Raspberry Pi 5 PHYs need full hardware timestamp filtering.
const RPI5_ARGS: &[&str] = &[HWTS_FILTER, "full"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// The other side of the pair.
    pub fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }

    pub fn default_started_marker(self) -> &'static str {
        match self {
            Role::Server => "assuming the grand master role",
            Role::Client => "INITIALIZING to LISTENING on INIT_COMPLETE",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallType {
    Deb,
    Snap,
}

impl InstallType {
    pub fn binary(self) -> &'static str {
        match self {
            InstallType::Deb => PTP4L,
            InstallType::Snap => PTP4L_SNAP,
        }
    }

    /// Where staged config files go on the remote host.
    pub fn config_dir(self) -> &'static str {
        match self {
            InstallType::Deb => "/etc/linuxptp/",
            InstallType::Snap => "/var/snap/linuxptp/common/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemType {
    Generic,
    Rpi5,
}

/// Builder for one ptp4l invocation.
#[derive(Debug, Clone)]
pub struct Ptp4lCommand {
    role: Role,
    install_type: InstallType,
    system_type: SystemType,
    interface: String,
    config_path: String,
    sa_path: Option<String>,
    extra_args: Vec<String>,
}

impl Ptp4lCommand {
    pub fn new(role: Role, host: &HostConfig, config_path: impl Into<String>) -> Self {
        Self {
            role,
            install_type: host.install_type,
            system_type: host.system_type,
            interface: host.interface.clone(),
            config_path: config_path.into(),
            sa_path: None,
            extra_args: host.extra_args.clone(),
        }
    }

    pub fn with_security_association(mut self, path: impl Into<String>) -> Self {
        self.sa_path = Some(path.into());
        self
    }

    /// The full argument vector, starting with `sudo`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = vec![
            "sudo".into(),
            self.install_type.binary().into(),
            INTERFACE.into(),
            self.interface.clone(),
            VERBOSE.into(),
            "1".into(),
            USE_SYSLOG.into(),
            "0".into(),
        ];

        if self.role == Role::Client {
            // Step the clock on large offsets so the client syncs quickly.
            argv.extend([STEP_THRESHOLD.into(), "1".into()]);
        }

        argv.extend([CONFIG_FILE.into(), self.config_path.clone()]);

        let role_flag = match self.role {
            Role::Server => SERVER_ONLY,
            Role::Client => CLIENT_ONLY,
        };
        argv.extend([role_flag.into(), "1".into()]);

        if let Some(sa) = &self.sa_path {
            argv.extend([SA_FILE.into(), sa.clone()]);
        }

        if self.system_type == SystemType::Rpi5 {
            argv.extend(RPI5_ARGS.iter().map(|s| s.to_string()));
        }
        argv.extend(self.extra_args.iter().cloned());

        argv
    }
}

/// Command that creates the snap's socket directory.
pub fn snap_uds_setup_argv() -> Vec<String> {
    ["sudo", "mkdir", "-p", SNAP_UDS_DIR]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
