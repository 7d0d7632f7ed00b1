use crate::command::{InstallType, Role, SystemType};
use crate::unicast::UnicastTransport;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from harness.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub scenario: ScenarioConfig,
    pub server: HostConfig,
    pub client: HostConfig,
    pub timeouts: TimeoutConfig,
    pub convergence: ConvergenceConfig,
    pub teardown: TeardownConfig,
    pub prompt: PromptConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Used in staged config file names on the remote hosts.
    pub name: String,
}

/// One side of the synchronisation pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub install_type: InstallType,
    pub system_type: SystemType,
    pub interface: String,
    pub config_file: PathBuf,
    pub security_association_file: Option<PathBuf>,
    /// Overrides the role's default startup marker.
    pub started_substring: Option<String>,
    pub require_sync_below_threshold: bool,
    /// Append a unicast master table pointing at the peer host.
    pub unicast_transport: Option<UnicastTransport>,
    /// Appended to the ptp4l command line after the platform flags, e.g.
    /// `["--min_neighbor_prop_delay", "-20000000"]` or snap socket addresses.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub startup_secs: u64,
    pub sync_budget_secs: u64,
    /// Upper bound for short helper commands (mv, rm, address lookups).
    pub command_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Offsets with an absolute value strictly below this count as in tolerance (ns).
    pub threshold_ns: i64,
    pub required_repeats: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Delay between the interrupt and the kill signal.
    pub grace_period_ms: u64,
    /// Delay after closing the session, letting the remote OS reap the process.
    pub reap_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub prefix: String,
    pub suffix: String,
    /// Environment variable holding the sudo password.
    pub secret_env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    pub scp_program: String,
    pub connect_timeout_secs: u64,
    pub extra_args: Vec<String>,
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
    /// The sudo password variable is unset or empty.
    MissingSecret { var: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
            ConfigError::MissingSecret { var } => {
                write!(f, "{var} environment variable not set")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) | ConfigError::MissingSecret { .. } => None,
        }
    }
}

impl HarnessConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that do not touch the network or the environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (role, host) in [(Role::Server, &self.server), (Role::Client, &self.client)] {
            if host.hostname.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{role} hostname is empty")));
            }
            if host.interface.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{role} interface is empty")));
            }
            if host.config_file.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{role} config_file is empty")));
            }
        }
        if self.convergence.required_repeats == 0 {
            return Err(ConfigError::Invalid(
                "convergence.required_repeats must be at least 1".to_string(),
            ));
        }
        if self.convergence.threshold_ns <= 0 {
            return Err(ConfigError::Invalid(
                "convergence.threshold_ns must be positive".to_string(),
            ));
        }
        if self.timeouts.startup_secs == 0 || self.timeouts.sync_budget_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if self.prompt.prefix.is_empty() {
            return Err(ConfigError::Invalid("prompt.prefix is empty".to_string()));
        }
        Ok(())
    }

    pub fn host(&self, role: Role) -> &HostConfig {
        match role {
            Role::Server => &self.server,
            Role::Client => &self.client,
        }
    }
}

impl HostConfig {
    /// The log text that means this role's daemon is up.
    pub fn started_marker(&self, role: Role) -> &str {
        match &self.started_substring {
            Some(marker) => marker,
            None => role.default_started_marker(),
        }
    }
}

impl TimeoutConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn sync_budget(&self) -> Duration {
        Duration::from_secs(self.sync_budget_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

impl TeardownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn reap_period(&self) -> Duration {
        Duration::from_millis(self.reap_period_ms)
    }
}

// --- Default implementations ---

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioConfig::default(),
            server: HostConfig {
                hostname: "raspi-a.lan".to_string(),
                ..Default::default()
            },
            client: HostConfig {
                hostname: "raspi-b.lan".to_string(),
                require_sync_below_threshold: true,
                ..Default::default()
            },
            timeouts: TimeoutConfig::default(),
            convergence: ConvergenceConfig::default(),
            teardown: TeardownConfig::default(),
            prompt: PromptConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "ptp4l-pair".to_string(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 22,
            username: "ubuntu".to_string(),
            install_type: InstallType::Deb,
            system_type: SystemType::Generic,
            interface: "eth0".to_string(),
            config_file: PathBuf::from("configs/default.cfg"),
            security_association_file: None,
            started_substring: None,
            require_sync_below_threshold: false,
            unicast_transport: None,
            extra_args: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_secs: 20,
            sync_budget_secs: 30,
            command_secs: 60,
        }
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            threshold_ns: 100,
            required_repeats: 5,
        }
    }
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 1000,
            reap_period_ms: 1000,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            prefix: "[sudo] password for ".to_string(),
            suffix: ": ".to_string(),
            secret_env: "REMOTE_PASSWORD".to_string(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            connect_timeout_secs: 10,
            extra_args: Vec::new(),
        }
    }
}
