/// One server/client run: stage configs, start ptp4l on both hosts in order,
/// watch the client converge, tear everything down.
use crate::command::{snap_uds_setup_argv, InstallType, Ptp4lCommand, Role};
use crate::config::{ConfigError, HarnessConfig};
use crate::convergence::{monitor, ConvergenceDetector, ConvergenceReport, ConvergenceState};
use crate::secret::Secret;
use crate::signals::requested;
use crate::staging::{remote_path, stage_file, StagedFile, StagedKind, StagingError};
use crate::supervisor::{execute, start_async, RemoteProcess, SupervisorError, SupervisorOptions};
use crate::transport::Transport;
use crate::unicast::{discover_peer_address, unicast_section, write_unicast_config, UnicastError};
use crate::waiter::wait_for;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How many of the detector's lines to repeat when the client never converges.
const DIAGNOSTIC_TAIL: usize = 20;

#[derive(Debug)]
pub enum ScenarioError {
    Config(ConfigError),
    Unicast(UnicastError),
    Staging(StagingError),
    Supervisor(SupervisorError),
    /// The startup marker never showed up.
    Startup {
        role: Role,
        marker: String,
        exited: bool,
    },
    /// Shutdown was requested before the run finished.
    Interrupted,
    /// The client did not converge within the budget.
    NotConverged {
        state: ConvergenceState,
        lines_seen: usize,
        elapsed_ms: u64,
    },
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::Config(e) => write!(f, "{e}"),
            ScenarioError::Unicast(e) => write!(f, "{e}"),
            ScenarioError::Staging(e) => write!(f, "{e}"),
            ScenarioError::Supervisor(e) => write!(f, "{e}"),
            ScenarioError::Startup {
                role,
                marker,
                exited,
            } => {
                write!(f, "starting {role} failed: marker {marker:?} not seen")?;
                if *exited {
                    write!(f, " (process exited)")?;
                }
                Ok(())
            }
            ScenarioError::Interrupted => write!(f, "interrupted"),
            ScenarioError::NotConverged {
                state,
                lines_seen,
                elapsed_ms,
            } => write!(
                f,
                "client did not synchronize: {state:?} after {elapsed_ms}ms ({lines_seen} lines)"
            ),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScenarioError::Config(e) => Some(e),
            ScenarioError::Unicast(e) => Some(e),
            ScenarioError::Staging(e) => Some(e),
            ScenarioError::Supervisor(e) => Some(e),
            ScenarioError::Startup { .. }
            | ScenarioError::Interrupted
            | ScenarioError::NotConverged { .. } => None,
        }
    }
}

impl From<ConfigError> for ScenarioError {
    fn from(e: ConfigError) -> Self {
        ScenarioError::Config(e)
    }
}

impl From<UnicastError> for ScenarioError {
    fn from(e: UnicastError) -> Self {
        ScenarioError::Unicast(e)
    }
}

impl From<StagingError> for ScenarioError {
    fn from(e: StagingError) -> Self {
        ScenarioError::Staging(e)
    }
}

impl From<SupervisorError> for ScenarioError {
    fn from(e: SupervisorError) -> Self {
        ScenarioError::Supervisor(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub target: String,
    pub command: Vec<String>,
    pub startup_ms: u64,
}

/// Summary of a successful run, printed with `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub strict: bool,
    pub server: HostReport,
    pub client: HostReport,
    pub convergence: ConvergenceReport,
}

/// A command line as it would be run, for `--dry-run`.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    pub role: Role,
    pub config_path: String,
    pub argv: Vec<String>,
}

/// Resolve the ptp4l command lines without touching any host.
pub fn plan(config: &HarnessConfig, run_id: i64) -> Vec<PlannedCommand> {
    [Role::Server, Role::Client]
        .into_iter()
        .map(|role| {
            let host = config.host(role);
            let config_path =
                remote_path(host.install_type, &config.scenario.name, StagedKind::Config, run_id);
            let mut command = Ptp4lCommand::new(role, host, config_path.clone());
            if host.security_association_file.is_some() {
                command = command.with_security_association(remote_path(
                    host.install_type,
                    &config.scenario.name,
                    StagedKind::SecurityAssociation,
                    run_id,
                ));
            }
            PlannedCommand {
                role,
                config_path,
                argv: command.argv(),
            }
        })
        .collect()
}

/// Supervisor settings for `config`; fails if the sudo password is missing.
pub fn supervisor_options(config: &HarnessConfig) -> Result<SupervisorOptions, ConfigError> {
    let var = &config.prompt.secret_env;
    let secret = Secret::from_env(var).ok_or_else(|| ConfigError::MissingSecret { var: var.clone() })?;
    Ok(SupervisorOptions {
        prompt: config.prompt.clone(),
        secret,
        teardown: config.teardown.clone(),
        command_timeout: config.timeouts.command(),
    })
}

/// Everything a run has put in place and must clean up.
#[derive(Default)]
struct Deployment {
    processes: Vec<RemoteProcess>,
    staged: Vec<(Role, StagedFile)>,
    temp_files: Vec<NamedTempFile>,
}

pub struct Scenario<'a> {
    config: &'a HarnessConfig,
    server: &'a dyn Transport,
    client: &'a dyn Transport,
    options: SupervisorOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'a> Scenario<'a> {
    /// Checks for the sudo password before anything touches a host.
    pub fn new(
        config: &'a HarnessConfig,
        server: &'a dyn Transport,
        client: &'a dyn Transport,
    ) -> Result<Self, ScenarioError> {
        let options = supervisor_options(config)?;
        Ok(Self::with_options(config, server, client, options))
    }

    pub fn with_options(
        config: &'a HarnessConfig,
        server: &'a dyn Transport,
        client: &'a dyn Transport,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            config,
            server,
            client,
            options,
            shutdown: None,
        }
    }

    /// Abort waiting (and go straight to teardown) when `shutdown` flips.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn transport(&self, role: Role) -> &'a dyn Transport {
        match role {
            Role::Server => self.server,
            Role::Client => self.client,
        }
    }

    /// Stage files on both hosts, then run the pair.
    pub async fn run(&self) -> Result<ScenarioReport, ScenarioError> {
        let started_at = Utc::now();
        let run_id = started_at.timestamp();
        let mut deployment = Deployment::default();

        let work = async {
            let server_argv = self.prepare(Role::Server, run_id, &mut deployment).await?;
            let client_argv = self.prepare(Role::Client, run_id, &mut deployment).await?;
            self.exercise(server_argv, client_argv, started_at, &mut deployment)
                .await
        };
        let outcome = tokio::select! {
            outcome = work => outcome,
            _ = requested(self.shutdown.clone()) => Err(ScenarioError::Interrupted),
        };

        self.teardown(deployment).await;
        outcome
    }

    /// Run the pair with ready-made command lines; nothing is staged.
    #[cfg(test)]
    pub async fn run_commands(
        &self,
        server_argv: Vec<String>,
        client_argv: Vec<String>,
    ) -> Result<ScenarioReport, ScenarioError> {
        let mut deployment = Deployment::default();
        let work = self.exercise(server_argv, client_argv, Utc::now(), &mut deployment);
        let outcome = tokio::select! {
            outcome = work => outcome,
            _ = requested(self.shutdown.clone()) => Err(ScenarioError::Interrupted),
        };
        self.teardown(deployment).await;
        outcome
    }

    async fn prepare(
        &self,
        role: Role,
        run_id: i64,
        deployment: &mut Deployment,
    ) -> Result<Vec<String>, ScenarioError> {
        let host = self.config.host(role);
        let transport = self.transport(role);
        let tag = role.as_str();
        let name = &self.config.scenario.name;

        let mut local_config = host.config_file.clone();
        if let Some(kind) = host.unicast_transport {
            // Each side's table points at the other side.
            let peer_role = role.peer();
            let peer = self.config.host(peer_role);
            let address = discover_peer_address(
                kind,
                self.transport(peer_role),
                peer_role.as_str(),
                &peer.interface,
                &self.options,
            )
            .await?;
            info!(host = tag, peer = %address, transport = %kind, "adding unicast master table");
            let section = unicast_section(&address, &host.interface);
            let file = write_unicast_config(&host.config_file, &section, &format!("{name}-{tag}-"))?;
            local_config = file.path().to_path_buf();
            deployment.temp_files.push(file);
        }

        let config_path = remote_path(host.install_type, name, StagedKind::Config, run_id);
        let staged = stage_file(transport, tag, &local_config, &config_path, &self.options).await?;
        deployment.staged.push((role, staged));
        let mut command = Ptp4lCommand::new(role, host, config_path);

        if let Some(sa_file) = &host.security_association_file {
            let sa_path = remote_path(host.install_type, name, StagedKind::SecurityAssociation, run_id);
            let staged = stage_file(transport, tag, sa_file, &sa_path, &self.options).await?;
            deployment.staged.push((role, staged));
            command = command.with_security_association(sa_path);
        }

        if host.install_type == InstallType::Snap {
            execute(transport, tag, &snap_uds_setup_argv(), &self.options).await?;
        }

        Ok(command.argv())
    }

    async fn exercise(
        &self,
        server_argv: Vec<String>,
        client_argv: Vec<String>,
        started_at: DateTime<Utc>,
        deployment: &mut Deployment,
    ) -> Result<ScenarioReport, ScenarioError> {
        let server_ms = self.launch(Role::Server, &server_argv, deployment).await?;
        let client_ms = self.launch(Role::Client, &client_argv, deployment).await?;

        let strict = self.config.client.require_sync_below_threshold;
        let mut detector = ConvergenceDetector::from_config(&self.config.convergence, strict);
        let Some(client) = deployment.processes.last() else {
            return Err(ScenarioError::NotConverged {
                state: ConvergenceState::Failed,
                lines_seen: 0,
                elapsed_ms: 0,
            });
        };
        info!(
            strict,
            budget_secs = self.config.timeouts.sync_budget_secs,
            "waiting for client to synchronize"
        );
        let convergence = monitor(
            client.stdout(),
            &mut detector,
            self.config.timeouts.sync_budget(),
            Some(&client.liveness()),
        )
        .await;
        if !convergence.state.is_success() {
            log_diagnostics(client);
            let tail = convergence.lines.len().saturating_sub(DIAGNOSTIC_TAIL);
            error!(
                host = client.tag(),
                lines_seen = convergence.lines_seen,
                "last lines before giving up:\n{}",
                convergence.lines[tail..].join("\n")
            );
            return Err(ScenarioError::NotConverged {
                state: convergence.state,
                lines_seen: convergence.lines_seen,
                elapsed_ms: convergence.elapsed_ms,
            });
        }

        Ok(ScenarioReport {
            scenario: self.config.scenario.name.clone(),
            started_at,
            strict,
            server: HostReport {
                target: self.server.label().to_string(),
                command: server_argv,
                startup_ms: server_ms,
            },
            client: HostReport {
                target: self.client.label().to_string(),
                command: client_argv,
                startup_ms: client_ms,
            },
            convergence,
        })
    }

    /// Start `role` and wait for its startup marker. Returns how long that took.
    async fn launch(
        &self,
        role: Role,
        argv: &[String],
        deployment: &mut Deployment,
    ) -> Result<u64, ScenarioError> {
        let host = self.config.host(role);
        let marker = host.started_marker(role);
        let started = Instant::now();

        info!(host = %role, "starting {role}");
        let process = start_async(self.transport(role), role.as_str(), argv, &self.options).await?;
        let stdout = process.stdout().clone();
        let liveness = process.liveness();
        // Owned by the deployment from here on, so an interrupted wait still tears it down.
        deployment.processes.push(process);

        let found = wait_for(&stdout, marker, self.config.timeouts.startup(), Some(&liveness)).await;
        if !found {
            let exited = match deployment.processes.last() {
                Some(process) => {
                    log_diagnostics(process);
                    !process.is_running()
                }
                None => !liveness.is_running(),
            };
            return Err(ScenarioError::Startup {
                role,
                marker: marker.to_string(),
                exited,
            });
        }

        let elapsed = started.elapsed().as_millis() as u64;
        info!(host = %role, elapsed_ms = elapsed, "{role} started");
        Ok(elapsed)
    }

    /// Stop processes newest first, then remove staged files.
    async fn teardown(&self, mut deployment: Deployment) {
        while let Some(process) = deployment.processes.pop() {
            process.terminate().await;
        }
        for (role, staged) in deployment.staged.into_iter().rev() {
            let path = staged.path().to_string();
            if let Err(e) = staged.remove(self.transport(role), &self.options).await {
                warn!(host = %role, path, error = %e, "failed to remove staged file");
            }
        }
    }
}

/// Dump everything a process printed, for post-mortem.
fn log_diagnostics(process: &RemoteProcess) {
    error!(host = process.tag(), exit = ?process.exit_info(), "command was: {}", process.command());
    for (stream, buffer) in [("STDOUT", process.stdout()), ("STDERR", process.stderr())] {
        if buffer.is_empty() {
            error!(host = process.tag(), stream, "(no output)");
            continue;
        }
        error!(host = process.tag(), stream, bytes = buffer.len(), "\n{}", buffer.snapshot());
    }
}
