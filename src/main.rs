mod buffer;
mod capture;
mod command;
mod config;
mod convergence;
mod prompt;
mod scenario;
mod secret;
mod signals;
mod staging;
mod supervisor;
mod transport;
mod unicast;
mod waiter;

use clap::Parser;
use config::HarnessConfig;
use scenario::Scenario;
use secret::Secret;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use transport::{LocalTransport, SshTransport, Transport};

/// Start ptp4l on a server and a client host, wait for both to come up, and
/// check that the client synchronizes to the server.
#[derive(Parser, Debug)]
#[command(name = "ptp-pair-harness", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "harness.toml")]
    config: PathBuf,

    /// Run both roles on this machine instead of over SSH
    #[arg(long)]
    local: bool,

    /// Seconds to wait for each startup marker (overrides config)
    #[arg(long)]
    startup_timeout: Option<u64>,

    /// Seconds the client gets to synchronize (overrides config)
    #[arg(long)]
    sync_budget: Option<u64>,

    /// Validate config and print the resolved ptp4l command lines, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the run report as JSON on success
    #[arg(long)]
    json: bool,

    /// Log every captured output line
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<HarnessConfig, config::ConfigError> {
    let mut config = if cli.config.exists() {
        HarnessConfig::load(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found, using defaults");
        HarnessConfig::default()
    };
    if let Some(secs) = cli.startup_timeout {
        config.timeouts.startup_secs = secs;
    }
    if let Some(secs) = cli.sync_budget {
        config.timeouts.sync_budget_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

fn transports(cli: &Cli, config: &HarnessConfig) -> (Box<dyn Transport>, Box<dyn Transport>) {
    let (server, client): (Box<dyn Transport>, Box<dyn Transport>) = if cli.local {
        (
            Box::new(LocalTransport::from_env("server@local")),
            Box::new(LocalTransport::from_env("client@local")),
        )
    } else {
        let secret = Secret::from_env(&config.prompt.secret_env);
        (
            Box::new(SshTransport::new(&config.server, &config.ssh).with_secret(secret.clone())),
            Box::new(SshTransport::new(&config.client, &config.ssh).with_secret(secret)),
        )
    };
    (server, client)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    tracing::debug!(?config, "resolved configuration");

    if cli.dry_run {
        let run_id = chrono::Utc::now().timestamp();
        for planned in scenario::plan(&config, run_id) {
            let host = config.host(planned.role);
            println!("{} ({}@{})", planned.role, host.username, host.hostname);
            println!("  config: {} -> {}", host.config_file.display(), planned.config_path);
            println!("  command: {}", supervisor::prepare_command(&planned.argv));
        }
        return Ok(());
    }

    let (server, client) = transports(&cli, &config);
    let shutdown = signals::install();
    let scenario = Scenario::new(&config, server.as_ref(), client.as_ref())?.with_shutdown(shutdown);

    tracing::info!(
        scenario = %config.scenario.name,
        server = server.label(),
        client = client.label(),
        "starting scenario"
    );
    let report = scenario.run().await?;
    tracing::info!(
        state = ?report.convergence.state,
        elapsed_ms = report.convergence.elapsed_ms,
        "scenario passed"
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
