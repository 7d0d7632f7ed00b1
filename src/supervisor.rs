/// Remote process lifecycle: start a command over a transport, capture its
/// output, answer sudo prompts, track liveness, and tear it down.
///
/// Each started process gets three background tasks: a stdout drain, a
/// stderr drain that also answers password prompts, and an exit monitor that
/// is the only writer of the liveness state.
use crate::buffer::OutputBuffer;
use crate::capture::{drain, StreamKind};
use crate::config::{PromptConfig, TeardownConfig};
use crate::prompt::PromptResponder;
use crate::secret::Secret;
use crate::transport::{ExitInfo, RemoteSignal, Session, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything the supervisor needs besides the transport and the command.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub prompt: PromptConfig,
    pub secret: Secret,
    pub teardown: TeardownConfig,
    /// Upper bound for blocking `execute` calls.
    pub command_timeout: Duration,
}

/// State published by the exit monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitInfo),
    /// `wait` itself failed; the process is treated as gone.
    Lost,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

/// Read side of a process's liveness flag.
#[derive(Debug, Clone)]
pub struct Liveness {
    rx: watch::Receiver<ProcessState>,
}

impl Liveness {
    pub fn new(rx: watch::Receiver<ProcessState>) -> Self {
        Self { rx }
    }

    pub fn is_running(&self) -> bool {
        self.rx.borrow().is_running()
    }

    pub fn state(&self) -> ProcessState {
        *self.rx.borrow()
    }

    /// Resolves once the process is no longer running.
    ///
    /// If the monitor disappears without publishing an exit this never
    /// resolves, leaving the caller's timeout in charge.
    pub async fn stopped(&mut self) {
        let outcome = self.rx.wait_for(|s| !s.is_running()).await.map(|_| ());
        if outcome.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Output of a command run to completion.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitInfo,
}

/// Errors that can occur while starting or running a remote command.
#[derive(Debug)]
pub enum SupervisorError {
    /// Could not open a session on the transport.
    Session {
        tag: String,
        source: TransportError,
    },
    /// The session refused to start the command.
    Start {
        tag: String,
        command: String,
        source: TransportError,
    },
    /// Waiting for a blocking command failed.
    Wait {
        tag: String,
        command: String,
        source: TransportError,
    },
    /// A blocking command exited unsuccessfully.
    CommandFailed {
        tag: String,
        command: String,
        exit: ExitInfo,
        stderr: String,
    },
    /// A blocking command did not finish in time.
    Timeout {
        tag: String,
        command: String,
        after: Duration,
    },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Session { tag, source } => {
                write!(f, "{tag} | failed to create session: {source}")
            }
            SupervisorError::Start {
                tag,
                command,
                source,
            } => write!(
                f,
                "{tag} | failed to start session with command '{command}': {source}"
            ),
            SupervisorError::Wait {
                tag,
                command,
                source,
            } => write!(f, "{tag} | waiting for '{command}' failed: {source}"),
            SupervisorError::CommandFailed {
                tag,
                command,
                exit,
                stderr,
            } => write!(f, "{tag} | command '{command}' failed: {exit}\n{stderr}"),
            SupervisorError::Timeout {
                tag,
                command,
                after,
            } => write!(
                f,
                "{tag} | command '{command}' did not finish within {}s",
                after.as_secs()
            ),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Session { source, .. }
            | SupervisorError::Start { source, .. }
            | SupervisorError::Wait { source, .. } => Some(source),
            SupervisorError::CommandFailed { .. } | SupervisorError::Timeout { .. } => None,
        }
    }
}

/// Join `argv` into a shell command line and make a leading `sudo` read its
/// password from stdin (`sudo -S`) so the prompt responder can answer it.
pub fn prepare_command(argv: &[String]) -> String {
    let command = argv.join(" ");
    match command.strip_prefix("sudo ") {
        Some(rest) => format!("sudo -S {rest}"),
        None => command,
    }
}

/// A started remote command.
///
/// Exactly one owner may terminate it. Dropping a handle that was never
/// terminated schedules the same teardown on the current runtime.
pub struct RemoteProcess {
    tag: String,
    command: String,
    session: Arc<dyn Session>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    liveness: Liveness,
    tasks: Vec<JoinHandle<()>>,
    teardown: TeardownConfig,
    terminated: bool,
}

/// Start `argv` on `transport` without waiting for it to finish.
pub async fn start_async(
    transport: &dyn Transport,
    tag: &str,
    argv: &[String],
    options: &SupervisorOptions,
) -> Result<RemoteProcess, SupervisorError> {
    let command = prepare_command(argv);
    tracing::info!(host = tag, remote = transport.label(), "[exec-async] {}", argv.join(" "));

    let session = transport
        .new_session()
        .await
        .map_err(|e| SupervisorError::Session {
            tag: tag.to_string(),
            source: e,
        })?;

    let streams = session
        .start(&command)
        .await
        .map_err(|e| SupervisorError::Start {
            tag: tag.to_string(),
            command: command.clone(),
            source: e,
        })?;

    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();
    let responder = PromptResponder::new(&options.prompt, options.secret.clone(), streams.stdin);

    let mut tasks = Vec::with_capacity(3);
    {
        let (buffer, tag) = (stdout.clone(), tag.to_string());
        let reader = streams.stdout;
        tasks.push(tokio::spawn(async move {
            drain(reader, buffer, &tag, StreamKind::Stdout, None).await;
        }));
    }
    {
        let (buffer, tag) = (stderr.clone(), tag.to_string());
        let reader = streams.stderr;
        tasks.push(tokio::spawn(async move {
            drain(reader, buffer, &tag, StreamKind::Stderr, Some(responder)).await;
        }));
    }

    let (state_tx, state_rx) = watch::channel(ProcessState::Running);
    tasks.push(tokio::spawn(monitor(
        Arc::clone(&session),
        tag.to_string(),
        state_tx,
    )));

    Ok(RemoteProcess {
        tag: tag.to_string(),
        command,
        session,
        stdout,
        stderr,
        liveness: Liveness::new(state_rx),
        tasks,
        teardown: options.teardown.clone(),
        terminated: false,
    })
}

/// Wait for the process to exit and publish the outcome.
async fn monitor(session: Arc<dyn Session>, tag: String, state: watch::Sender<ProcessState>) {
    let next = match session.wait().await {
        Ok(exit) => {
            if exit.success() {
                tracing::info!(host = %tag, "remote process exited");
            } else {
                tracing::info!(host = %tag, %exit, "remote process exited");
            }
            ProcessState::Exited(exit)
        }
        Err(e) => {
            tracing::warn!(host = %tag, error = %e, "lost track of remote process");
            ProcessState::Lost
        }
    };
    state.send_replace(next);
}

impl RemoteProcess {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The command line as sent to the transport.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout(&self) -> &OutputBuffer {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputBuffer {
        &self.stderr
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn is_running(&self) -> bool {
        self.liveness.is_running()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        match self.liveness.state() {
            ProcessState::Exited(exit) => Some(exit),
            _ => None,
        }
    }

    /// Interrupt, wait, kill, close, wait. Best effort: errors are logged and
    /// teardown carries on.
    pub async fn terminate(mut self) {
        self.terminated = true;
        tracing::info!(host = %self.tag, "terminating remote process");
        teardown(
            Arc::clone(&self.session),
            self.tag.clone(),
            self.teardown.clone(),
        )
        .await;
        // Let the drains pick up whatever the process printed on its way out.
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(self.teardown.reap_period(), task).await;
        }
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(host = %self.tag, "remote process dropped, scheduling teardown");
                handle.spawn(teardown(
                    Arc::clone(&self.session),
                    self.tag.clone(),
                    self.teardown.clone(),
                ));
            }
            Err(_) => {
                tracing::warn!(
                    host = %self.tag,
                    "remote process dropped outside a runtime, teardown skipped"
                );
            }
        }
    }
}

async fn teardown(session: Arc<dyn Session>, tag: String, config: TeardownConfig) {
    report(&tag, "interrupt", session.signal(RemoteSignal::Interrupt).await);
    // Without this pause the daemon can be left orphaned on the remote host.
    tokio::time::sleep(config.grace_period()).await;
    report(&tag, "kill", session.signal(RemoteSignal::Kill).await);
    report(&tag, "close", session.close().await);
    // Give the remote OS time to reap the process before anything rebinds its ports.
    tokio::time::sleep(config.reap_period()).await;
}

fn report(tag: &str, step: &str, result: Result<(), TransportError>) {
    match result {
        Ok(()) | Err(TransportError::Closed) => {}
        Err(e) => tracing::warn!(host = tag, step, error = %e, "teardown step failed"),
    }
}

/// Run `argv` to completion and return what it printed.
///
/// Uses the same sudo rewrite and prompt responder as `start_async`. A
/// non-zero exit is an error carrying the captured stderr.
pub async fn execute(
    transport: &dyn Transport,
    tag: &str,
    argv: &[String],
    options: &SupervisorOptions,
) -> Result<ExecOutput, SupervisorError> {
    let command = prepare_command(argv);
    tracing::info!(host = tag, remote = transport.label(), "[exec-block] {}", argv.join(" "));

    let session = transport
        .new_session()
        .await
        .map_err(|e| SupervisorError::Session {
            tag: tag.to_string(),
            source: e,
        })?;
    let streams = session
        .start(&command)
        .await
        .map_err(|e| SupervisorError::Start {
            tag: tag.to_string(),
            command: command.clone(),
            source: e,
        })?;

    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();
    let responder = PromptResponder::new(&options.prompt, options.secret.clone(), streams.stdin);

    let run = async {
        let (_, _, exit) = tokio::join!(
            drain(streams.stdout, stdout.clone(), tag, StreamKind::Stdout, None),
            drain(
                streams.stderr,
                stderr.clone(),
                tag,
                StreamKind::Stderr,
                Some(responder)
            ),
            session.wait(),
        );
        exit
    };

    let exit = match tokio::time::timeout(options.command_timeout, run).await {
        Ok(Ok(exit)) => exit,
        Ok(Err(e)) => {
            return Err(SupervisorError::Wait {
                tag: tag.to_string(),
                command,
                source: e,
            })
        }
        Err(_) => {
            report(tag, "close", session.close().await);
            return Err(SupervisorError::Timeout {
                tag: tag.to_string(),
                command,
                after: options.command_timeout,
            });
        }
    };

    if !exit.success() {
        return Err(SupervisorError::CommandFailed {
            tag: tag.to_string(),
            command,
            exit,
            stderr: stderr.snapshot(),
        });
    }

    Ok(ExecOutput {
        stdout: stdout.snapshot(),
        stderr: stderr.snapshot(),
        exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use crate::waiter::wait_for;

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            prompt: PromptConfig::default(),
            secret: Secret::new("pw"),
            teardown: TeardownConfig {
                grace_period_ms: 50,
                reap_period_ms: 10,
            },
            command_timeout: Duration::from_secs(5),
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn local() -> (tempfile::TempDir, LocalTransport) {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new("local", dir.path());
        (dir, transport)
    }

    #[test]
    fn test_prepare_command_rewrites_leading_sudo() {
        assert_eq!(
            prepare_command(&argv(&["sudo", "/usr/sbin/ptp4l", "-i", "eth0"])),
            "sudo -S /usr/sbin/ptp4l -i eth0"
        );
    }

    #[test]
    fn test_prepare_command_leaves_other_commands() {
        assert_eq!(prepare_command(&argv(&["cat", "/etc/hostname"])), "cat /etc/hostname");
        assert_eq!(prepare_command(&argv(&["sudoku"])), "sudoku");
        assert_eq!(prepare_command(&argv(&["echo", "sudo x"])), "echo sudo x");
    }

    #[tokio::test]
    async fn test_start_async_captures_both_streams() {
        let (_dir, transport) = local();
        let process = start_async(
            &transport,
            "t",
            &argv(&["echo", "hello;", "echo", "oops", ">&2;", "sleep", "30"]),
            &options(),
        )
        .await
        .unwrap();

        assert!(wait_for(process.stdout(), "hello", Duration::from_secs(5), None).await);
        assert!(wait_for(process.stderr(), "oops", Duration::from_secs(5), None).await);
        assert!(process.is_running());
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_liveness_flips_when_process_exits() {
        let (_dir, transport) = local();
        let process = start_async(&transport, "t", &argv(&["exit", "4"]), &options())
            .await
            .unwrap();
        let mut liveness = process.liveness();
        tokio::time::timeout(Duration::from_secs(5), liveness.stopped())
            .await
            .unwrap();
        assert!(!process.is_running());
        assert_eq!(process.exit_info().unwrap().code, Some(4));
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_liveness_flips_on_clean_exit_too() {
        let (_dir, transport) = local();
        let process = start_async(&transport, "t", &argv(&["true"]), &options())
            .await
            .unwrap();
        let mut liveness = process.liveness();
        tokio::time::timeout(Duration::from_secs(5), liveness.stopped())
            .await
            .unwrap();
        assert!(process.exit_info().unwrap().success());
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_stops_running_process() {
        let (_dir, transport) = local();
        let process = start_async(&transport, "t", &argv(&["exec", "sleep", "30"]), &options())
            .await
            .unwrap();
        let mut liveness = process.liveness();
        assert!(liveness.is_running());

        process.terminate().await;
        tokio::time::timeout(Duration::from_secs(5), liveness.stopped())
            .await
            .unwrap();
        assert!(!liveness.is_running());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_quiet() {
        let (_dir, transport) = local();
        let process = start_async(&transport, "t", &argv(&["true"]), &options())
            .await
            .unwrap();
        let mut liveness = process.liveness();
        liveness.stopped().await;
        // Signals and close all report Closed here, which teardown tolerates.
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_drop_schedules_teardown() {
        let (_dir, transport) = local();
        let process = start_async(&transport, "t", &argv(&["exec", "sleep", "30"]), &options())
            .await
            .unwrap();
        let mut liveness = process.liveness();
        drop(process);
        tokio::time::timeout(Duration::from_secs(5), liveness.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_prompt_on_stderr_is_answered_through_stdin() {
        let (_dir, transport) = local();
        let script = "printf '[sudo] password for tester: ' >&2; read pw; echo >&2; echo got=$pw";
        let process = start_async(&transport, "t", &argv(&[script]), &options())
            .await
            .unwrap();
        assert!(wait_for(process.stdout(), "got=pw", Duration::from_secs(5), None).await);
        assert!(wait_for(process.stderr(), "tester: \n", Duration::from_secs(5), None).await);
        assert_eq!(process.stderr().snapshot(), "[sudo] password for tester: \n");
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_kills_process_that_ignores_interrupt() {
        let (_dir, transport) = local();
        let mut opts = options();
        opts.teardown = TeardownConfig {
            grace_period_ms: 300,
            reap_period_ms: 200,
        };
        let script = "trap 'echo got-int' INT; echo ready; while true; do sleep 0.05; done";
        let process = start_async(&transport, "t", &argv(&[script]), &opts)
            .await
            .unwrap();
        assert!(wait_for(process.stdout(), "ready", Duration::from_secs(5), None).await);
        let stdout = process.stdout().clone();
        let mut liveness = process.liveness();

        process.terminate().await;
        tokio::time::timeout(Duration::from_secs(5), liveness.stopped())
            .await
            .unwrap();

        assert!(stdout.contains("got-int\n"));
        match liveness.state() {
            ProcessState::Exited(exit) => {
                assert_eq!(exit.code, None);
                assert_eq!(exit.signal, Some(9));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_returns_output() {
        let (_dir, transport) = local();
        let out = execute(&transport, "t", &argv(&["echo", "eth0"]), &options())
            .await
            .unwrap();
        assert_eq!(out.stdout, "eth0\n");
        assert!(out.stderr.is_empty());
        assert!(out.exit.success());
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_is_error() {
        let (_dir, transport) = local();
        let err = execute(
            &transport,
            "t",
            &argv(&["echo", "bad", ">&2;", "exit", "2"]),
            &options(),
        )
        .await
        .unwrap_err();
        match err {
            SupervisorError::CommandFailed { exit, stderr, .. } => {
                assert_eq!(exit.code, Some(2));
                assert_eq!(stderr, "bad\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let (_dir, transport) = local();
        let mut opts = options();
        opts.command_timeout = Duration::from_millis(100);
        let err = execute(&transport, "t", &argv(&["exec", "sleep", "30"]), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_start_failure_is_setup_error() {
        struct Broken;

        #[async_trait::async_trait]
        impl Transport for Broken {
            fn label(&self) -> &str {
                "broken"
            }
            async fn new_session(&self) -> Result<Arc<dyn Session>, TransportError> {
                Err(TransportError::Closed)
            }
            async fn copy_file(
                &self,
                _local: &std::path::Path,
                _remote: &str,
            ) -> Result<(), TransportError> {
                Err(TransportError::Closed)
            }
        }

        let err = start_async(&Broken, "t", &argv(&["true"]), &options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::Session { .. }));
        assert!(err.to_string().contains("failed to create session"));
    }
}
