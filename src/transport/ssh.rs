/// OpenSSH client transport: every session is an `ssh` subprocess and file
/// copies go through `scp`.
///
/// Authentication is left to the user's SSH setup (keys, agent); `BatchMode`
/// makes a missing key fail fast instead of prompting.
///
/// Signals cannot travel over a non-pty channel, so each remote command
/// first reports its process group on stderr. Interrupt and kill are then
/// delivered by running `kill` against that group on the host.
use super::{
    ChildSession, ExitInfo, RemoteSignal, Session, SessionStreams, Transport, TransportError,
};
use crate::config::{HostConfig, SshConfig};
use crate::secret::Secret;
use async_trait::async_trait;
use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use zeroize::Zeroizing;

/// Prefix of the stderr line carrying the remote process group id.
const PGID_MARKER: &str = "ptp-pair-harness-pgid=";

pub struct SshTransport {
    label: String,
    destination: String,
    port: u16,
    config: SshConfig,
    secret: Option<Secret>,
}

impl SshTransport {
    pub fn new(host: &HostConfig, config: &SshConfig) -> Self {
        let destination = if host.username.is_empty() {
            host.hostname.clone()
        } else {
            format!("{}@{}", host.username, host.hostname)
        };
        Self {
            label: destination.clone(),
            destination,
            port: host.port,
            config: config.clone(),
            secret: None,
        }
    }

    /// Password for the `sudo kill` that delivers signals on the host.
    pub fn with_secret(mut self, secret: Option<Secret>) -> Self {
        self.secret = secret;
        self
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// `ssh` argv up to (not including) the remote command.
    fn session_launcher(&self) -> Vec<String> {
        let mut argv = vec![self.config.program.clone()];
        argv.extend(self.common_options());
        argv.extend([
            "-p".to_string(),
            self.port.to_string(),
            self.destination.clone(),
            "--".to_string(),
        ]);
        argv
    }

    fn scp_args(&self, local: &Path, remote: &str) -> Vec<String> {
        let mut argv = self.common_options();
        argv.extend([
            "-P".to_string(),
            self.port.to_string(),
            local.display().to_string(),
            format!("{}:{}", self.destination, remote),
        ]);
        argv
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn new_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        Ok(Arc::new(SshSession::new(
            self.session_launcher(),
            self.secret.clone(),
        )))
    }

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if !local.is_file() {
            return Err(TransportError::CopyFailed {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                detail: "local file does not exist".to_string(),
            });
        }

        let output = Command::new(&self.config.scp_program)
            .args(self.scp_args(local, remote))
            .output()
            .await
            .map_err(|e| TransportError::Spawn {
                program: self.config.scp_program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(TransportError::CopyFailed {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::debug!(
            host = %self.label,
            local = %local.display(),
            remote,
            "copied file"
        );
        Ok(())
    }
}

/// One command on the remote host, plus the means to signal it there.
pub struct SshSession {
    inner: ChildSession,
    /// Launcher for the side commands that deliver signals.
    control: Vec<String>,
    secret: Option<Secret>,
    remote_pgid: OnceLock<i32>,
}

impl SshSession {
    pub fn new(launcher: Vec<String>, secret: Option<Secret>) -> Self {
        Self {
            inner: ChildSession::new(launcher.clone(), None),
            control: launcher,
            secret,
            remote_pgid: OnceLock::new(),
        }
    }

    async fn remote_kill(&self, pgid: i32, signal: RemoteSignal) -> Result<(), TransportError> {
        let Some((program, args)) = self.control.split_first() else {
            return Err(TransportError::NotStarted);
        };
        let command = kill_command(pgid, signal, self.secret.is_some());
        tracing::debug!(remote_pgid = pgid, "{command}");

        let mut child = Command::new(program)
            .args(args)
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        if let (Some(mut stdin), Some(secret)) = (child.stdin.take(), &self.secret) {
            let mut reply = Zeroizing::new(Vec::with_capacity(secret.expose().len() + 1));
            reply.extend_from_slice(secret.expose().as_bytes());
            reply.push(b'\n');
            // sudo skips the read when its credentials are cached.
            let _ = stdin.write_all(&reply).await;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.contains("No such process") {
            return Err(TransportError::Closed);
        }
        Err(TransportError::RemoteSignal { signal, detail })
    }
}

#[async_trait]
impl Session for SshSession {
    async fn start(&self, command: &str) -> Result<SessionStreams, TransportError> {
        let mut streams = self.inner.start(&wrap_command(command)).await?;
        let (pgid, stderr) = split_marker(streams.stderr).await?;
        match pgid {
            Some(pgid) => {
                let _ = self.remote_pgid.set(pgid);
                tracing::debug!(remote_pgid = pgid, "remote command started");
            }
            None => tracing::warn!("remote command never reported its process group"),
        }
        streams.stderr = stderr;
        Ok(streams)
    }

    async fn wait(&self) -> Result<ExitInfo, TransportError> {
        self.inner.wait().await
    }

    async fn signal(&self, signal: RemoteSignal) -> Result<(), TransportError> {
        if self.inner.is_done() {
            return Err(TransportError::Closed);
        }
        match self.remote_pgid.get() {
            Some(&pgid) => self.remote_kill(pgid, signal).await,
            None => self.inner.signal(signal).await,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Report the login shell's pid, which sshd made a process group leader,
/// then run `command` under it.
fn wrap_command(command: &str) -> String {
    format!("echo {PGID_MARKER}$$ >&2; {command}")
}

fn kill_command(pgid: i32, signal: RemoteSignal, sudo: bool) -> String {
    let sudo = if sudo { "sudo -S " } else { "" };
    format!("{sudo}kill -s {} -- -{pgid}", signal.name())
}

fn parse_marker(line: &[u8]) -> Option<i32> {
    let line = std::str::from_utf8(line).ok()?;
    line.trim_end().strip_prefix(PGID_MARKER)?.parse().ok()
}

/// Consume stderr up to and including the marker line. Anything printed
/// before it (ssh warnings) is replayed ahead of the rest of the stream.
async fn split_marker(
    stderr: Box<dyn AsyncRead + Send + Unpin>,
) -> Result<(Option<i32>, Box<dyn AsyncRead + Send + Unpin>), TransportError> {
    let mut reader = BufReader::new(stderr);
    let mut before = Vec::new();
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok((None, Box::new(Cursor::new(before))));
        }
        if let Some(pgid) = parse_marker(&line) {
            return Ok((Some(pgid), Box::new(Cursor::new(before).chain(reader))));
        }
        before.extend_from_slice(&line);
    }
}
