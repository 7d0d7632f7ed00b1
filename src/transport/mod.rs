pub mod local;
pub mod ssh;

pub use local::LocalTransport;
pub use ssh::SshTransport;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// The three standard streams of a started remote command.
pub struct SessionStreams {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSignal {
    Interrupt,
    Kill,
}

impl RemoteSignal {
    /// Name as accepted by `kill -s`.
    pub fn name(self) -> &'static str {
        match self {
            RemoteSignal::Interrupt => "INT",
            RemoteSignal::Kill => "KILL",
        }
    }

    fn as_nix(self) -> Signal {
        match self {
            RemoteSignal::Interrupt => Signal::SIGINT,
            RemoteSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "exited without an exit code"),
        }
    }
}

/// Errors produced by transports and their sessions.
#[derive(Debug)]
pub enum TransportError {
    /// The session or its process is already gone; the end-of-stream case.
    Closed,
    NotStarted,
    AlreadyStarted,
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Io(std::io::Error),
    Signal(Errno),
    /// The `kill` run on the remote host failed.
    RemoteSignal {
        signal: RemoteSignal,
        detail: String,
    },
    CopyFailed {
        local: PathBuf,
        remote: String,
        detail: String,
    },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "session already closed"),
            TransportError::NotStarted => write!(f, "session has no running command"),
            TransportError::AlreadyStarted => write!(f, "session already started a command"),
            TransportError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Signal(errno) => write!(f, "failed to deliver signal: {errno}"),
            TransportError::RemoteSignal { signal, detail } => {
                write!(f, "remote kill -s {} failed: {detail}", signal.name())
            }
            TransportError::CopyFailed {
                local,
                remote,
                detail,
            } => write!(
                f,
                "failed to copy {} to {}: {}",
                local.display(),
                remote,
                detail
            ),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Spawn { source, .. } => Some(source),
            TransportError::Io(e) => Some(e),
            TransportError::Signal(errno) => Some(errno),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// A connection to one host that can run commands and receive files.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable target (e.g. "pi@raspi-a.lan").
    fn label(&self) -> &str;

    /// Open a fresh session; one session runs one command.
    async fn new_session(&self) -> Result<Arc<dyn Session>, TransportError>;

    /// Copy a local file to `remote`. Relative remote paths land in the
    /// login user's home directory.
    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), TransportError>;
}

/// One remote command. Methods take `&self` so a monitor task can `wait`
/// while teardown delivers signals.
#[async_trait]
pub trait Session: Send + Sync {
    async fn start(&self, command: &str) -> Result<SessionStreams, TransportError>;
    async fn wait(&self) -> Result<ExitInfo, TransportError>;
    async fn signal(&self, signal: RemoteSignal) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Session backed by a local child process whose argv ends with the command
/// line (`sh -c <cmd>`, `ssh host -- <cmd>`).
///
/// The child runs in its own process group so signals reach everything it
/// spawned.
pub struct ChildSession {
    launcher: Vec<String>,
    working_dir: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    pid: OnceLock<i32>,
    exited: AtomicBool,
    closed: AtomicBool,
}

impl ChildSession {
    pub fn new(launcher: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            launcher,
            working_dir,
            child: Mutex::new(None),
            pid: OnceLock::new(),
            exited: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The child has been reaped or the session closed.
    fn is_done(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.exited.load(Ordering::SeqCst)
    }

    fn deliver(&self, signal: Signal) -> Result<(), TransportError> {
        let pid = *self.pid.get().ok_or(TransportError::NotStarted)?;
        match killpg(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(TransportError::Closed),
            Err(errno) => Err(TransportError::Signal(errno)),
        }
    }
}

#[async_trait]
impl Session for ChildSession {
    async fn start(&self, command: &str) -> Result<SessionStreams, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let Some((program, args)) = self.launcher.split_first() else {
            return Err(TransportError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty launcher"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            program: program.clone(),
            source: e,
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TransportError::Io(std::io::Error::other(
                "child stdio was not piped",
            )));
        };

        if let Some(pid) = child.id() {
            let _ = self.pid.set(pid as i32);
        }
        tracing::debug!(pid = ?child.id(), program = %program, "session process spawned");
        *slot = Some(child);

        Ok(SessionStreams {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }

    async fn wait(&self) -> Result<ExitInfo, TransportError> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut().ok_or(TransportError::NotStarted)?;
        let status = child.wait().await?;
        self.exited.store(true, Ordering::SeqCst);

        use std::os::unix::process::ExitStatusExt;
        Ok(ExitInfo {
            code: status.code(),
            signal: status.signal(),
        })
    }

    async fn signal(&self, signal: RemoteSignal) -> Result<(), TransportError> {
        if self.is_done() {
            return Err(TransportError::Closed);
        }
        self.deliver(signal.as_nix())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.exited.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.deliver(Signal::SIGKILL) {
            Ok(()) | Err(TransportError::NotStarted) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh() -> ChildSession {
        ChildSession::new(vec!["sh".to_string(), "-c".to_string()], None)
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let session = sh();
        let mut streams = session.start("echo out; echo err >&2; exit 3").await.unwrap();
        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        streams.stderr.read_to_string(&mut err).await.unwrap();
        let exit = session.wait().await.unwrap();

        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let session = sh();
        let _streams = session.start("true").await.unwrap();
        assert!(matches!(
            session.start("true").await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_signal_before_start() {
        let session = sh();
        assert!(matches!(
            session.signal(RemoteSignal::Interrupt).await,
            Err(TransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_reports_signal_exit() {
        let session = Arc::new(sh());
        let _streams = session.start("exec sleep 30").await.unwrap();
        session.signal(RemoteSignal::Interrupt).await.unwrap();
        let exit = session.wait().await.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(Signal::SIGINT as i32));
    }

    #[tokio::test]
    async fn test_signal_and_close_after_exit_report_closed() {
        let session = sh();
        let _streams = session.start("true").await.unwrap();
        session.wait().await.unwrap();
        assert!(matches!(
            session.signal(RemoteSignal::Kill).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(session.close().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let session = sh();
        let _streams = session.start("exec sleep 30").await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(session.close().await, Err(TransportError::Closed)));
        let exit = session.wait().await.unwrap();
        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let session = ChildSession::new(vec!["nonexistent-binary-xyz".to_string()], None);
        let err = session.start("anything").await.err().unwrap();
        assert!(matches!(err, TransportError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn test_exit_info_display() {
        let ok = ExitInfo {
            code: Some(0),
            signal: None,
        };
        assert!(ok.success());
        assert_eq!(ok.to_string(), "exit status 0");
        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
    }
}
