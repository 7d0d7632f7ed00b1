/// Runs "remote" commands on this machine through `sh -c`.
///
/// Useful for dry runs on a single box and for exercising the supervisor
/// without a network. `home` plays the role of the login directory: commands
/// start there and relative copy targets resolve against it.
use super::{ChildSession, Session, Transport, TransportError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct LocalTransport {
    label: String,
    home: PathBuf,
}

impl LocalTransport {
    pub fn new(label: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            home: home.into(),
        }
    }

    /// Local transport rooted at `$HOME` (or the current directory).
    pub fn from_env(label: impl Into<String>) -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(label, home)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn new_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        Ok(Arc::new(ChildSession::new(
            vec!["sh".to_string(), "-c".to_string()],
            Some(self.home.clone()),
        )))
    }

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let target = self.home.join(remote);
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| TransportError::CopyFailed {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                detail: e.to_string(),
            })?;
        tracing::debug!(
            local = %local.display(),
            remote = %target.display(),
            "copied file"
        );
        Ok(())
    }
}
