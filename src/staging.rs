/// Placing config files on a host before ptp4l starts, and removing them
/// afterwards.
///
/// The transport can only write to the login user's home directory, so a
/// file is copied there first and then moved into the install's config
/// directory with `sudo mv`.
use crate::command::InstallType;
use crate::supervisor::{execute, SupervisorError, SupervisorOptions};
use crate::transport::{Transport, TransportError};
use std::path::Path;

/// What a staged file is for; decides its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    Config,
    SecurityAssociation,
}

/// Remote path for a staged file:
/// `<config dir><scenario>-<unix ts>.cfg`, with `-sa` for security associations.
pub fn remote_path(install: InstallType, scenario: &str, kind: StagedKind, unix_ts: i64) -> String {
    let dir = install.config_dir();
    match kind {
        StagedKind::Config => format!("{dir}{scenario}-{unix_ts}.cfg"),
        StagedKind::SecurityAssociation => format!("{dir}{scenario}-sa-{unix_ts}.cfg"),
    }
}

/// A file that now lives on the remote host.
#[derive(Debug, Clone)]
pub struct StagedFile {
    tag: String,
    remote_path: String,
}

#[derive(Debug)]
pub enum StagingError {
    Copy {
        tag: String,
        source: TransportError,
    },
    Install {
        tag: String,
        source: SupervisorError,
    },
    Remove {
        tag: String,
        source: SupervisorError,
    },
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingError::Copy { tag, source } => write!(f, "{tag} | copy failed: {source}"),
            StagingError::Install { tag, source } => {
                write!(f, "{tag} | moving file into place failed: {source}")
            }
            StagingError::Remove { tag, source } => {
                write!(f, "{tag} | removing staged file failed: {source}")
            }
        }
    }
}

impl std::error::Error for StagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StagingError::Copy { source, .. } => Some(source),
            StagingError::Install { source, .. } | StagingError::Remove { source, .. } => {
                Some(source)
            }
        }
    }
}

/// Name used for the intermediate copy in the home directory.
fn home_name(remote_path: &str) -> &str {
    remote_path.rsplit('/').next().unwrap_or(remote_path)
}

fn install_argv(home_name: &str, remote_path: &str) -> Vec<String> {
    vec![
        "sudo".to_string(),
        "mv".to_string(),
        home_name.to_string(),
        remote_path.to_string(),
    ]
}

fn remove_argv(remote_path: &str) -> Vec<String> {
    vec![
        "sudo".to_string(),
        "rm".to_string(),
        "-f".to_string(),
        remote_path.to_string(),
    ]
}

/// Copy `local` to `remote_path` on the host behind `transport`.
pub async fn stage_file(
    transport: &dyn Transport,
    tag: &str,
    local: &Path,
    remote_path: &str,
    options: &SupervisorOptions,
) -> Result<StagedFile, StagingError> {
    let name = home_name(remote_path);
    tracing::info!(
        host = tag,
        local = %local.display(),
        remote = remote_path,
        "staging file"
    );

    transport
        .copy_file(local, name)
        .await
        .map_err(|e| StagingError::Copy {
            tag: tag.to_string(),
            source: e,
        })?;

    if name != remote_path {
        execute(transport, tag, &install_argv(name, remote_path), options)
            .await
            .map_err(|e| StagingError::Install {
                tag: tag.to_string(),
                source: e,
            })?;
    }

    Ok(StagedFile {
        tag: tag.to_string(),
        remote_path: remote_path.to_string(),
    })
}

impl StagedFile {
    pub fn path(&self) -> &str {
        &self.remote_path
    }

    pub async fn remove(
        self,
        transport: &dyn Transport,
        options: &SupervisorOptions,
    ) -> Result<(), StagingError> {
        execute(transport, &self.tag, &remove_argv(&self.remote_path), options)
            .await
            .map_err(|e| StagingError::Remove {
                tag: self.tag.clone(),
                source: e,
            })?;
        tracing::debug!(host = %self.tag, remote = %self.remote_path, "removed staged file");
        Ok(())
    }
}
