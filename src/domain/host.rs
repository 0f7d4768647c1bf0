//! Who the service runs as and where it lives.

use std::path::PathBuf;

use serde::Serialize;

use super::InstallerConfig;

/// The account the managed service runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Login name.
    pub user: String,
    /// Numeric user id; selects `/run/user/<uid>`.
    pub uid: u32,
    /// Primary group name.
    pub group: String,
}

impl Identity {
    /// Per-user runtime directory used by the sound servers.
    #[must_use]
    pub fn runtime_dir(&self) -> String {
        format!("/run/user/{}", self.uid)
    }
}

/// Filesystem locations baked into the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePaths {
    /// Working directory of the service.
    pub install_dir: PathBuf,
    /// Interpreter that runs the entry script.
    pub python: PathBuf,
    /// Script started by the unit.
    pub entry_script: PathBuf,
}

impl ServicePaths {
    /// Resolve paths from configuration.
    #[must_use]
    pub fn from_config(config: &InstallerConfig) -> Self {
        Self {
            install_dir: config.install_dir(),
            python: config.venv_python(),
            entry_script: config.entry_script(),
        }
    }
}
