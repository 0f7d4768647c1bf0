//! Privilege elevation and user switching.
//!
//! The credential is validated once per run; later privileged commands
//! reuse the cached sudo timestamp without prompting again.
//!
//! Commands that belong to the service user's session (sound server
//! queries, the virtualenv) are dropped back to that user when the
//! installer itself runs as root.

use super::command::{CommandRunner, CommandSpec};
use crate::domain::{AppError, Identity, Result};

/// How privileged commands are executed for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Commands run as-is (already root, or no privilege needed).
    Direct,
    /// Commands are prefixed with non-interactive `sudo`.
    Sudo,
}

impl Elevation {
    /// Acquire elevation given whether the process is root.
    ///
    /// # Errors
    /// Returns `Permission` if sudo is unavailable or authorization is denied.
    pub fn acquire(runner: &dyn CommandRunner, is_root: bool) -> Result<Self> {
        if is_root {
            tracing::debug!("Running as root, no elevation needed");
            return Ok(Self::Direct);
        }

        if runner.which("sudo").is_none() {
            return Err(AppError::Permission {
                message: "not running as root and sudo is not installed".into(),
            });
        }

        let output = runner.run(&CommandSpec::new("sudo").arg("-v").interactive())?;
        if !output.success() {
            return Err(AppError::Permission {
                message: "sudo authorization was denied".into(),
            });
        }

        tracing::info!("Elevated privileges acquired via sudo");
        Ok(Self::Sudo)
    }

    /// Rewrite `spec` so it runs with elevated privileges.
    #[must_use]
    pub fn wrap(self, spec: CommandSpec) -> CommandSpec {
        match self {
            Self::Direct => spec,
            Self::Sudo => CommandSpec {
                program: "sudo".into(),
                args: ["-n".to_string(), spec.program]
                    .into_iter()
                    .chain(spec.args)
                    .collect(),
                interactive: spec.interactive,
            },
        }
    }
}

/// Who session-bound commands run as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSession {
    /// Account to switch to; `None` runs commands as the current process.
    target: Option<Identity>,
}

impl UserSession {
    /// Run commands as the current process.
    #[must_use]
    pub const fn current() -> Self {
        Self { target: None }
    }

    /// Session of the service user.
    ///
    /// A switch is only needed when root acts on behalf of another account;
    /// otherwise the caller already is that user and keeps its environment.
    #[must_use]
    pub fn for_service(identity: &Identity, is_root: bool) -> Self {
        if is_root && identity.uid != 0 {
            Self {
                target: Some(identity.clone()),
            }
        } else {
            Self::current()
        }
    }

    /// The account commands switch to, if any.
    #[must_use]
    pub const fn target(&self) -> Option<&Identity> {
        self.target.as_ref()
    }

    /// Rewrite `spec` so it runs as the session user.
    ///
    /// sudo resets the environment, so `XDG_RUNTIME_DIR` is set explicitly
    /// for clients that locate the sound server through it.
    #[must_use]
    pub fn wrap(&self, spec: CommandSpec) -> CommandSpec {
        let Some(identity) = &self.target else {
            return spec;
        };

        CommandSpec {
            program: "runuser".into(),
            args: [
                "-u".to_string(),
                identity.user.clone(),
                "--".into(),
                "env".into(),
                format!("XDG_RUNTIME_DIR={}", identity.runtime_dir()),
                spec.program,
            ]
            .into_iter()
            .chain(spec.args)
            .collect(),
            interactive: spec.interactive,
        }
    }
}
