//! External command execution.
//!
//! Every package manager, init system and audio tool invocation goes
//! through [`CommandRunner`], so the rest of the installer can be driven
//! by a scripted runner in tests.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::domain::{AppError, Result};

/// A command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Inherit the terminal instead of capturing output.
    pub interactive: bool,
}

impl CommandSpec {
    /// Create a command with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            interactive: false,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Attach the command to the terminal.
    #[must_use]
    pub const fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Short description of a failure for error messages.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let status = self
            .code
            .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"));
        let detail = self.stderr.trim();
        if detail.is_empty() {
            status
        } else {
            let last = detail.lines().last().unwrap_or(detail);
            format!("{status}: {last}")
        }
    }

    /// Turn a non-zero exit into an error.
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppError::command(spec.to_string(), self.failure_summary()))
        }
    }
}

/// Runs external commands.
pub trait CommandRunner {
    /// Run `spec` to completion. Spawn failures are errors; non-zero exits are not.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Resolve `program` on the search path.
    fn which(&self, program: &str) -> Option<PathBuf>;

    /// Whether a filesystem path exists on the host.
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %spec, "Running command");

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);

        if spec.interactive {
            let status = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|e| spawn_error(spec, e))?;

            return Ok(CommandOutput {
                code: status.code(),
                ..CommandOutput::default()
            });
        }

        let output = command
            .stdin(Stdio::null())
            .env("LC_ALL", "C")
            .output()
            .map_err(|e| spawn_error(spec, e))?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        tracing::trace!(command = %spec, code = ?result.code, "Command finished");

        Ok(result)
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        let path = env::var_os("PATH")?;
        env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

fn spawn_error(spec: &CommandSpec, err: std::io::Error) -> AppError {
    AppError::Command {
        program: spec.program.clone(),
        message: format!("could not be started: {err}"),
        source: Some(err),
    }
}
