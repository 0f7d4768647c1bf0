//! Systemd service integration.
//!
//! Applies a service descriptor to systemd and drives the unit through
//! its lifecycle. Every transition tolerates being called from a state
//! where it has nothing to do.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use tempfile::NamedTempFile;

use super::command::{CommandOutput, CommandRunner, CommandSpec};
use super::privilege::Elevation;
use super::probe::CapabilityProbe;
use crate::domain::{
    AppError, Result, ServiceDescriptor, ServiceState, ServiceStatus, StartOutcome, StartPolicy,
};

/// Journal lines attached to a start failure.
const FAILURE_LOG_LINES: usize = 20;

/// Systemd service controller for one unit.
pub struct SystemdController<'a> {
    runner: &'a dyn CommandRunner,
    elevation: Elevation,
    unit: String,
    unit_dir: PathBuf,
}

impl<'a> SystemdController<'a> {
    /// Create a controller for `unit` whose file lives in `unit_dir`.
    #[must_use]
    pub fn new(
        runner: &'a dyn CommandRunner,
        elevation: Elevation,
        unit: impl Into<String>,
        unit_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            elevation,
            unit: unit.into(),
            unit_dir: unit_dir.into(),
        }
    }

    /// Unit name including suffix.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Get the service file path.
    #[must_use]
    pub fn service_file_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit)
    }

    /// Get service status. Always safe to call.
    pub fn query_status(&self) -> Result<ServiceStatus> {
        CapabilityProbe::new(self.runner).service_status(&self.unit, &self.service_file_path())
    }

    /// Current lifecycle state.
    pub fn query_state(&self) -> Result<ServiceState> {
        Ok(self.query_status()?.state())
    }

    /// Write the unit file wholesale and reload systemd.
    ///
    /// Any existing registration is replaced.
    pub fn install(&self, descriptor: &ServiceDescriptor) -> Result<InstallResult> {
        if descriptor.unit_name() != self.unit {
            return Err(AppError::Config {
                message: format!(
                    "Descriptor for {} handed to controller for {}",
                    descriptor.unit_name(),
                    self.unit
                ),
            });
        }

        let service_path = self.service_file_path();
        let unit_content = descriptor.render();
        let changed = fs::read_to_string(&service_path).map_or(true, |old| old != unit_content);

        self.write_unit_file(&service_path, &unit_content)?;
        tracing::info!(path = %service_path.display(), changed, "Service file written");

        self.systemctl(&["daemon-reload"])?;

        Ok(InstallResult {
            service_path,
            changed,
        })
    }

    /// Enable the unit at boot. No-op if already enabled.
    pub fn enable(&self) -> Result<()> {
        let status = self.query_status()?;
        match status.state() {
            ServiceState::Absent => Err(AppError::Config {
                message: format!("Cannot enable {}: unit is not installed", self.unit),
            }),
            _ if status.is_enabled => {
                tracing::debug!(unit = %self.unit, "Already enabled");
                Ok(())
            }
            _ => {
                self.systemctl(&["enable", &self.unit])?;
                tracing::info!(unit = %self.unit, "Service enabled");
                Ok(())
            }
        }
    }

    /// Start the unit and wait until it is active.
    ///
    /// A process that exits with status 0 or the designated success status
    /// counts as a clean terminal state. Failure is reported, not retried.
    pub fn start(&self, policy: &StartPolicy) -> Result<StartOutcome> {
        if self.query_status()?.is_running() {
            tracing::debug!(unit = %self.unit, "Already running");
            return Ok(StartOutcome::Running);
        }
        self.start_with("start", policy)
    }

    /// Restart the unit so a rewritten descriptor takes effect.
    pub fn restart(&self, policy: &StartPolicy) -> Result<StartOutcome> {
        self.start_with("restart", policy)
    }

    fn start_with(&self, verb: &str, policy: &StartPolicy) -> Result<StartOutcome> {
        let spec = self.elevated(&[verb, &self.unit]);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(self.start_failure(&output.failure_summary()));
        }

        tracing::info!(unit = %self.unit, "Start requested, waiting for active state");
        self.wait_until_started(policy)
    }

    /// Poll until one main process has stayed active for the settle window.
    ///
    /// A unit counts as started only after `settle_polls` consecutive active
    /// observations with the same `ExecMainPID`. Entering `auto-restart` or
    /// a rising `NRestarts` means the process crashed and is a failure.
    fn wait_until_started(&self, policy: &StartPolicy) -> Result<StartOutcome> {
        let attempts = policy.attempts();
        let needed = policy.settle_polls();
        let mut baseline_restarts = None;
        // (main pid, consecutive active polls)
        let mut streak: Option<(u32, u32)> = None;

        for attempt in 1..=attempts {
            let status = self.query_status()?;
            let baseline = *baseline_restarts.get_or_insert(status.restarts);

            if status.state() == ServiceState::Failed {
                return Err(self.start_failure(&format!("unit entered failed state ({})", status.result)));
            }
            if status.is_restarting() || status.restarts > baseline {
                return Err(self.start_failure(&format!(
                    "main process exited ({}), systemd is restarting it",
                    status.result
                )));
            }

            if status.is_running() {
                let polls = match streak {
                    Some((pid, n)) if pid == status.main_pid => n + 1,
                    _ => 1,
                };
                if polls >= needed {
                    tracing::info!(unit = %self.unit, attempt, pid = status.main_pid, "Service is running");
                    return Ok(StartOutcome::Running);
                }
                streak = Some((status.main_pid, polls));
            } else {
                streak = None;
                if let Some(code) = status.exited_cleanly(policy.success_exit_status) {
                    tracing::info!(unit = %self.unit, code, "Service exited cleanly, not restarting");
                    return Ok(StartOutcome::ExitedCleanly { status: code });
                }
            }

            tracing::debug!(
                unit = %self.unit,
                attempt,
                active = %status.active_state,
                sub = %status.sub_state,
                settled = streak.map_or(0, |(_, n)| n),
                "Waiting for service"
            );
            if attempt < attempts {
                thread::sleep(policy.poll_interval);
            }
        }

        let summary = if streak.is_some() {
            format!("active but not yet settled after {}s", policy.timeout.as_secs())
        } else {
            format!("not active after {}s", policy.timeout.as_secs())
        };
        Err(self.start_failure(&summary))
    }

    fn start_failure(&self, summary: &str) -> AppError {
        let logs = self.view_logs(FAILURE_LOG_LINES).unwrap_or_default();
        let mut diagnostic = summary.to_string();
        if !logs.trim().is_empty() {
            diagnostic.push_str("\nRecent log:\n");
            diagnostic.push_str(logs.trim_end());
        }
        diagnostic.push_str(&format!(
            "\nInspect with: journalctl -u {} -n 50 --no-pager",
            self.unit
        ));

        AppError::StartFailure {
            unit: self.unit.clone(),
            diagnostic,
        }
    }

    /// Stop the unit. No-op if not running.
    pub fn stop(&self) -> Result<()> {
        let status = self.query_status()?;
        if !status.is_running() && status.active_state != "activating" {
            tracing::debug!(unit = %self.unit, "Not running, nothing to stop");
            return Ok(());
        }

        self.systemctl(&["stop", &self.unit])?;
        tracing::info!(unit = %self.unit, "Service stopped");
        Ok(())
    }

    /// Disable the unit. No-op if not enabled.
    pub fn disable(&self) -> Result<()> {
        if !self.query_status()?.is_enabled {
            tracing::debug!(unit = %self.unit, "Not enabled, nothing to disable");
            return Ok(());
        }

        self.systemctl(&["disable", &self.unit])?;
        tracing::info!(unit = %self.unit, "Service disabled");
        Ok(())
    }

    /// Remove the unit entirely. Succeeds trivially if already absent.
    pub fn remove(&self) -> Result<()> {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Service may not have been stopped");
        }
        if let Err(e) = self.disable() {
            tracing::warn!(error = %e, "Service may not have been fully disabled");
        }

        let service_path = self.service_file_path();
        if self.runner.path_exists(&service_path) {
            self.remove_unit_file(&service_path)?;
            tracing::info!(path = %service_path.display(), "Service file removed");
        }

        if let Err(e) = self.systemctl(&["daemon-reload"]) {
            tracing::warn!(error = %e, "daemon-reload after removal failed");
        }
        // Clears a lingering failed state; fails harmlessly for unknown units.
        match self.runner.run(&self.elevated(&["reset-failed", &self.unit])) {
            Ok(output) if !output.success() => {
                tracing::debug!(
                    unit = %self.unit,
                    detail = %output.failure_summary(),
                    "reset-failed had nothing to clear"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "reset-failed could not be run"),
        }

        tracing::info!(unit = %self.unit, "Service uninstalled");
        Ok(())
    }

    /// View service logs.
    pub fn view_logs(&self, lines: usize) -> Result<String> {
        let spec = self.elevation.wrap(CommandSpec::new("journalctl").args([
            "-u".to_string(),
            self.unit.clone(),
            "-n".to_string(),
            lines.to_string(),
            "--no-pager".to_string(),
        ]));
        let output = self.runner.run(&spec)?;

        Ok(output.stdout)
    }

    fn elevated(&self, args: &[&str]) -> CommandSpec {
        self.elevation
            .wrap(CommandSpec::new("systemctl").args(args.iter().copied()))
    }

    fn systemctl(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = self.elevated(args);
        self.runner.run(&spec)?.check(&spec)
    }

    /// Replace `path` in one rename so systemd never sees a partial file.
    fn write_unit_file(&self, path: &Path, content: &str) -> Result<()> {
        match self.elevation {
            Elevation::Direct => {
                fs::create_dir_all(&self.unit_dir)
                    .map_err(|e| AppError::io("Failed to create unit directory", e))?;
                let staged = stage(content, &self.unit_dir)?;
                staged
                    .persist(path)
                    .map_err(|e| AppError::io("Failed to replace service file", e.error))?;
                set_mode(path)?;
            }
            Elevation::Sudo => {
                let staged = stage(content, &std::env::temp_dir())?;
                let staged_path = staged.path().display().to_string();
                let sibling_path = path.with_extension("service.tmp").display().to_string();
                let target_path = path.display().to_string();

                let copy = CommandSpec::new("install").args([
                    "-D",
                    "-m",
                    "0644",
                    staged_path.as_str(),
                    sibling_path.as_str(),
                ]);
                let rename =
                    CommandSpec::new("mv").args(["-f", sibling_path.as_str(), target_path.as_str()]);

                for spec in [copy, rename] {
                    let spec = self.elevation.wrap(spec);
                    self.runner.run(&spec)?.check(&spec)?;
                }
            }
        }
        Ok(())
    }

    fn remove_unit_file(&self, path: &Path) -> Result<()> {
        match self.elevation {
            Elevation::Direct => fs::remove_file(path)
                .map_err(|e| AppError::io("Failed to remove service file", e)),
            Elevation::Sudo => {
                let spec = self
                    .elevation
                    .wrap(CommandSpec::new("rm").args(["-f".to_string(), path.display().to_string()]));
                self.runner.run(&spec)?.check(&spec).map(|_| ())
            }
        }
    }
}

fn stage(content: &str, dir: &Path) -> Result<NamedTempFile> {
    let mut staged = NamedTempFile::new_in(dir)
        .map_err(|e| AppError::io("Failed to create staging file", e))?;
    staged
        .write_all(content.as_bytes())
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|e| AppError::io("Failed to write staging file", e))?;
    Ok(staged)
}

#[cfg(unix)]
fn set_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .map_err(|e| AppError::io("Failed to set service file permissions", e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Result of installing the service.
#[derive(Debug)]
pub struct InstallResult {
    /// Path where service file was written.
    pub service_path: PathBuf,
    /// Whether the content differs from what was there before.
    pub changed: bool,
}
