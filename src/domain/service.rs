//! Service lifecycle state.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Lifecycle state of the managed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No unit file and systemd does not know the unit.
    Absent,
    /// Unit file present, not enabled, not running.
    Registered,
    /// Enabled at boot, not running.
    Enabled,
    /// Active.
    Running,
    /// systemd reports the unit as failed.
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Registered => "registered",
            Self::Enabled => "enabled",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Service status information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Whether the unit file is on disk.
    pub is_installed: bool,
    /// Whether systemd has the unit loaded.
    pub is_loaded: bool,
    /// Whether the service is enabled to start on boot.
    pub is_enabled: bool,
    /// systemd `ActiveState` (`active`, `inactive`, `failed`, ...).
    pub active_state: String,
    /// systemd `SubState` (`running`, `dead`, `exited`, ...).
    pub sub_state: String,
    /// systemd `Result` of the last run (`success`, `exit-code`, ...).
    pub result: String,
    /// Exit status of the last main process, if it exited.
    pub exit_status: Option<i32>,
    /// `ExecMainPID`; 0 when no main process is running.
    pub main_pid: u32,
    /// `NRestarts`: automatic restarts since the unit was last started.
    pub restarts: u32,
}

impl ServiceStatus {
    /// Status of a unit systemd has never heard of.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }

    /// Whether the service is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.active_state.as_str(), "active" | "reloading")
    }

    /// Whether the main process died and systemd is waiting to start it again.
    ///
    /// With `Restart=on-failure` a crash never reaches the `failed` state;
    /// the unit cycles through `activating/auto-restart` instead.
    #[must_use]
    pub fn is_restarting(&self) -> bool {
        self.sub_state == "auto-restart"
            || (self.active_state == "activating"
                && !self.result.is_empty()
                && self.result != "success")
    }

    /// Collapse the orthogonal flags into a lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        if !self.is_installed && !self.is_loaded {
            ServiceState::Absent
        } else if self.active_state == "failed" {
            ServiceState::Failed
        } else if self.is_running() {
            ServiceState::Running
        } else if self.is_enabled {
            ServiceState::Enabled
        } else {
            ServiceState::Registered
        }
    }

    /// Whether the main process exited on its own with a status counted as success.
    #[must_use]
    pub fn exited_cleanly(&self, success_exit_status: i32) -> Option<i32> {
        if self.is_running() || self.active_state == "failed" || self.result != "success" {
            return None;
        }
        self.exit_status
            .filter(|s| *s == 0 || *s == success_exit_status)
    }

    /// Get a short status string.
    #[must_use]
    pub fn short_status(&self) -> &'static str {
        match (self.state(), self.is_enabled) {
            (ServiceState::Absent, _) => "not installed",
            (ServiceState::Failed, _) => "failed",
            (ServiceState::Registered, _) => "installed, disabled",
            (ServiceState::Enabled, _) => "enabled, stopped",
            (ServiceState::Running, false) => "running (not enabled)",
            (ServiceState::Running, true) => "running",
        }
    }
}

/// How a verified start ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartOutcome {
    /// The service reached an active state.
    Running,
    /// The process exited with a status counted as success; not restarted.
    ExitedCleanly { status: i32 },
}

/// Bounds for post-start verification.
#[derive(Debug, Clone, Copy)]
pub struct StartPolicy {
    /// Total time to wait for an active state.
    pub timeout: Duration,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// How long one main process must stay active to count as started.
    pub settle: Duration,
    /// Exit status the process uses for a deliberate stop.
    pub success_exit_status: i32,
}

impl StartPolicy {
    /// Number of status polls that fit in the timeout, never fewer than
    /// the settle window needs.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        if self.poll_interval.is_zero() {
            return 1;
        }
        let n = self.timeout.as_millis() / self.poll_interval.as_millis().max(1);
        u32::try_from(n)
            .unwrap_or(u32::MAX)
            .max(self.settle_polls())
    }

    /// Consecutive active polls, with the same main process, that span the settle window.
    #[must_use]
    pub fn settle_polls(&self) -> u32 {
        if self.poll_interval.is_zero() {
            return 1;
        }
        let n = self
            .settle
            .as_millis()
            .div_ceil(self.poll_interval.as_millis().max(1));
        u32::try_from(n).unwrap_or(u32::MAX).saturating_add(1)
    }
}

/// Whether uninstall revokes the audio group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupDecision {
    /// Leave membership untouched.
    #[default]
    Keep,
    /// Remove the user from the group.
    Remove,
}

impl GroupDecision {
    /// Interpret a free-form confirmation answer.
    ///
    /// Only an explicit yes removes; anything else keeps.
    #[must_use]
    pub fn from_answer(answer: &str) -> Self {
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => Self::Remove,
            _ => Self::Keep,
        }
    }
}
