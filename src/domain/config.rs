//! Installer configuration.
//!
//! One explicit struct is threaded through every component; nothing in the
//! installer reads process-wide mutable state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::dependency::{Dependency, DependencySource};

/// Service naming and filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unit name without the `.service` suffix.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Human-readable unit description.
    #[serde(default = "default_description")]
    pub description: String,

    /// Directory holding the notifier sources; becomes the working directory.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    /// Entry script, relative to `install_dir` unless absolute.
    #[serde(default = "default_entry_script")]
    pub entry_script: PathBuf,

    /// Virtualenv directory, relative to `install_dir` unless absolute.
    #[serde(default = "default_venv_dir")]
    pub venv_dir: PathBuf,

    /// Directory where the unit file is written.
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Group granting access to sound devices.
    #[serde(default = "default_audio_group")]
    pub audio_group: String,

    /// Account the service runs as (defaults to the invoking user).
    #[serde(default)]
    pub user: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            description: default_description(),
            install_dir: None,
            entry_script: default_entry_script(),
            venv_dir: default_venv_dir(),
            unit_dir: default_unit_dir(),
            audio_group: default_audio_group(),
            user: None,
        }
    }
}

fn default_service_name() -> String {
    "klipper-voice-manager".into()
}

fn default_description() -> String {
    "Klipper Voice Manager".into()
}

fn default_entry_script() -> PathBuf {
    PathBuf::from("main.py")
}

fn default_venv_dir() -> PathBuf {
    PathBuf::from("venv")
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_audio_group() -> String {
    "audio".into()
}

/// Timing and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Grace period before the managed process launches.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,

    /// Backoff between restarts after a failure.
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u64,

    /// Exit status the managed process uses to stop without being restarted.
    #[serde(default = "default_success_exit_status")]
    pub success_exit_status: i32,

    /// How long to wait for the service to become active after start.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Interval between status polls while waiting.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long the main process must stay up before a start counts as successful.
    #[serde(default = "default_settle")]
    pub settle_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: default_startup_delay(),
            restart_sec: default_restart_sec(),
            success_exit_status: default_success_exit_status(),
            start_timeout_secs: default_start_timeout(),
            poll_interval_ms: default_poll_interval(),
            settle_secs: default_settle(),
        }
    }
}

const fn default_startup_delay() -> u64 {
    10
}

const fn default_restart_sec() -> u64 {
    5
}

const fn default_success_exit_status() -> i32 {
    143
}

const fn default_start_timeout() -> u64 {
    30 // covers the startup delay plus interpreter start
}

const fn default_poll_interval() -> u64 {
    500
}

const fn default_settle() -> u64 {
    3
}

/// A dependency entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyEntry {
    /// Package name.
    pub name: String,

    /// Optional constraint such as `>=2.5` or `==1.0.3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DependencyEntry {
    fn named(name: &str) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }
}

/// Declared dependency sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Debian packages installed through apt.
    #[serde(default = "default_system_deps")]
    pub system: Vec<DependencyEntry>,

    /// Python packages installed into the service virtualenv.
    #[serde(default = "default_python_deps")]
    pub python: Vec<DependencyEntry>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            system: default_system_deps(),
            python: default_python_deps(),
        }
    }
}

fn default_system_deps() -> Vec<DependencyEntry> {
    [
        "python3",
        "python3-venv",
        "python3-pip",
        "ffmpeg",
        "libsdl2-mixer-2.0-0",
        "pulseaudio-utils",
    ]
    .into_iter()
    .map(DependencyEntry::named)
    .collect()
}

fn default_python_deps() -> Vec<DependencyEntry> {
    [
        "pygame",
        "pydub",
        "psutil",
        "websocket-client",
        "PyYAML",
        "watchdog",
    ]
    .into_iter()
    .map(DependencyEntry::named)
    .collect()
}

/// Complete installer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstallerConfig {
    /// Service naming and layout.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Timing and restart policy.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Declared dependencies.
    #[serde(default)]
    pub dependencies: DependencyConfig,
}

impl InstallerConfig {
    /// Full unit name including the `.service` suffix.
    #[must_use]
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.service.name)
    }

    /// Install directory, defaulting to the current directory.
    #[must_use]
    pub fn install_dir(&self) -> PathBuf {
        self.service.install_dir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// Absolute virtualenv directory.
    #[must_use]
    pub fn venv_dir(&self) -> PathBuf {
        self.install_dir().join(&self.service.venv_dir)
    }

    /// Interpreter inside the virtualenv.
    #[must_use]
    pub fn venv_python(&self) -> PathBuf {
        self.venv_dir().join("bin/python")
    }

    /// Absolute entry script path.
    #[must_use]
    pub fn entry_script(&self) -> PathBuf {
        self.install_dir().join(&self.service.entry_script)
    }

    /// Path of the unit file.
    #[must_use]
    pub fn unit_file_path(&self) -> PathBuf {
        self.service.unit_dir.join(self.unit_name())
    }

    /// Start verification timeout.
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.start_timeout_secs)
    }

    /// Status poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.poll_interval_ms)
    }

    /// Time the service must stay up after start.
    #[must_use]
    pub const fn settle(&self) -> Duration {
        Duration::from_secs(self.timing.settle_secs)
    }

    /// All declared dependencies, system packages first.
    ///
    /// Entries with a malformed version constraint are reported as errors.
    pub fn declared_dependencies(&self) -> super::Result<Vec<Dependency>> {
        let system = self
            .dependencies
            .system
            .iter()
            .map(|d| Dependency::parse(&d.name, d.version.as_deref(), DependencySource::System));
        let python = self
            .dependencies
            .python
            .iter()
            .map(|d| Dependency::parse(&d.name, d.version.as_deref(), DependencySource::Python));

        system.chain(python).collect()
    }

    /// Default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voice-service-installer")
            .join("config.toml")
    }
}
