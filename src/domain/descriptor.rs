//! Service descriptor: the declarative description of the managed unit.
//!
//! A descriptor is built once and then only read. `render` produces the
//! systemd unit file; identical descriptors render byte-identical text.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

/// Resource limit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Limit {
    /// A fixed ceiling.
    Value(u64),
    /// No ceiling.
    Infinity,
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Infinity => f.write_str("infinity"),
        }
    }
}

/// Restart behaviour handed to systemd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartPolicy {
    /// Seconds between restart attempts.
    pub restart_sec: u64,
    /// Non-zero exit status treated as a clean stop.
    pub success_exit_status: i32,
}

/// Resource ceilings applied unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    /// `LimitNOFILE`
    pub open_files: Limit,
    /// `LimitMEMLOCK`
    pub locked_memory: Limit,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            open_files: Limit::Value(65536),
            locked_memory: Limit::Infinity,
        }
    }
}

/// Immutable description of the managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    name: String,
    description: String,
    exec_start: Vec<String>,
    working_directory: PathBuf,
    user: String,
    group: String,
    supplementary_groups: Vec<String>,
    environment: BTreeMap<String, String>,
    restart: RestartPolicy,
    limits: ResourceLimits,
    startup_delay_secs: u64,
    enabled: bool,
}

/// Field values for a new descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorParts {
    pub name: String,
    pub description: String,
    pub exec_start: Vec<String>,
    pub working_directory: PathBuf,
    pub user: String,
    pub group: String,
    pub supplementary_groups: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub restart: RestartPolicy,
    pub limits: ResourceLimits,
    pub startup_delay_secs: u64,
    pub enabled: bool,
}

impl ServiceDescriptor {
    /// Freeze a set of parts into a descriptor.
    #[must_use]
    pub fn new(parts: DescriptorParts) -> Self {
        Self {
            name: parts.name,
            description: parts.description,
            exec_start: parts.exec_start,
            working_directory: parts.working_directory,
            user: parts.user,
            group: parts.group,
            supplementary_groups: parts.supplementary_groups,
            environment: parts.environment,
            restart: parts.restart,
            limits: parts.limits,
            startup_delay_secs: parts.startup_delay_secs,
            enabled: parts.enabled,
        }
    }

    /// Unit name without suffix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit file name.
    #[must_use]
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Environment mapping in emission order.
    #[must_use]
    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    #[must_use]
    pub const fn restart(&self) -> RestartPolicy {
        self.restart
    }

    #[must_use]
    pub const fn limits(&self) -> ResourceLimits {
        self.limits
    }

    #[must_use]
    pub const fn startup_delay_secs(&self) -> u64 {
        self.startup_delay_secs
    }

    /// Whether the unit should be enabled at boot.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Render the systemd unit file.
    #[must_use]
    pub fn render(&self) -> String {
        let environment: String = self
            .environment
            .iter()
            .map(|(key, value)| format!("Environment=\"{key}={}\"\n", escape_env_value(value)))
            .collect();

        let exec_start = self
            .exec_start
            .iter()
            .map(|arg| quote_exec_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");

        let supplementary = if self.supplementary_groups.is_empty() {
            String::new()
        } else {
            format!(
                "SupplementaryGroups={}\n",
                self.supplementary_groups.join(" ")
            )
        };

        format!(
            r#"[Unit]
Description={description}
After=network-online.target sound.target
Wants=network-online.target

[Service]
Type=simple
User={user}
Group={group}
{supplementary}WorkingDirectory={working_dir}
{environment}ExecStartPre=/bin/sleep {delay}
ExecStart={exec_start}
Restart=on-failure
RestartSec={restart_sec}
SuccessExitStatus={success_status}

# Resource limits
LimitNOFILE={nofile}
LimitMEMLOCK={memlock}

[Install]
WantedBy=multi-user.target
"#,
            description = escape_specifiers(&self.description),
            user = self.user,
            group = self.group,
            working_dir = escape_specifiers(&self.working_directory.display().to_string()),
            delay = self.startup_delay_secs,
            restart_sec = self.restart.restart_sec,
            success_status = self.restart.success_exit_status,
            nofile = self.limits.open_files,
            memlock = self.limits.locked_memory,
        )
    }
}

/// Double `%` so systemd does not expand it as a unit specifier.
fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

/// Escape a value for a double-quoted `Environment=` assignment.
fn escape_env_value(value: &str) -> String {
    escape_specifiers(value)
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
}

/// One `ExecStart=` argument as systemd splits the command line.
///
/// `$` is doubled because systemd substitutes environment variables there.
fn quote_exec_arg(arg: &str) -> String {
    let escaped = escape_specifiers(arg).replace('$', "$$");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));

    if needs_quotes {
        format!(
            "\"{}\"",
            escaped.replace('\\', "\\\\").replace('"', "\\\"")
        )
    } else {
        escaped
    }
}
