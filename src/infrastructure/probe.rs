//! Host capability detection.
//!
//! All parsing of free-form tool output lives here; callers only see
//! typed capabilities, versions and statuses.

use std::collections::BTreeMap;
use std::path::Path;

use super::command::{CommandRunner, CommandSpec};
use super::privilege::UserSession;
use crate::domain::{
    Capability, CapabilityKind, CapabilitySet, Dependency, DependencySource, Result, ServiceStatus,
};

/// `ExecMainCode` value for a main process that called `exit()`.
const CLD_EXITED: &str = "1";

/// Read-only queries against the host.
pub struct CapabilityProbe<'a> {
    runner: &'a dyn CommandRunner,
    /// Session the sound servers are queried from.
    session: UserSession,
}

impl<'a> CapabilityProbe<'a> {
    /// Create a probe over `runner`.
    #[must_use]
    pub const fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            session: UserSession::current(),
        }
    }

    /// Query sound servers from `session` instead of the current process.
    ///
    /// Sound servers are per-user; root sees none of its own.
    #[must_use]
    pub fn in_session(mut self, session: UserSession) -> Self {
        self.session = session;
        self
    }

    /// Detect every capability afresh.
    ///
    /// Absent tools are reported as absent capabilities, never as errors.
    #[must_use]
    pub fn probe(&self) -> CapabilitySet {
        if let Some(user) = self.session.target() {
            tracing::debug!(user = %user.user, uid = user.uid, "Querying sound servers as service user");
        }

        let pulse = self.probe_pulse();
        let pipewire = self.probe_pipewire(&pulse);

        let set = CapabilitySet::new([
            self.probe_package_manager(),
            self.probe_init_system(),
            pulse,
            pipewire,
        ]);

        for cap in set.iter() {
            tracing::debug!(capability = %cap.kind, present = cap.present, "Probed capability");
        }

        set
    }

    fn probe_package_manager(&self) -> Capability {
        let kind = CapabilityKind::PackageManager;
        if self.runner.which("apt-get").is_none() || self.runner.which("dpkg-query").is_none() {
            return Capability::absent(kind);
        }

        let version = self
            .stdout_of(&CommandSpec::new("apt-get").arg("--version"))
            .and_then(|out| first_line_word(&out, 1));

        let cap = Capability::present(kind).with("tool", "apt");
        match version {
            Some(v) => cap.with("version", v),
            None => cap,
        }
    }

    fn probe_init_system(&self) -> Capability {
        let kind = CapabilityKind::InitSystem;
        if self.runner.which("systemctl").is_none() {
            return Capability::absent(kind);
        }

        // "systemd 252 (252.33-1~deb12u1)"
        match self.stdout_of(&CommandSpec::new("systemctl").arg("--version")) {
            Some(out) => {
                let cap = Capability::present(kind);
                match first_line_word(&out, 1) {
                    Some(v) => cap.with("version", v),
                    None => cap,
                }
            }
            None => Capability::absent(kind),
        }
    }

    fn probe_pulse(&self) -> Capability {
        let kind = CapabilityKind::PulseAudio;
        if self.runner.which("pactl").is_none() {
            return Capability::absent(kind);
        }

        let Some(out) = self.stdout_of(&self.session.wrap(CommandSpec::new("pactl").arg("info"))) else {
            return Capability::absent(kind);
        };

        let fields = parse_colon_fields(&out);
        let mut cap = Capability::present(kind);
        if let Some(name) = fields.get("Server Name") {
            cap = cap.with("server_name", name.clone());
        }
        if let Some(version) = fields.get("Server Version") {
            cap = cap.with("server_version", version.clone());
        }
        cap
    }

    fn probe_pipewire(&self, pulse: &Capability) -> Capability {
        let kind = CapabilityKind::PipeWire;

        if self.runner.which("pw-cli").is_some()
            && self
                .stdout_of(&self.session.wrap(CommandSpec::new("pw-cli").args(["info", "0"])))
                .is_some()
        {
            return Capability::present(kind).with("source", "pw-cli");
        }

        // pipewire-pulse announces itself as "PulseAudio (on PipeWire 1.0.5)"
        let via_pulse = pulse
            .metadata
            .get("server_name")
            .is_some_and(|name| name.contains("on PipeWire"));
        if via_pulse {
            return Capability::present(kind).with("source", "pipewire-pulse");
        }

        Capability::absent(kind)
    }

    /// Installed version of `dep`, or `None` if it is not installed.
    ///
    /// `python` is the interpreter whose environment holds Python packages.
    ///
    /// # Errors
    /// Returns error only if the query tool cannot be started.
    pub fn installed_version(&self, dep: &Dependency, python: &Path) -> Result<Option<String>> {
        match dep.source {
            DependencySource::System => {
                let spec = CommandSpec::new("dpkg-query")
                    .args(["-W", "-f=${Status} ${Version}", dep.name.as_str()]);
                let out = self.runner.run(&spec)?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(parse_dpkg_status(&out.stdout))
            }
            DependencySource::Python => {
                if !self.runner.path_exists(python) {
                    return Ok(None);
                }
                let spec = CommandSpec::new(python.display().to_string())
                    .args(["-m", "pip", "show", dep.name.as_str()]);
                let out = self.runner.run(&spec)?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(parse_colon_fields(&out.stdout).remove("Version"))
            }
        }
    }

    /// Current systemd view of `unit`, combined with unit file presence.
    ///
    /// # Errors
    /// Returns error if `systemctl` cannot be started.
    pub fn service_status(&self, unit: &str, unit_file: &Path) -> Result<ServiceStatus> {
        let is_installed = self.runner.path_exists(unit_file);

        let spec = CommandSpec::new("systemctl").args([
            "show",
            unit,
            "-p",
            "LoadState",
            "-p",
            "ActiveState",
            "-p",
            "SubState",
            "-p",
            "UnitFileState",
            "-p",
            "Result",
            "-p",
            "ExecMainCode",
            "-p",
            "ExecMainStatus",
            "-p",
            "ExecMainPID",
            "-p",
            "NRestarts",
        ]);
        let out = self.runner.run(&spec)?;
        if !out.success() {
            tracing::debug!(unit, "systemctl show failed, treating unit as unknown");
            return Ok(ServiceStatus {
                is_installed,
                ..ServiceStatus::absent()
            });
        }

        let props = parse_properties(&out.stdout);
        let prop = |key: &str| props.get(key).cloned().unwrap_or_default();

        let load_state = prop("LoadState");
        let exit_status = if prop("ExecMainCode") == CLD_EXITED {
            prop("ExecMainStatus").parse().ok()
        } else {
            None
        };

        Ok(ServiceStatus {
            is_installed,
            is_loaded: !load_state.is_empty() && load_state != "not-found",
            is_enabled: matches!(
                prop("UnitFileState").as_str(),
                "enabled" | "enabled-runtime" | "linked"
            ),
            active_state: prop("ActiveState"),
            sub_state: prop("SubState"),
            result: prop("Result"),
            exit_status,
            main_pid: prop("ExecMainPID").parse().unwrap_or(0),
            restarts: prop("NRestarts").parse().unwrap_or(0),
        })
    }

    /// Whether `user` is a member of `group`.
    ///
    /// # Errors
    /// Returns error if `id` cannot be started.
    pub fn is_group_member(&self, user: &str, group: &str) -> Result<bool> {
        let out = self.runner.run(&CommandSpec::new("id").args(["-nG", user]))?;
        Ok(out.success() && out.stdout.split_whitespace().any(|g| g == group))
    }

    fn stdout_of(&self, spec: &CommandSpec) -> Option<String> {
        match self.runner.run(spec) {
            Ok(out) if out.success() => Some(out.stdout),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(command = %spec, error = %e, "Probe command unavailable");
                None
            }
        }
    }
}

/// Parse `KEY=VALUE` lines.
fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Parse `Key: value` lines.
fn parse_colon_fields(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Version from `dpkg-query` output if the package is fully installed.
fn parse_dpkg_status(text: &str) -> Option<String> {
    // "install ok installed 4.4.2-1"
    let mut words = text.split_whitespace();
    let state: Vec<&str> = words.by_ref().take(3).collect();
    if state.last() != Some(&"installed") {
        return None;
    }
    words.next().map(ToString::to_string)
}

/// The `n`th whitespace-separated word of the first line.
fn first_line_word(text: &str, n: usize) -> Option<String> {
    text.lines()
        .next()?
        .split_whitespace()
        .nth(n)
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::command::fake::FakeRunner;
    use crate::infrastructure::command::CommandOutput;

    fn host_with_tools() -> FakeRunner {
        let runner = FakeRunner::new()
            .with_program("apt-get")
            .with_program("dpkg-query")
            .with_program("systemctl");
        runner.respond("apt-get --version", CommandOutput::ok("apt 2.6.1 (amd64)\n"));
        runner.respond(
            "systemctl --version",
            CommandOutput::ok("systemd 252 (252.33-1~deb12u1)\n+PAM +AUDIT\n"),
        );
        runner
    }

    #[test]
    fn test_mandatory_tools_detected() {
        let runner = host_with_tools();
        let set = CapabilityProbe::new(&runner).probe();

        assert!(set.require_mandatory().is_ok());
        let init = set.get(CapabilityKind::InitSystem).unwrap();
        assert_eq!(init.metadata.get("version").map(String::as_str), Some("252"));
        assert!(!set.has_audio_backend());
    }

    #[test]
    fn test_pipewire_detected_through_pulse_server_name() {
        let runner = host_with_tools().with_program("pactl");
        runner.respond(
            "pactl info",
            CommandOutput::ok("Server String: /run/user/1000/pulse/native\nServer Name: PulseAudio (on PipeWire 1.0.5)\nServer Version: 15.0.0\n"),
        );

        let set = CapabilityProbe::new(&runner).probe();
        assert!(set.is_present(CapabilityKind::PulseAudio));
        assert!(set.is_present(CapabilityKind::PipeWire));
        assert_eq!(
            set.get(CapabilityKind::PipeWire)
                .and_then(|c| c.metadata.get("source"))
                .map(String::as_str),
            Some("pipewire-pulse")
        );
    }

    #[test]
    fn test_unreachable_pulse_server_is_absent() {
        let runner = host_with_tools().with_program("pactl");
        runner.respond("pactl info", CommandOutput::failed(1, "Connection failure"));

        let set = CapabilityProbe::new(&runner).probe();
        assert!(!set.is_present(CapabilityKind::PulseAudio));
    }

    #[test]
    fn test_pipewire_detected_through_pw_cli() {
        let runner = host_with_tools().with_program("pw-cli");
        runner.respond(
            "pw-cli info 0",
            CommandOutput::ok("id: 0\n\ttype: PipeWire:Interface:Core/4\n\tname: \"pipewire-0\"\n"),
        );

        let set = CapabilityProbe::new(&runner).probe();
        let pipewire = set.get(CapabilityKind::PipeWire).unwrap();
        assert!(pipewire.present);
        assert_eq!(pipewire.metadata.get("source").map(String::as_str), Some("pw-cli"));
        assert!(!set.is_present(CapabilityKind::PulseAudio));
    }

    #[test]
    fn test_pw_cli_without_daemon_is_absent() {
        let runner = host_with_tools().with_program("pw-cli");
        runner.respond("pw-cli info 0", CommandOutput::failed(1, "failed to connect"));

        let set = CapabilityProbe::new(&runner).probe();
        assert!(!set.is_present(CapabilityKind::PipeWire));
    }

    #[test]
    fn test_root_queries_sound_servers_as_service_user() {
        let user = crate::domain::Identity {
            user: "pi".into(),
            uid: 1000,
            group: "pi".into(),
        };
        let runner = host_with_tools().with_program("pactl").with_program("pw-cli");
        // Root's own session has no sound server.
        runner.respond("pactl info", CommandOutput::failed(1, "Connection failure"));
        runner.respond("pw-cli info 0", CommandOutput::failed(1, "failed to connect"));
        runner.respond(
            "runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 pactl info",
            CommandOutput::ok("Server Name: pulseaudio\nServer Version: 16.1\n"),
        );
        runner.respond(
            "runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 pw-cli info 0",
            CommandOutput::failed(1, "failed to connect"),
        );

        let set = CapabilityProbe::new(&runner)
            .in_session(UserSession::for_service(&user, true))
            .probe();

        assert!(set.is_present(CapabilityKind::PulseAudio));
        assert!(!set.is_present(CapabilityKind::PipeWire));
        assert_eq!(
            runner
                .calls_matching("runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 pactl info")
                .len(),
            1
        );
        assert!(runner.calls_matching("pactl").is_empty());
    }

    #[test]
    fn test_dpkg_status_parsing() {
        assert_eq!(
            parse_dpkg_status("install ok installed 7:5.1.6-0+deb12u1"),
            Some("7:5.1.6-0+deb12u1".into())
        );
        assert_eq!(parse_dpkg_status("deinstall ok config-files 1.0"), None);
        assert_eq!(parse_dpkg_status(""), None);
    }

    #[test]
    fn test_python_version_from_pip_show() {
        let runner = FakeRunner::new().with_path("/srv/venv/bin/python");
        runner.respond(
            "/srv/venv/bin/python -m pip show pygame",
            CommandOutput::ok("Name: pygame\nVersion: 2.5.2\nSummary: Python Game Development\n"),
        );

        let dep = Dependency::new("pygame", DependencySource::Python);
        let version = CapabilityProbe::new(&runner)
            .installed_version(&dep, Path::new("/srv/venv/bin/python"))
            .unwrap();
        assert_eq!(version.as_deref(), Some("2.5.2"));
    }

    #[test]
    fn test_python_package_absent_without_venv() {
        let runner = FakeRunner::new();
        let dep = Dependency::new("pygame", DependencySource::Python);
        let version = CapabilityProbe::new(&runner)
            .installed_version(&dep, Path::new("/nonexistent/venv/bin/python"))
            .unwrap();

        assert_eq!(version, None);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_service_status_parsing() {
        let runner = FakeRunner::new();
        runner.respond(
            "systemctl show voice.service",
            CommandOutput::ok("LoadState=loaded\nActiveState=inactive\nSubState=dead\nUnitFileState=enabled\nResult=success\nExecMainCode=1\nExecMainStatus=143\n"),
        );

        let status = CapabilityProbe::new(&runner)
            .service_status("voice.service", Path::new("/nonexistent/voice.service"))
            .unwrap();

        assert!(status.is_loaded);
        assert!(status.is_enabled);
        assert_eq!(status.exit_status, Some(143));
        assert_eq!(status.exited_cleanly(143), Some(143));
    }

    #[test]
    fn test_crash_loop_status_parsing() {
        let runner = FakeRunner::new();
        runner.respond(
            "systemctl show voice.service",
            CommandOutput::ok("LoadState=loaded\nActiveState=activating\nSubState=auto-restart\nUnitFileState=enabled\nResult=exit-code\nExecMainCode=1\nExecMainStatus=1\nExecMainPID=0\nNRestarts=2\n"),
        );

        let status = CapabilityProbe::new(&runner)
            .service_status("voice.service", Path::new("/nonexistent/voice.service"))
            .unwrap();

        assert!(status.is_restarting());
        assert_eq!(status.restarts, 2);
        assert_eq!(status.main_pid, 0);
        assert_eq!(status.exited_cleanly(143), None);
    }

    #[test]
    fn test_unknown_unit_is_absent() {
        let runner = FakeRunner::new();
        runner.respond(
            "systemctl show voice.service",
            CommandOutput::ok("LoadState=not-found\nActiveState=inactive\nSubState=dead\nUnitFileState=\nResult=success\nExecMainCode=0\nExecMainStatus=0\n"),
        );

        let status = CapabilityProbe::new(&runner)
            .service_status("voice.service", Path::new("/nonexistent/voice.service"))
            .unwrap();

        assert_eq!(status.state(), crate::domain::ServiceState::Absent);
        assert_eq!(status.exit_status, None);
    }

    #[test]
    fn test_group_membership() {
        let runner = FakeRunner::new();
        runner.respond("id -nG pi", CommandOutput::ok("pi adm dialout audio video\n"));

        let probe = CapabilityProbe::new(&runner);
        assert!(probe.is_group_member("pi", "audio").unwrap());
        assert!(!probe.is_group_member("pi", "lp").unwrap());
    }
}
