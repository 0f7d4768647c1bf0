//! Install orchestration.
//!
//! Composes probing, provisioning, descriptor building and the service
//! controller into the install and uninstall entry points. Each entry
//! point converges toward its target state from whatever state a previous
//! (possibly interrupted) run left behind.

use nix::unistd::Uid;

use super::descriptor_builder;
use crate::domain::{
    AppError, CapabilitySet, GroupDecision, Identity, InstallerConfig, ProvisionReport, Result,
    ServicePaths, ServiceState, StartOutcome, StartPolicy,
};
use crate::infrastructure::{
    resolve_identity, service_user_name, CapabilityProbe, CommandRunner, Elevation,
    GroupMembership, SystemdController, UserSession,
};

use super::provisioner::PackageProvisioner;

/// What `install` should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Dependencies, then the service.
    #[default]
    Full,
    /// Dependencies only; the service is not touched.
    DepsOnly,
    /// The service only, with whatever dependencies are present.
    ServiceOnly,
}

impl std::str::FromStr for InstallMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "deps-only" | "deps" => Ok(Self::DepsOnly),
            "service-only" | "service" => Ok(Self::ServiceOnly),
            _ => Err(format!(
                "Unknown mode: {s}. Use: full, deps-only, service-only"
            )),
        }
    }
}

/// Outcome of deploying the service.
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    pub unit: String,
    pub unit_path: std::path::PathBuf,
    pub user: String,
    pub outcome: StartOutcome,
    /// Whether the unit file content changed.
    pub unit_changed: bool,
    /// Whether the user was newly added to the audio group.
    pub group_added: bool,
    pub audio_group: String,
}

/// Outcome of an install run.
#[derive(Debug, Clone)]
pub struct InstallSummary {
    pub mode: InstallMode,
    /// Capabilities as probed at the end of the run.
    pub capabilities: CapabilitySet,
    pub provision: Option<ProvisionReport>,
    pub service: Option<ServiceSummary>,
}

impl InstallSummary {
    /// Usage hints printed after a successful install.
    #[must_use]
    pub fn guidance(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(service) = &self.service {
            lines.push(format!("Follow logs:     journalctl -u {} -f", service.unit));
            lines.push(format!("Restart:         sudo systemctl restart {}", service.unit));
            lines.push("Check status:    voice-service-installer status".to_string());
            lines.push("Remove:          voice-service-installer uninstall".to_string());

            if let StartOutcome::ExitedCleanly { status } = service.outcome {
                lines.push(format!(
                    "The service exited with status {status} right after start; it will not be restarted until you start it again."
                ));
            }
            if service.group_added {
                lines.push(format!(
                    "{} was added to the '{}' group; log out and back in for interactive sessions to pick it up.",
                    service.user, service.audio_group
                ));
            }
        } else {
            lines.push("Dependencies are ready. Install the service with: voice-service-installer install --mode service-only".to_string());
        }

        if !self.capabilities.has_audio_backend() {
            lines.push("No PulseAudio or PipeWire server was detected; the service will fall back to the default ALSA device.".to_string());
        }

        lines
    }
}

/// Outcome of an uninstall run.
#[derive(Debug, Clone)]
pub struct UninstallSummary {
    pub unit: String,
    /// State before uninstalling.
    pub previous_state: ServiceState,
    /// Whether the user was removed from the audio group.
    pub group_removed: bool,
}

/// Runs the install and uninstall entry points.
pub struct InstallOrchestrator<'a> {
    config: &'a InstallerConfig,
    runner: &'a dyn CommandRunner,
    is_root: bool,
    identity: Option<Identity>,
}

impl<'a> InstallOrchestrator<'a> {
    /// Create an orchestrator for the current process.
    #[must_use]
    pub fn new(config: &'a InstallerConfig, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            runner,
            is_root: Uid::effective().is_root(),
            identity: None,
        }
    }

    /// Override whether the process counts as root.
    #[must_use]
    pub const fn as_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Use a fixed service identity instead of looking it up.
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Run `install` in the given mode.
    pub fn install(&self, mode: InstallMode) -> Result<InstallSummary> {
        match mode {
            InstallMode::Full => self.install_full(),
            InstallMode::DepsOnly => self.install_deps_only(),
            InstallMode::ServiceOnly => self.install_service_only(),
        }
    }

    /// Provision dependencies, then deploy and verify the service.
    pub fn install_full(&self) -> Result<InstallSummary> {
        let elevation = self.elevate()?;
        let provision = self.provision(elevation)?;

        // Installing packages can change what is present.
        let capabilities = self.probe()?;
        let service = self.deploy_service(elevation, &capabilities)?;

        Ok(InstallSummary {
            mode: InstallMode::Full,
            capabilities,
            provision: Some(provision),
            service: Some(service),
        })
    }

    /// Provision dependencies and report capabilities; never touches the service.
    pub fn install_deps_only(&self) -> Result<InstallSummary> {
        let elevation = self.elevate()?;
        let provision = self.provision(elevation)?;
        let capabilities = self.probe()?;

        Ok(InstallSummary {
            mode: InstallMode::DepsOnly,
            capabilities,
            provision: Some(provision),
            service: None,
        })
    }

    /// Deploy and verify the service using current capabilities.
    pub fn install_service_only(&self) -> Result<InstallSummary> {
        let elevation = self.elevate()?;
        let capabilities = self.probe()?;
        let service = self.deploy_service(elevation, &capabilities)?;

        Ok(InstallSummary {
            mode: InstallMode::ServiceOnly,
            capabilities,
            provision: None,
            service: Some(service),
        })
    }

    /// Stop, disable and remove the service, then verify it is gone.
    ///
    /// The audio group membership is revoked only for `GroupDecision::Remove`.
    pub fn uninstall(&self, group: GroupDecision) -> Result<UninstallSummary> {
        let elevation = self.elevate()?;
        let controller = self.controller(elevation);
        let previous_state = controller.query_state()?;
        tracing::info!(unit = controller.unit(), state = %previous_state, "Uninstalling");

        controller.stop()?;
        controller.disable()?;
        controller.remove()?;

        if controller.query_state()? != ServiceState::Absent {
            return Err(AppError::VerificationMismatch {
                unit: controller.unit().to_string(),
                remedy: format!(
                    "Remove {} by hand, then run 'sudo systemctl daemon-reload' and 'sudo systemctl reset-failed'.",
                    controller.service_file_path().display()
                ),
            });
        }

        let group_removed = match group {
            GroupDecision::Keep => {
                tracing::debug!("Keeping audio group membership");
                false
            }
            GroupDecision::Remove => {
                let identity = self.identity()?;
                GroupMembership::new(self.runner, elevation)
                    .revoke(&identity.user, &self.config.service.audio_group)?
            }
        };

        Ok(UninstallSummary {
            unit: controller.unit().to_string(),
            previous_state,
            group_removed,
        })
    }

    /// Detect host capabilities, querying sound servers from the service user's session.
    ///
    /// Missing mandatory capabilities are reported, not rejected.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilityProbe::new(self.runner)
            .in_session(self.session())
            .probe()
    }

    /// Render the unit file `install` would write, without side effects.
    pub fn preview_unit(&self) -> Result<String> {
        let capabilities = self.capabilities();
        let identity = self.identity()?;
        let paths = ServicePaths::from_config(self.config);
        Ok(descriptor_builder::build(&capabilities, &paths, &identity, self.config).render())
    }

    fn elevate(&self) -> Result<Elevation> {
        Elevation::acquire(self.runner, self.is_root)
    }

    fn probe(&self) -> Result<CapabilitySet> {
        let capabilities = self.capabilities();
        capabilities.require_mandatory()?;
        Ok(capabilities)
    }

    fn provision(&self, elevation: Elevation) -> Result<ProvisionReport> {
        self.probe()?;
        let deps = self.config.declared_dependencies()?;
        PackageProvisioner::new(self.runner, elevation, self.config.venv_dir())
            .owned_by(self.session())
            .ensure(&deps)
    }

    /// Session of the service user, or the current process if it is unknown.
    fn session(&self) -> UserSession {
        match self.identity() {
            Ok(identity) => UserSession::for_service(&identity, self.is_root),
            Err(e) => {
                tracing::debug!(error = %e, "Service user unknown, using the current session");
                UserSession::current()
            }
        }
    }

    fn identity(&self) -> Result<Identity> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let name = service_user_name(self.config.service.user.as_deref()).ok_or_else(|| {
            AppError::Config {
                message: "Could not determine which user the service should run as".into(),
            }
        })?;
        resolve_identity(&name)
    }

    fn controller(&self, elevation: Elevation) -> SystemdController<'a> {
        SystemdController::new(
            self.runner,
            elevation,
            self.config.unit_name(),
            self.config.service.unit_dir.clone(),
        )
    }

    fn start_policy(&self) -> StartPolicy {
        StartPolicy {
            timeout: self.config.start_timeout(),
            poll_interval: self.config.poll_interval(),
            settle: self.config.settle(),
            success_exit_status: self.config.timing.success_exit_status,
        }
    }

    fn deploy_service(
        &self,
        elevation: Elevation,
        capabilities: &CapabilitySet,
    ) -> Result<ServiceSummary> {
        let identity = self.identity()?;
        let paths = ServicePaths::from_config(self.config);
        if !self.runner.path_exists(&paths.entry_script) {
            tracing::warn!(
                path = %paths.entry_script.display(),
                "Entry script not found; the service will fail until it exists"
            );
        }

        let descriptor = descriptor_builder::build(capabilities, &paths, &identity, self.config);
        tracing::debug!(
            unit = descriptor.name(),
            user = descriptor.user(),
            delay = descriptor.startup_delay_secs(),
            restart_sec = descriptor.restart().restart_sec,
            nofile = %descriptor.limits().open_files,
            env = descriptor.environment().len(),
            "Descriptor built"
        );

        let audio_group = self.config.service.audio_group.clone();
        let group_added =
            GroupMembership::new(self.runner, elevation).grant(&identity.user, &audio_group)?;

        let controller = self.controller(elevation);
        let was_running = controller.query_status()?.is_running();
        let installed = controller.install(&descriptor)?;

        if descriptor.enabled() {
            controller.enable()?;
        }

        let policy = self.start_policy();
        let outcome = if was_running && installed.changed {
            tracing::info!("Unit changed while running, restarting");
            controller.restart(&policy)?
        } else {
            controller.start(&policy)?
        };

        Ok(ServiceSummary {
            unit: descriptor.unit_name(),
            unit_path: installed.service_path,
            user: identity.user,
            outcome,
            unit_changed: installed.changed,
            group_added,
            audio_group,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::domain::{DependencyEntry, ProvisionOutcome};
    use crate::infrastructure::command::fake::FakeRunner;
    use crate::infrastructure::command::CommandOutput;
    use crate::infrastructure::systemd::sim::{attach, StartBehavior, UnitSim};

    struct Host {
        runner: FakeRunner,
        unit: Rc<RefCell<UnitSim>>,
        packages: Rc<RefCell<BTreeSet<String>>>,
        groups: Rc<RefCell<BTreeSet<String>>>,
        config: InstallerConfig,
        _dir: TempDir,
    }

    fn identity() -> Identity {
        Identity {
            user: "pi".into(),
            uid: 1000,
            group: "pi".into(),
        }
    }

    /// A Debian host with systemd, PulseAudio and `preinstalled` packages.
    fn host(preinstalled: &[&str]) -> Host {
        let dir = tempdir().unwrap();
        let mut config = InstallerConfig::default();
        config.service.unit_dir = dir.path().join("units");
        config.service.install_dir = Some(dir.path().join("voice"));
        config.timing.start_timeout_secs = 0;
        config.timing.poll_interval_ms = 0;
        config.dependencies.system = vec![
            DependencyEntry { name: "pkgA".into(), version: None },
            DependencyEntry { name: "pkgB".into(), version: None },
        ];
        config.dependencies.python = vec![];

        let runner = FakeRunner::new()
            .with_program("apt-get")
            .with_program("dpkg-query")
            .with_program("systemctl")
            .with_program("pactl")
            .with_program("sudo");
        // The sound server lives in pi's session; root has none.
        runner.respond("pactl info", CommandOutput::failed(1, "Connection failure"));
        runner.respond(
            "runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 pactl info",
            CommandOutput::ok("Server Name: pulseaudio\n"),
        );

        let packages = Rc::new(RefCell::new(
            preinstalled.iter().map(ToString::to_string).collect::<BTreeSet<_>>(),
        ));
        let p = Rc::clone(&packages);
        runner.on("dpkg-query", move |spec| {
            let name = spec.args.last().cloned().unwrap_or_default();
            if p.borrow().contains(&name) {
                CommandOutput::ok("install ok installed 1.0")
            } else {
                CommandOutput::failed(1, "no packages found")
            }
        });
        for prefix in [
            "env DEBIAN_FRONTEND=noninteractive apt-get install",
            "sudo -n env DEBIAN_FRONTEND=noninteractive apt-get install",
        ] {
            let p = Rc::clone(&packages);
            runner.on(prefix, move |spec| {
                p.borrow_mut().insert(spec.args.last().cloned().unwrap_or_default());
                CommandOutput::ok("")
            });
        }

        let groups = Rc::new(RefCell::new(BTreeSet::from(["pi".to_string()])));
        let g = Rc::clone(&groups);
        runner.on("id -nG pi", move |_| {
            CommandOutput::ok(g.borrow().iter().cloned().collect::<Vec<_>>().join(" "))
        });
        for prefix in ["usermod", "sudo -n usermod"] {
            let g = Rc::clone(&groups);
            runner.on(prefix, move |spec| {
                let group = spec.args.iter().skip_while(|a| *a != "-aG").nth(1).cloned();
                g.borrow_mut().extend(group);
                CommandOutput::ok("")
            });
        }
        for prefix in ["gpasswd", "sudo -n gpasswd"] {
            let g = Rc::clone(&groups);
            runner.on(prefix, move |spec| {
                if let Some(group) = spec.args.last() {
                    g.borrow_mut().remove(group);
                }
                CommandOutput::ok("")
            });
        }

        let unit = attach(&runner, config.unit_file_path());

        Host {
            runner,
            unit,
            packages,
            groups,
            config,
            _dir: dir,
        }
    }

    fn orchestrator(host: &Host) -> InstallOrchestrator<'_> {
        InstallOrchestrator::new(&host.config, &host.runner)
            .as_root(true)
            .with_identity(identity())
    }

    #[test]
    fn test_full_install_reaches_running() {
        let host = host(&["pkgA"]);

        let summary = orchestrator(&host).install(InstallMode::Full).unwrap();

        let provision = summary.provision.as_ref().unwrap();
        assert_eq!(provision.outcome("pkgA"), Some(ProvisionOutcome::Skipped));
        assert_eq!(provision.outcome("pkgB"), Some(ProvisionOutcome::Installed));

        let service = summary.service.as_ref().unwrap();
        assert_eq!(service.outcome, StartOutcome::Running);
        assert!(service.group_added);
        assert!(host.groups.borrow().contains("audio"));

        let unit = std::fs::read_to_string(host.config.unit_file_path()).unwrap();
        assert!(unit.contains("PULSE_SERVER=unix:/run/user/1000/pulse/native"));
        assert!(unit.contains("User=pi"));

        let sim = host.unit.borrow();
        assert!(sim.enabled);
        assert_eq!(sim.active, "active");
    }

    #[test]
    fn test_full_install_twice_is_idempotent() {
        let host = host(&[]);
        orchestrator(&host).install_full().unwrap();
        let installs_after_first = host.runner.calls_matching("env DEBIAN_FRONTEND").len();

        let second = orchestrator(&host).install_full().unwrap();

        assert_eq!(second.provision.as_ref().unwrap().installed_count(), 0);
        assert_eq!(
            host.runner.calls_matching("env DEBIAN_FRONTEND").len(),
            installs_after_first
        );
        let service = second.service.unwrap();
        assert!(!service.unit_changed);
        assert!(!service.group_added);
        assert_eq!(service.outcome, StartOutcome::Running);
        assert_eq!(host.runner.calls_matching("systemctl start").len(), 1);
        assert!(host.runner.calls_matching("systemctl restart").is_empty());
        assert!(host.unit.borrow().enabled);
    }

    #[test]
    fn test_deps_only_never_touches_service() {
        let host = host(&[]);

        let summary = orchestrator(&host).install(InstallMode::DepsOnly).unwrap();

        assert!(summary.service.is_none());
        assert!(host.packages.borrow().contains("pkgB"));
        assert!(!host.config.unit_file_path().exists());
        assert!(host.runner.calls_matching("systemctl enable").is_empty());
        assert!(host.runner.calls_matching("systemctl start").is_empty());
    }

    #[test]
    fn test_service_only_ignores_dependencies() {
        let host = host(&[]);

        let summary = orchestrator(&host).install(InstallMode::ServiceOnly).unwrap();

        assert!(summary.provision.is_none());
        assert!(host.runner.calls_matching("dpkg-query").is_empty());
        assert_eq!(summary.service.unwrap().outcome, StartOutcome::Running);
    }

    #[test]
    fn test_denied_sudo_touches_no_package() {
        let host = host(&[]);
        host.runner.respond("sudo -v", CommandOutput::failed(1, "Sorry"));

        let err = InstallOrchestrator::new(&host.config, &host.runner)
            .as_root(false)
            .with_identity(identity())
            .install_full()
            .unwrap_err();

        assert!(matches!(err, AppError::Permission { .. }));
        assert!(host.runner.calls_matching("dpkg-query").is_empty());
        assert!(host.runner.calls_matching("sudo -n").is_empty());
    }

    #[test]
    fn test_missing_init_system_is_fatal() {
        let host = host(&[]);
        let runner = FakeRunner::new().with_program("apt-get").with_program("dpkg-query");

        let err = InstallOrchestrator::new(&host.config, &runner)
            .as_root(true)
            .with_identity(identity())
            .install_service_only()
            .unwrap_err();

        assert!(matches!(err, AppError::MissingCapability { .. }));
    }

    #[test]
    fn test_start_failure_keeps_registration() {
        let host = host(&["pkgA", "pkgB"]);
        host.unit.borrow_mut().on_start = StartBehavior::CrashLoop { healthy_polls: 0 };

        let err = orchestrator(&host).install_full().unwrap_err();

        assert!(matches!(err, AppError::StartFailure { .. }));
        assert!(host.config.unit_file_path().exists());
    }

    #[test]
    fn test_reinstall_with_changed_unit_restarts() {
        let host = host(&["pkgA", "pkgB"]);
        orchestrator(&host).install_service_only().unwrap();

        let mut config = host.config.clone();
        config.timing.restart_sec = 30;
        let summary = InstallOrchestrator::new(&config, &host.runner)
            .as_root(true)
            .with_identity(identity())
            .install_service_only()
            .unwrap();

        assert!(summary.service.unwrap().unit_changed);
        assert_eq!(host.runner.calls_matching("systemctl restart").len(), 1);
    }

    #[test]
    fn test_uninstall_keeps_group_by_default() {
        let host = host(&["pkgA", "pkgB"]);
        orchestrator(&host).install_full().unwrap();

        let summary = orchestrator(&host).uninstall(GroupDecision::default()).unwrap();

        assert_eq!(summary.previous_state, ServiceState::Running);
        assert!(!summary.group_removed);
        assert!(host.groups.borrow().contains("audio"));
        assert!(!host.config.unit_file_path().exists());
    }

    #[test]
    fn test_uninstall_can_remove_group() {
        let host = host(&["pkgA", "pkgB"]);
        orchestrator(&host).install_full().unwrap();

        let summary = orchestrator(&host).uninstall(GroupDecision::Remove).unwrap();

        assert!(summary.group_removed);
        assert!(!host.groups.borrow().contains("audio"));
    }

    #[test]
    fn test_uninstall_absent_service_succeeds() {
        let host = host(&[]);

        let first = orchestrator(&host).uninstall(GroupDecision::Keep).unwrap();
        let second = orchestrator(&host).uninstall(GroupDecision::Keep).unwrap();

        assert_eq!(first.previous_state, ServiceState::Absent);
        assert_eq!(second.previous_state, ServiceState::Absent);
    }

    #[test]
    fn test_uninstall_reports_lingering_unit() {
        let host = host(&["pkgA", "pkgB"]);
        orchestrator(&host).install_service_only().unwrap();
        // systemd keeps the unit loaded (e.g. a copy under /run)
        host.runner.on("systemctl daemon-reload", |_| CommandOutput::ok(""));

        let err = orchestrator(&host).uninstall(GroupDecision::Keep).unwrap_err();

        match err {
            AppError::VerificationMismatch { unit, remedy } => {
                assert_eq!(unit, "klipper-voice-manager.service");
                assert!(remedy.contains("daemon-reload"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_preview_unit_has_no_side_effects() {
        let host = host(&[]);

        let unit = orchestrator(&host).preview_unit().unwrap();

        assert!(unit.contains("ExecStartPre=/bin/sleep 10"));
        assert!(!host.config.unit_file_path().exists());
        assert!(host.runner.calls_matching("systemctl daemon-reload").is_empty());
        assert!(host.runner.calls_matching("sudo").is_empty());
    }

    #[test]
    fn test_root_preview_detects_audio_in_user_session() {
        let host = host(&[]);

        let unit = orchestrator(&host).preview_unit().unwrap();

        assert!(unit.contains("PULSE_SERVER=unix:/run/user/1000/pulse/native"));
        assert!(unit.contains("XDG_RUNTIME_DIR=/run/user/1000"));
        assert_eq!(
            host.runner
                .calls_matching("runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 pactl info")
                .len(),
            1
        );
        assert!(host.runner.calls_matching("pactl info").is_empty());
    }

    #[test]
    fn test_install_mode_parse() {
        assert_eq!("full".parse::<InstallMode>(), Ok(InstallMode::Full));
        assert_eq!("deps-only".parse::<InstallMode>(), Ok(InstallMode::DepsOnly));
        assert_eq!("service-only".parse::<InstallMode>(), Ok(InstallMode::ServiceOnly));
        assert!("everything".parse::<InstallMode>().is_err());
    }

    #[test]
    fn test_guidance_mentions_missing_audio() {
        let summary = InstallSummary {
            mode: InstallMode::DepsOnly,
            capabilities: CapabilitySet::default(),
            provision: None,
            service: None,
        };

        let text = summary.guidance().join("\n");
        assert!(text.contains("--mode service-only"));
        assert!(text.contains("No PulseAudio or PipeWire"));
    }
}
