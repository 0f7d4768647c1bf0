//! Dependency provisioning.
//!
//! Ensures declared system and Python packages are present, installing
//! only what is missing. The first failure aborts the run; packages
//! installed before it are kept.

use std::cell::Cell;
use std::path::PathBuf;

use crate::domain::{
    AppError, Dependency, DependencySource, ProvisionEntry, ProvisionOutcome, ProvisionReport,
    Result, VersionConstraint,
};
use crate::infrastructure::{CapabilityProbe, CommandRunner, CommandSpec, Elevation, UserSession};

/// Installs missing dependencies.
pub struct PackageProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    elevation: Elevation,
    venv_dir: PathBuf,
    /// Owner of the virtualenv; venv and pip commands run as this user.
    session: UserSession,
    apt_updated: Cell<bool>,
}

impl<'a> PackageProvisioner<'a> {
    /// Create a provisioner. `elevation` must already be acquired.
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, elevation: Elevation, venv_dir: PathBuf) -> Self {
        Self {
            runner,
            elevation,
            venv_dir,
            session: UserSession::current(),
            apt_updated: Cell::new(false),
        }
    }

    /// Create and fill the virtualenv as the user of `session`.
    #[must_use]
    pub fn owned_by(mut self, session: UserSession) -> Self {
        self.session = session;
        self
    }

    fn python(&self) -> PathBuf {
        self.venv_dir.join("bin/python")
    }

    /// Ensure every dependency in `deps` is satisfied.
    ///
    /// # Errors
    /// Returns `Provision` naming the first dependency that could not be
    /// satisfied.
    pub fn ensure(&self, deps: &[Dependency]) -> Result<ProvisionReport> {
        let probe = CapabilityProbe::new(self.runner);
        let python = self.python();
        let mut report = ProvisionReport::default();

        for dep in deps {
            let installed = probe
                .installed_version(dep, &python)
                .map_err(|e| AppError::provision(&dep.name, e))?;

            if dep.is_satisfied_by(installed.as_deref()) {
                tracing::debug!(dependency = %dep, version = ?installed, "Already satisfied");
                report.entries.push(ProvisionEntry {
                    dependency: dep.clone(),
                    outcome: ProvisionOutcome::Skipped,
                    version: installed,
                });
                continue;
            }

            tracing::info!(dependency = %dep, source = %dep.source, found = ?installed, "Installing");
            self.install(dep).map_err(|e| AppError::provision(&dep.name, e))?;

            let version = probe
                .installed_version(dep, &python)
                .map_err(|e| AppError::provision(&dep.name, e))?;
            if !dep.is_satisfied_by(version.as_deref()) {
                return Err(AppError::Provision {
                    dependency: dep.name.clone(),
                    message: format!(
                        "still not satisfied after install (found {})",
                        version.as_deref().unwrap_or("nothing")
                    ),
                    source: None,
                });
            }

            report.entries.push(ProvisionEntry {
                dependency: dep.clone(),
                outcome: ProvisionOutcome::Installed,
                version,
            });
        }

        tracing::info!(
            total = report.entries.len(),
            installed = report.installed_count(),
            "Provisioning completed"
        );

        Ok(report)
    }

    fn install(&self, dep: &Dependency) -> Result<()> {
        match dep.source {
            DependencySource::System => self.apt_install(dep),
            DependencySource::Python => self.pip_install(dep),
        }
    }

    fn apt_install(&self, dep: &Dependency) -> Result<()> {
        self.apt_update_once()?;

        let target = match &dep.constraint {
            Some(VersionConstraint::Exact(v)) => format!("{}={v}", dep.name),
            _ => dep.name.clone(),
        };

        self.run_checked(&self.elevation.wrap(apt_get().args([
            "install",
            "-y",
            "--no-install-recommends",
            target.as_str(),
        ])))
    }

    fn apt_update_once(&self) -> Result<()> {
        if self.apt_updated.get() {
            return Ok(());
        }
        self.run_checked(&self.elevation.wrap(apt_get().arg("update")))?;
        self.apt_updated.set(true);
        Ok(())
    }

    fn pip_install(&self, dep: &Dependency) -> Result<()> {
        self.ensure_venv()?;

        let python = self.python().display().to_string();
        self.run_checked(&self.session.wrap(CommandSpec::new(python).args([
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
            dep.to_string(),
        ])))
    }

    /// Create the virtualenv if its interpreter is missing.
    fn ensure_venv(&self) -> Result<()> {
        if self.runner.path_exists(&self.python()) {
            return Ok(());
        }

        tracing::info!(path = %self.venv_dir.display(), "Creating virtualenv");
        self.run_checked(&self.session.wrap(CommandSpec::new("python3").args([
            "-m".to_string(),
            "venv".to_string(),
            self.venv_dir.display().to_string(),
        ])))
    }

    fn run_checked(&self, spec: &CommandSpec) -> Result<()> {
        self.runner.run(spec)?.check(spec).map(|_| ())
    }
}

fn apt_get() -> CommandSpec {
    CommandSpec::new("env").args(["DEBIAN_FRONTEND=noninteractive", "apt-get"])
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use super::*;
    use crate::infrastructure::command::fake::FakeRunner;
    use crate::infrastructure::command::CommandOutput;

    /// dpkg database stand-in: installed packages and their versions.
    fn apt_host(
        runner: &FakeRunner,
        installed: &[(&str, &str)],
        broken: &[&str],
    ) -> Rc<RefCell<BTreeMap<String, String>>> {
        let db: Rc<RefCell<BTreeMap<String, String>>> = Rc::new(RefCell::new(
            installed
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
        ));

        let d = Rc::clone(&db);
        runner.on("dpkg-query", move |spec| {
            let name = spec.args.last().cloned().unwrap_or_default();
            d.borrow().get(&name).map_or_else(
                || CommandOutput::failed(1, format!("dpkg-query: no packages found matching {name}")),
                |v| CommandOutput::ok(format!("install ok installed {v}")),
            )
        });

        let broken: Vec<String> = broken.iter().map(ToString::to_string).collect();
        for prefix in [
            "env DEBIAN_FRONTEND=noninteractive apt-get install",
            "sudo -n env DEBIAN_FRONTEND=noninteractive apt-get install",
        ] {
            let d = Rc::clone(&db);
            let broken = broken.clone();
            runner.on(prefix, move |spec| {
                let target = spec.args.last().cloned().unwrap_or_default();
                let (name, version) = target.split_once('=').unwrap_or((target.as_str(), "1.0"));
                if broken.iter().any(|b| b == name) {
                    return CommandOutput::failed(100, format!("E: Unable to locate package {name}"));
                }
                d.borrow_mut().insert(name.to_string(), version.to_string());
                CommandOutput::ok("")
            });
        }

        db
    }

    fn system(name: &str) -> Dependency {
        Dependency::new(name, DependencySource::System)
    }

    #[test]
    fn test_installs_only_missing() {
        let runner = FakeRunner::new();
        apt_host(&runner, &[("pkgA", "2.0")], &[]);
        let provisioner = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/srv/venv"));

        let report = provisioner.ensure(&[system("pkgA"), system("pkgB")]).unwrap();

        assert_eq!(report.outcome("pkgA"), Some(ProvisionOutcome::Skipped));
        assert_eq!(report.outcome("pkgB"), Some(ProvisionOutcome::Installed));
        assert_eq!(
            runner.calls_matching("env DEBIAN_FRONTEND=noninteractive apt-get install"),
            vec!["env DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends pkgB".to_string()]
        );
    }

    #[test]
    fn test_second_run_installs_nothing() {
        let runner = FakeRunner::new();
        apt_host(&runner, &[], &[]);
        let deps = [system("ffmpeg"), system("python3")];

        let first = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/srv/venv"))
            .ensure(&deps)
            .unwrap();
        assert_eq!(first.installed_count(), 2);

        let second = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/srv/venv"))
            .ensure(&deps)
            .unwrap();
        assert_eq!(second.installed_count(), 0);
        assert_eq!(runner.calls_matching("env DEBIAN_FRONTEND=noninteractive apt-get update").len(), 1);
    }

    #[test]
    fn test_fail_fast_names_first_failure_and_keeps_earlier_installs() {
        let runner = FakeRunner::new();
        let db = apt_host(&runner, &[], &["ghost"]);
        let provisioner = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/srv/venv"));

        let err = provisioner
            .ensure(&[system("ffmpeg"), system("ghost"), system("python3")])
            .unwrap_err();

        match err {
            AppError::Provision { dependency, message, .. } => {
                assert_eq!(dependency, "ghost");
                assert!(message.contains("Unable to locate package ghost"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(db.borrow().contains_key("ffmpeg"));
        assert!(!db.borrow().contains_key("python3"));
    }

    #[test]
    fn test_version_constraint_forces_install() {
        let runner = FakeRunner::new();
        apt_host(&runner, &[("ffmpeg", "0.9")], &[]);
        let provisioner = PackageProvisioner::new(&runner, Elevation::Sudo, PathBuf::from("/srv/venv"));
        let dep = Dependency::parse("ffmpeg", Some("==1.0"), DependencySource::System).unwrap();

        let report = provisioner.ensure(&[dep]).unwrap();

        assert_eq!(report.outcome("ffmpeg"), Some(ProvisionOutcome::Installed));
        assert_eq!(
            runner.calls_matching("sudo -n env DEBIAN_FRONTEND=noninteractive apt-get install"),
            vec!["sudo -n env DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends ffmpeg=1.0".to_string()]
        );
    }

    #[test]
    fn test_unsatisfied_after_install_is_error() {
        let runner = FakeRunner::new();
        apt_host(&runner, &[("ffmpeg", "4.0")], &[]);
        let provisioner = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/srv/venv"));
        let dep = Dependency::parse("ffmpeg", Some(">=5"), DependencySource::System).unwrap();

        // the fake installs 1.0 when no version is pinned
        assert!(matches!(
            provisioner.ensure(&[dep]),
            Err(AppError::Provision { ref dependency, .. }) if dependency == "ffmpeg"
        ));
    }

    #[test]
    fn test_python_dependency_creates_venv_first() {
        let runner = FakeRunner::new();
        let provisioner = PackageProvisioner::new(&runner, Elevation::Sudo, PathBuf::from("/srv/venv"));
        let dep = Dependency::parse("pygame", Some(">=2.1"), DependencySource::Python).unwrap();

        // the fake venv never appears, so the post-install check reports it
        let err = provisioner.ensure(&[dep]).unwrap_err();
        assert!(matches!(err, AppError::Provision { .. }));

        let calls = runner.calls();
        let venv = calls.iter().position(|c| c == "python3 -m venv /srv/venv").unwrap();
        let pip = calls
            .iter()
            .position(|c| c == "/srv/venv/bin/python -m pip install --disable-pip-version-check pygame>=2.1")
            .unwrap();
        assert!(venv < pip);
        assert!(runner.calls_matching("sudo").is_empty());
    }

    #[test]
    fn test_python_dependency_in_existing_venv_is_skipped() {
        let runner = FakeRunner::new().with_path("/srv/venv/bin/python");
        runner.respond(
            "/srv/venv/bin/python -m pip show pygame",
            CommandOutput::ok("Name: pygame\nVersion: 2.5.2\nSummary: Python Game Development\n"),
        );
        let provisioner = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/srv/venv"));
        let dep = Dependency::parse("pygame", Some(">=2.1"), DependencySource::Python).unwrap();

        let report = provisioner.ensure(&[dep]).unwrap();

        assert_eq!(report.outcome("pygame"), Some(ProvisionOutcome::Skipped));
        assert_eq!(report.entries[0].version.as_deref(), Some("2.5.2"));
        assert!(runner.calls_matching("python3 -m venv").is_empty());
    }

    #[test]
    fn test_root_builds_venv_as_service_user() {
        let runner = FakeRunner::new();
        let user = crate::domain::Identity {
            user: "pi".into(),
            uid: 1000,
            group: "pi".into(),
        };
        let provisioner = PackageProvisioner::new(&runner, Elevation::Direct, PathBuf::from("/home/pi/voice/venv"))
            .owned_by(UserSession::for_service(&user, true));
        let dep = Dependency::new("pydub", DependencySource::Python);

        // the venv never appears in the fake, so verification fails afterwards
        assert!(provisioner.ensure(&[dep]).is_err());

        assert_eq!(
            runner.calls_matching("runuser -u pi --"),
            vec![
                "runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 python3 -m venv /home/pi/voice/venv".to_string(),
                "runuser -u pi -- env XDG_RUNTIME_DIR=/run/user/1000 /home/pi/voice/venv/bin/python -m pip install --disable-pip-version-check pydub".to_string(),
            ]
        );
        assert!(runner.calls_matching("python3 -m venv").is_empty());
    }
}
