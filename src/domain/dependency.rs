//! Dependency declarations and provisioning outcomes.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use super::{AppError, Result};

/// Where a dependency is installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencySource {
    /// Debian package managed by apt.
    System,
    /// Python package installed into the service virtualenv.
    Python,
}

impl fmt::Display for DependencySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Python => write!(f, "python"),
        }
    }
}

/// Version requirement attached to a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VersionConstraint {
    /// `==X`
    Exact(String),
    /// `>=X`
    AtLeast(String),
}

impl VersionConstraint {
    /// Parse `==X`, `>=X` or a bare `X` (treated as exact).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (constraint, version) = if let Some(v) = raw.strip_prefix(">=") {
            (Self::AtLeast(v.trim().to_string()), v.trim())
        } else if let Some(v) = raw.strip_prefix("==") {
            (Self::Exact(v.trim().to_string()), v.trim())
        } else {
            (Self::Exact(raw.to_string()), raw)
        };

        if version.is_empty() || numeric_parts(version).is_empty() {
            return Err(AppError::Config {
                message: format!("Invalid version constraint: '{raw}'"),
            });
        }

        Ok(constraint)
    }

    /// Whether `installed` satisfies this constraint.
    #[must_use]
    pub fn is_satisfied_by(&self, installed: &str) -> bool {
        match self {
            Self::Exact(v) => compare_versions(installed, v) == Ordering::Equal,
            Self::AtLeast(v) => compare_versions(installed, v) != Ordering::Less,
        }
    }

}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "=={v}"),
            Self::AtLeast(v) => write!(f, ">={v}"),
        }
    }
}

/// Leading dot-separated numeric components of a version.
///
/// A Debian epoch (`1:`) is dropped and parsing stops at the first
/// component that does not start with a digit, so `1:4.4.2-1+deb12u1`
/// yields `[4, 4, 2]`.
fn numeric_parts(version: &str) -> Vec<u64> {
    let version = version.split_once(':').map_or(version, |(_, rest)| rest);
    let mut parts = Vec::new();

    for component in version.split('.') {
        let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            break;
        }
        parts.push(digits.parse().unwrap_or(u64::MAX));
        if digits.len() != component.len() {
            break;
        }
    }

    parts
}

/// Compare two versions component-wise; missing components count as zero.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a = numeric_parts(a);
    let b = numeric_parts(b);
    let len = a.len().max(b.len());

    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// A declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Package name.
    pub name: String,
    /// Optional version requirement.
    pub constraint: Option<VersionConstraint>,
    /// Package source.
    pub source: DependencySource,
}

impl Dependency {
    /// Dependency satisfied by any installed version.
    #[must_use]
    pub fn new(name: impl Into<String>, source: DependencySource) -> Self {
        Self {
            name: name.into(),
            constraint: None,
            source,
        }
    }

    /// Build from a config entry.
    pub fn parse(name: &str, version: Option<&str>, source: DependencySource) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(AppError::Config {
                message: format!("Empty {source} dependency name"),
            });
        }

        Ok(Self {
            name: name.trim().to_string(),
            constraint: version.map(VersionConstraint::parse).transpose()?,
            source,
        })
    }

    /// Whether an installed version (if any) satisfies this dependency.
    ///
    /// Without a constraint only presence matters.
    #[must_use]
    pub fn is_satisfied_by(&self, installed: Option<&str>) -> bool {
        match (installed, &self.constraint) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(v), Some(c)) => c.is_satisfied_by(v),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{}{c}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What provisioning did for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionOutcome {
    /// Already satisfied; nothing was done.
    Skipped,
    /// Installed during this run.
    Installed,
}

impl fmt::Display for ProvisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Installed => write!(f, "installed"),
        }
    }
}

/// One line of a provisioning report.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionEntry {
    /// The dependency.
    pub dependency: Dependency,
    /// What happened.
    pub outcome: ProvisionOutcome,
    /// Version present after provisioning, when known.
    pub version: Option<String>,
}

/// Result of a successful `ensure` call, in declaration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    /// Per-dependency outcomes.
    pub entries: Vec<ProvisionEntry>,
}

impl ProvisionReport {
    /// Outcome recorded for `name`.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<ProvisionOutcome> {
        self.entries
            .iter()
            .find(|e| e.dependency.name == name)
            .map(|e| e.outcome)
    }

    /// Number of dependencies installed in this run.
    #[must_use]
    pub fn installed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == ProvisionOutcome::Installed)
            .count()
    }
}
