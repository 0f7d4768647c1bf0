//! Host capabilities discovered at run time.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::{AppError, Result};

/// Kinds of capability the installer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    /// A PulseAudio-protocol sound server.
    PulseAudio,
    /// A PipeWire media server.
    PipeWire,
    /// apt / dpkg.
    PackageManager,
    /// systemd.
    InitSystem,
}

impl CapabilityKind {
    /// All kinds in report order.
    pub const ALL: [Self; 4] = [
        Self::PackageManager,
        Self::InitSystem,
        Self::PulseAudio,
        Self::PipeWire,
    ];

    /// Whether the installer cannot run without this capability.
    #[must_use]
    pub const fn is_mandatory(self) -> bool {
        matches!(self, Self::PackageManager | Self::InitSystem)
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PulseAudio => "PulseAudio",
            Self::PipeWire => "PipeWire",
            Self::PackageManager => "package manager (apt)",
            Self::InitSystem => "init system (systemd)",
        };
        f.write_str(name)
    }
}

/// A single probed fact about the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub kind: CapabilityKind,
    pub present: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Capability {
    /// A capability that was not found.
    #[must_use]
    pub const fn absent(kind: CapabilityKind) -> Self {
        Self {
            kind,
            present: false,
            metadata: BTreeMap::new(),
        }
    }

    /// A capability that was found.
    #[must_use]
    pub const fn present(kind: CapabilityKind) -> Self {
        Self {
            kind,
            present: true,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The result of one probe run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CapabilitySet {
    capabilities: BTreeMap<CapabilityKind, Capability>,
}

impl CapabilitySet {
    /// Build a set; kinds not listed are treated as absent.
    #[must_use]
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().map(|c| (c.kind, c)).collect(),
        }
    }

    /// Whether `kind` was detected.
    #[must_use]
    pub fn is_present(&self, kind: CapabilityKind) -> bool {
        self.capabilities.get(&kind).is_some_and(|c| c.present)
    }

    /// Detail for `kind`, if probed.
    #[must_use]
    pub fn get(&self, kind: CapabilityKind) -> Option<&Capability> {
        self.capabilities.get(&kind)
    }

    /// Probed capabilities in report order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        CapabilityKind::ALL
            .into_iter()
            .filter_map(move |kind| self.capabilities.get(&kind))
    }

    /// Fail if any mandatory capability is absent.
    pub fn require_mandatory(&self) -> Result<()> {
        match CapabilityKind::ALL
            .into_iter()
            .find(|k| k.is_mandatory() && !self.is_present(*k))
        {
            Some(kind) => Err(AppError::MissingCapability {
                capability: kind.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Whether any audio backend was detected.
    #[must_use]
    pub fn has_audio_backend(&self) -> bool {
        self.is_present(CapabilityKind::PulseAudio) || self.is_present(CapabilityKind::PipeWire)
    }
}
