//! Domain layer - core types of the installer.
//!
//! This layer contains pure models and error types
//! without any external dependencies (processes, filesystem).

pub mod capability;
pub mod config;
pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod service;

pub use capability::{Capability, CapabilityKind, CapabilitySet};
pub use config::{DependencyEntry, InstallerConfig};
pub use dependency::{
    Dependency, DependencySource, ProvisionEntry, ProvisionOutcome, ProvisionReport,
    VersionConstraint,
};
pub use descriptor::{DescriptorParts, Limit, ResourceLimits, RestartPolicy, ServiceDescriptor};
pub use error::{AppError, Result};
pub use host::{Identity, ServicePaths};
pub use service::{GroupDecision, ServiceState, ServiceStatus, StartOutcome, StartPolicy};
