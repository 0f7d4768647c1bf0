//! Application layer - use cases and orchestration.
//!
//! This layer contains the install and uninstall flows and the
//! terminal reporting built on top of them.

pub mod descriptor_builder;
pub mod orchestrator;
pub mod provisioner;
pub mod report;

pub use orchestrator::{
    InstallMode, InstallOrchestrator, InstallSummary, ServiceSummary, UninstallSummary,
};
pub use provisioner::PackageProvisioner;
pub use report::{
    format_capabilities_json, format_capabilities_table, format_install_summary,
    format_provision_table, format_status, format_uninstall_summary,
};
