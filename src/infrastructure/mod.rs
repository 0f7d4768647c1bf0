//! Infrastructure layer - external adapters (processes, filesystem, systemd).
//!
//! This layer handles all I/O operations and external dependencies.

pub mod accounts;
pub mod command;
pub mod config;
pub mod privilege;
pub mod probe;
pub mod systemd;

pub use accounts::{resolve_identity, service_user_name, GroupMembership};
pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::{config_file_path, ensure_config_exists, load_config};
pub use privilege::{Elevation, UserSession};
pub use probe::CapabilityProbe;
pub use systemd::{InstallResult, SystemdController};
