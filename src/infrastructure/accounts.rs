//! Service account resolution and audio group membership.

use std::env;

use nix::unistd::{Group, Uid, User};

use super::command::{CommandRunner, CommandSpec};
use super::privilege::Elevation;
use super::probe::CapabilityProbe;
use crate::domain::{AppError, Identity, Result};

/// Pick the account the service should run as.
///
/// An explicit name wins; otherwise the user who invoked sudo, then the
/// current login.
#[must_use]
pub fn service_user_name(configured: Option<&str>) -> Option<String> {
    configured
        .map(ToString::to_string)
        .or_else(|| env::var("SUDO_USER").ok().filter(|u| !u.is_empty()))
        .or_else(|| {
            User::from_uid(Uid::current())
                .ok()
                .flatten()
                .map(|u| u.name)
        })
}

/// Resolve uid and primary group for `name` from the system databases.
///
/// # Errors
/// Returns `Config` if the account does not exist.
pub fn resolve_identity(name: &str) -> Result<Identity> {
    let user = User::from_name(name)
        .map_err(|e| AppError::Config {
            message: format!("Failed to look up user '{name}': {e}"),
        })?
        .ok_or_else(|| AppError::Config {
            message: format!("User '{name}' does not exist"),
        })?;

    let group = Group::from_gid(user.gid)
        .ok()
        .flatten()
        .map_or_else(|| user.gid.to_string(), |g| g.name);

    Ok(Identity {
        user: user.name,
        uid: user.uid.as_raw(),
        group,
    })
}

/// Adds and removes the service user from the audio group.
pub struct GroupMembership<'a> {
    runner: &'a dyn CommandRunner,
    elevation: Elevation,
}

impl<'a> GroupMembership<'a> {
    #[must_use]
    pub const fn new(runner: &'a dyn CommandRunner, elevation: Elevation) -> Self {
        Self { runner, elevation }
    }

    /// Ensure `user` belongs to `group`. Returns whether membership changed.
    ///
    /// # Errors
    /// Returns error if `usermod` fails.
    pub fn grant(&self, user: &str, group: &str) -> Result<bool> {
        if CapabilityProbe::new(self.runner).is_group_member(user, group)? {
            tracing::debug!(user, group, "Already a group member");
            return Ok(false);
        }

        let spec = self
            .elevation
            .wrap(CommandSpec::new("usermod").args(["-aG", group, user]));
        self.runner.run(&spec)?.check(&spec)?;

        tracing::info!(user, group, "Added user to group");
        Ok(true)
    }

    /// Ensure `user` does not belong to `group`. Returns whether membership changed.
    ///
    /// # Errors
    /// Returns error if `gpasswd` fails.
    pub fn revoke(&self, user: &str, group: &str) -> Result<bool> {
        if !CapabilityProbe::new(self.runner).is_group_member(user, group)? {
            tracing::debug!(user, group, "Not a group member, nothing to remove");
            return Ok(false);
        }

        let spec = self
            .elevation
            .wrap(CommandSpec::new("gpasswd").args(["-d", user, group]));
        self.runner.run(&spec)?.check(&spec)?;

        tracing::info!(user, group, "Removed user from group");
        Ok(true)
    }
}
