//! Builds the service descriptor from probed capabilities.
//!
//! `build` is a pure function of its inputs: the same capabilities,
//! paths, identity and settings always yield an identical descriptor.

use std::collections::BTreeMap;

use crate::domain::{
    CapabilityKind, CapabilitySet, DescriptorParts, Identity, InstallerConfig, ResourceLimits,
    RestartPolicy, ServiceDescriptor, ServicePaths,
};

/// Build the descriptor for the managed service.
#[must_use]
pub fn build(
    capabilities: &CapabilitySet,
    paths: &ServicePaths,
    identity: &Identity,
    config: &InstallerConfig,
) -> ServiceDescriptor {
    ServiceDescriptor::new(DescriptorParts {
        name: config.service.name.clone(),
        description: config.service.description.clone(),
        exec_start: vec![
            paths.python.display().to_string(),
            paths.entry_script.display().to_string(),
        ],
        working_directory: paths.install_dir.clone(),
        user: identity.user.clone(),
        group: identity.group.clone(),
        supplementary_groups: vec![config.service.audio_group.clone()],
        environment: environment(capabilities, identity),
        restart: RestartPolicy {
            restart_sec: config.timing.restart_sec,
            success_exit_status: config.timing.success_exit_status,
        },
        limits: ResourceLimits::default(),
        startup_delay_secs: config.timing.startup_delay_secs,
        enabled: true,
    })
}

/// Runtime environment for the managed process.
///
/// Backend variables are emitted only for detected backends.
fn environment(capabilities: &CapabilitySet, identity: &Identity) -> BTreeMap<String, String> {
    let runtime_dir = identity.runtime_dir();
    let pulse = capabilities.is_present(CapabilityKind::PulseAudio);
    let pipewire = capabilities.is_present(CapabilityKind::PipeWire);

    let mut env = BTreeMap::new();
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

    if pulse || pipewire {
        env.insert("XDG_RUNTIME_DIR".to_string(), runtime_dir.clone());
    }

    if pulse {
        env.insert(
            "PULSE_SERVER".to_string(),
            format!("unix:{runtime_dir}/pulse/native"),
        );
        env.insert("SDL_AUDIODRIVER".to_string(), "pulseaudio".to_string());
    }

    if pipewire {
        env.insert("PIPEWIRE_RUNTIME_DIR".to_string(), runtime_dir);
        // SDL talks to pipewire-pulse when it is there
        if !pulse {
            env.insert("SDL_AUDIODRIVER".to_string(), "pipewire".to_string());
        }
    }

    env
}
