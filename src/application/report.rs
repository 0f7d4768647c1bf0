//! Terminal output for probe results, provisioning and service state.
//!
//! Tables for human reading, JSON for scripts.

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};

use super::orchestrator::{InstallSummary, UninstallSummary};
use crate::domain::{
    CapabilitySet, ProvisionOutcome, ProvisionReport, ServiceState, ServiceStatus, StartOutcome,
};

/// Formats probed capabilities as a table.
pub fn format_capabilities_table(capabilities: &CapabilitySet) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Capability", "Present", "Required", "Details"]);

    for cap in capabilities.iter() {
        let details = cap
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}={}", truncate(v, 40)))
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            cap.kind.to_string(),
            if cap.present { "yes" } else { "no" }.to_string(),
            if cap.kind.is_mandatory() { "yes" } else { "-" }.to_string(),
            if details.is_empty() { "-".to_string() } else { details },
        ]);
    }

    table.to_string()
}

/// Formats probed capabilities as JSON.
///
/// # Errors
/// Returns error if serialization fails.
pub fn format_capabilities_json(capabilities: &CapabilitySet) -> Result<String, serde_json::Error> {
    let list: Vec<_> = capabilities.iter().collect();
    serde_json::to_string_pretty(&list)
}

/// Formats a provisioning report as a table.
pub fn format_provision_table(report: &ProvisionReport) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Dependency", "Source", "Required", "Version", "Action"]);

    for entry in &report.entries {
        let dep = &entry.dependency;
        table.add_row(vec![
            dep.name.clone(),
            dep.source.to_string(),
            dep.constraint
                .as_ref()
                .map_or_else(|| "any".to_string(), ToString::to_string),
            entry.version.clone().unwrap_or_else(|| "-".to_string()),
            entry.outcome.to_string(),
        ]);
    }

    table.to_string()
}

/// Formats the service status block.
pub fn format_status(unit: &str, status: &ServiceStatus) -> String {
    let state = match status.state() {
        ServiceState::Running => status.short_status().green(),
        ServiceState::Failed => status.short_status().red(),
        ServiceState::Absent => status.short_status().dimmed(),
        ServiceState::Registered | ServiceState::Enabled => status.short_status().yellow(),
    };

    let mut out = format!(
        "{}\n  Unit: {}\n  State: {}\n  Unit file: {}\n  Enabled: {}",
        "🔊 Voice service".bold(),
        unit.cyan(),
        state,
        if status.is_installed { "present" } else { "missing" },
        if status.is_enabled { "yes" } else { "no" },
    );

    if !status.active_state.is_empty() {
        out.push_str(&format!(
            "\n  Active: {} ({})",
            status.active_state, status.sub_state
        ));
    }
    if let Some(code) = status.exit_status {
        out.push_str(&format!("\n  Last exit status: {code}"));
    }

    out
}

/// Formats the result of an install run.
pub fn format_install_summary(summary: &InstallSummary) -> String {
    let mut out = String::new();

    if let Some(report) = &summary.provision {
        let skipped = report
            .entries
            .iter()
            .filter(|e| e.outcome == ProvisionOutcome::Skipped)
            .count();
        out.push_str(&format!(
            "{} {} installed, {} already present\n",
            "📦 Dependencies:".bold(),
            report.installed_count().to_string().green(),
            skipped.to_string().cyan()
        ));
    }

    if let Some(service) = &summary.service {
        let outcome = match service.outcome {
            StartOutcome::Running => "running".green().to_string(),
            StartOutcome::ExitedCleanly { status } => {
                format!("exited cleanly (status {status})").yellow().to_string()
            }
        };
        out.push_str(&format!(
            "{} {} as {}: {}\n  Unit file: {}{}\n",
            "🔊 Service:".bold(),
            service.unit.cyan(),
            service.user,
            outcome,
            service.unit_path.display(),
            if service.unit_changed { " (updated)" } else { " (unchanged)" }
        ));
    }

    let guidance = summary.guidance();
    if !guidance.is_empty() {
        out.push_str(&format!("\n{}\n", "Next steps".bold()));
        for line in guidance {
            out.push_str(&format!("  {line}\n"));
        }
    }

    out
}

/// Formats the result of an uninstall run.
pub fn format_uninstall_summary(summary: &UninstallSummary) -> String {
    let mut out = if summary.previous_state == ServiceState::Absent {
        format!("{} was not installed; nothing to remove.", summary.unit.cyan())
    } else {
        format!(
            "{} removed (was {}).",
            summary.unit.cyan(),
            summary.previous_state
        )
    };

    if summary.group_removed {
        out.push_str("\nService user removed from the audio group.");
    }

    out
}

/// Truncates a string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    let s = s.lines().next().unwrap_or(s);
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, CapabilityKind, Dependency, DependencySource, ProvisionEntry};

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world!", 8), "hello...");
        assert_eq!(truncate("first\nsecond", 20), "first");
    }

    #[test]
    fn test_capabilities_table_lists_every_kind() {
        let caps = CapabilitySet::new([
            Capability::present(CapabilityKind::PackageManager).with("tool", "apt"),
            Capability::present(CapabilityKind::InitSystem).with("version", "252"),
            Capability::absent(CapabilityKind::PulseAudio),
            Capability::absent(CapabilityKind::PipeWire),
        ]);

        let table = format_capabilities_table(&caps);
        assert!(table.contains("tool=apt"));
        assert!(table.contains("PipeWire"));
        assert!(table.contains("init system (systemd)"));
    }

    #[test]
    fn test_capabilities_json() {
        let caps = CapabilitySet::new([Capability::present(CapabilityKind::PulseAudio)
            .with("server_name", "pulseaudio")]);

        let json = format_capabilities_json(&caps).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["kind"], "pulse-audio");
        assert_eq!(value[0]["present"], true);
        assert_eq!(value[0]["metadata"]["server_name"], "pulseaudio");
    }

    #[test]
    fn test_provision_table() {
        let report = ProvisionReport {
            entries: vec![ProvisionEntry {
                dependency: Dependency::new("ffmpeg", DependencySource::System),
                outcome: ProvisionOutcome::Installed,
                version: Some("7:5.1.6-0+deb12u1".into()),
            }],
        };

        let table = format_provision_table(&report);
        assert!(table.contains("ffmpeg"));
        assert!(table.contains("installed"));
        assert!(table.contains("any"));
    }

    #[test]
    fn test_status_of_absent_unit() {
        let text = format_status("voice.service", &ServiceStatus::absent());
        assert!(text.contains("not installed"));
        assert!(text.contains("missing"));
        assert!(!text.contains("Last exit status"));
    }

    #[test]
    fn test_uninstall_summary_for_absent_unit() {
        let summary = UninstallSummary {
            unit: "voice.service".into(),
            previous_state: ServiceState::Absent,
            group_removed: false,
        };
        assert!(format_uninstall_summary(&summary).contains("nothing to remove"));
    }
}
