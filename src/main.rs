//! Voice Service Installer - Set up the Klipper voice notifier as a systemd service.
//!
//! Detects the audio stack and package manager, installs missing system and
//! Python dependencies, writes a unit file tuned to the detected audio
//! backend, and verifies that the service starts.
//!
//! QUICK START:
//!   voice-service-installer probe                 # What the host provides
//!   voice-service-installer unit                  # Preview the unit file
//!   sudo voice-service-installer install          # Dependencies + service
//!   voice-service-installer status                # Current state
//!   sudo voice-service-installer uninstall        # Remove the service

mod application;
mod cli;
mod domain;
mod infrastructure;

use std::io::{self, BufRead, Write};

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use application::{
    format_capabilities_json, format_capabilities_table, format_install_summary,
    format_provision_table, format_status, format_uninstall_summary, InstallOrchestrator,
};
use cli::{AudioGroupChoice, Cli, Commands};
use domain::{GroupDecision, InstallerConfig};
use infrastructure::{
    config_file_path, ensure_config_exists, load_config, Elevation, SystemRunner, SystemdController,
};

fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}

/// Main application logic.
fn run(cli: Cli) -> domain::Result<()> {
    let config_path = cli.config.as_deref();
    let config = || load_config(config_path);

    match cli.command {
        Commands::Install { mode } => {
            let mode = Commands::install_mode(&mode)
                .map_err(|e| domain::AppError::Config { message: e })?;
            cmd_install(&config()?, mode)
        }
        Commands::Uninstall { audio_group } => {
            let choice = Commands::audio_group_choice(&audio_group)
                .map_err(|e| domain::AppError::Config { message: e })?;
            cmd_uninstall(&config()?, choice)
        }
        Commands::Status => cmd_status(&config()?),
        Commands::Probe { json } => cmd_probe(&config()?, json),
        Commands::Logs { lines } => cmd_logs(&config()?, lines),
        Commands::Unit => cmd_unit(&config()?),
        Commands::InitConfig => cmd_init_config(&config_file_path(config_path)),
    }
}

/// Install command.
fn cmd_install(config: &InstallerConfig, mode: application::InstallMode) -> domain::Result<()> {
    let runner = SystemRunner;
    let summary = InstallOrchestrator::new(config, &runner).install(mode)?;

    if let Some(report) = &summary.provision {
        println!("{}", format_provision_table(report));
    }

    println!("{} Install finished", "✓".green());
    print!("{}", format_install_summary(&summary));

    Ok(())
}

/// Uninstall command.
fn cmd_uninstall(config: &InstallerConfig, choice: AudioGroupChoice) -> domain::Result<()> {
    let decision = match choice {
        AudioGroupChoice::Keep => GroupDecision::Keep,
        AudioGroupChoice::Remove => GroupDecision::Remove,
        AudioGroupChoice::Ask => ask_group_decision(&config.service.audio_group)?,
    };

    let runner = SystemRunner;
    let summary = InstallOrchestrator::new(config, &runner).uninstall(decision)?;

    println!("{} {}", "✓".green(), format_uninstall_summary(&summary));

    Ok(())
}

/// Ask once whether to drop the service user from the audio group.
fn ask_group_decision(group: &str) -> domain::Result<GroupDecision> {
    print!("Also remove the service user from the '{group}' group? [y/N] ");
    io::stdout()
        .flush()
        .map_err(|e| domain::AppError::io("Failed to write prompt", e))?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| domain::AppError::io("Failed to read answer", e))?;

    Ok(GroupDecision::from_answer(&answer))
}

/// Status command.
fn cmd_status(config: &InstallerConfig) -> domain::Result<()> {
    let runner = SystemRunner;
    let controller = read_only_controller(config, &runner);
    let status = controller.query_status()?;

    println!("{}", format_status(controller.unit(), &status));
    println!("  Path: {}", controller.service_file_path().display());

    Ok(())
}

/// Probe command.
fn cmd_probe(config: &InstallerConfig, json: bool) -> domain::Result<()> {
    let runner = SystemRunner;
    let capabilities = InstallOrchestrator::new(config, &runner).capabilities();

    if json {
        let out = format_capabilities_json(&capabilities).map_err(|e| domain::AppError::Config {
            message: format!("Failed to serialize capabilities: {e}"),
        })?;
        println!("{out}");
    } else {
        println!("{}", format_capabilities_table(&capabilities));
        if let Err(e) = capabilities.require_mandatory() {
            println!("{} {}", "⚠".yellow(), e);
        }
    }

    Ok(())
}

/// Logs command.
fn cmd_logs(config: &InstallerConfig, lines: usize) -> domain::Result<()> {
    let runner = SystemRunner;
    let logs = read_only_controller(config, &runner).view_logs(lines)?;

    if logs.trim().is_empty() {
        println!("No log entries (journal access may need sudo or the 'adm' group).");
    } else {
        print!("{logs}");
    }

    Ok(())
}

/// Unit preview command.
fn cmd_unit(config: &InstallerConfig) -> domain::Result<()> {
    let runner = SystemRunner;
    let unit = InstallOrchestrator::new(config, &runner).preview_unit()?;

    println!("# {}", config.unit_file_path().display());
    print!("{unit}");

    Ok(())
}

/// Init config command.
fn cmd_init_config(path: &std::path::Path) -> domain::Result<()> {
    if ensure_config_exists(path)? {
        println!("{} Created {}", "✓".green(), path.display());
    } else {
        println!("Config already exists: {}", path.display());
    }

    Ok(())
}

fn read_only_controller<'a>(
    config: &InstallerConfig,
    runner: &'a SystemRunner,
) -> SystemdController<'a> {
    SystemdController::new(
        runner,
        Elevation::Direct,
        config.unit_name(),
        config.service.unit_dir.clone(),
    )
}

/// Setup tracing/logging based on verbosity level.
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
