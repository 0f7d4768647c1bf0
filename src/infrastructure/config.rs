//! Configuration file management.
//!
//! Handles loading TOML configuration files and writing the default one.

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{AppError, InstallerConfig, Result};

/// Default configuration file content.
const DEFAULT_CONFIG: &str = r#"# Voice Service Installer Configuration
# Auto-generated - edit as needed

[service]
# Unit name without the .service suffix
name = "klipper-voice-manager"
description = "Klipper Voice Manager"

# Directory holding main.py (defaults to the directory the installer runs from)
# install_dir = "/home/pi/klipper-voice-manager"
entry_script = "main.py"
venv_dir = "venv"

unit_dir = "/etc/systemd/system"
audio_group = "audio"

# Account the service runs as (defaults to the user who invoked sudo)
# user = "pi"

[timing]
# Delay before the notifier starts, so audio servers can come up first
startup_delay_secs = 10
restart_sec = 5

# The notifier exits with this status to stop without being restarted
success_exit_status = 143

start_timeout_secs = 30
poll_interval_ms = 500

# The service must keep one main process this long to count as started;
# a crash during this window is reported instead of left to restart silently
settle_secs = 3

[dependencies]
# Optional constraints: version = ">=2.5" or version = "==1.0.3"
system = [
    { name = "python3" },
    { name = "python3-venv" },
    { name = "python3-pip" },
    { name = "ffmpeg" },
    { name = "libsdl2-mixer-2.0-0" },
    { name = "pulseaudio-utils" },
]
python = [
    { name = "pygame" },
    { name = "pydub" },
    { name = "psutil" },
    { name = "websocket-client" },
    { name = "PyYAML" },
    { name = "watchdog" },
]
"#;

/// Resolve the config path, falling back to the default location.
#[must_use]
pub fn config_file_path(custom: Option<&Path>) -> PathBuf {
    custom.map_or_else(InstallerConfig::default_config_path, Path::to_path_buf)
}

/// Load configuration from file or use defaults.
///
/// # Errors
/// Returns error if file exists but cannot be read or parsed.
pub fn load_config(custom: Option<&Path>) -> Result<InstallerConfig> {
    let config_path = config_file_path(custom);

    if config_path.exists() {
        load_config_from_file(&config_path)
    } else if custom.is_some() {
        Err(AppError::Config {
            message: format!("Config file not found: {}", config_path.display()),
        })
    } else {
        tracing::debug!(path = %config_path.display(), "No config file, using defaults");
        Ok(InstallerConfig::default())
    }
}

/// Load configuration from a specific file.
///
/// # Errors
/// Returns error if file cannot be read or parsed.
pub fn load_config_from_file(path: &Path) -> Result<InstallerConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::io(format!("Failed to read config file: {}", path.display()), e))?;

    let config: InstallerConfig = toml::from_str(&content).map_err(|e| AppError::Config {
        message: format!("Failed to parse config file: {e}"),
    })?;

    // Surface malformed version constraints at load time.
    config.declared_dependencies()?;

    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Create the commented default configuration file if it doesn't exist.
///
/// Returns whether a file was created.
///
/// # Errors
/// Returns error if file cannot be created.
pub fn ensure_config_exists(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    create_parent(path)?;
    fs::write(path, DEFAULT_CONFIG)
        .map_err(|e| AppError::io("Failed to create default config", e))?;

    tracing::info!(path = %path.display(), "Created default configuration");

    Ok(true)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io("Failed to create config directory", e))?;
    }
    Ok(())
}
