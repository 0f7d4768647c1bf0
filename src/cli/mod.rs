//! CLI interface using clap.
//!
//! Provides command-line arguments and subcommands for the tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::application::InstallMode;

/// Voice Service Installer - Set up the Klipper voice notifier as a systemd service.
///
/// Every command is safe to re-run: install converges toward a running,
/// enabled service and uninstall toward a clean host.
#[derive(Parser, Debug)]
#[command(name = "voice-service-installer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (use multiple times for more verbosity).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (default: ~/.config/voice-service-installer/config.toml).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install dependencies and the service, then start it.
    Install {
        /// What to install: full, deps-only, or service-only.
        #[arg(short, long, default_value = "full")]
        mode: String,
    },

    /// Stop and remove the service.
    Uninstall {
        /// Audio group membership of the service user: keep, remove, or ask.
        #[arg(long, default_value = "keep")]
        audio_group: String,
    },

    /// Show service status.
    Status,

    /// Show detected host capabilities.
    Probe {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show recent service logs.
    Logs {
        /// Number of lines to show.
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Print the unit file that install would write.
    Unit,

    /// Write a commented default configuration file.
    InitConfig,
}

/// How uninstall treats audio group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioGroupChoice {
    #[default]
    Keep,
    Remove,
    /// Prompt on the terminal.
    Ask,
}

impl std::str::FromStr for AudioGroupChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "remove" => Ok(Self::Remove),
            "ask" => Ok(Self::Ask),
            _ => Err(format!("Unknown audio group choice: {s}. Use: keep, remove, ask")),
        }
    }
}

impl Commands {
    /// Parse the install mode argument.
    pub fn install_mode(mode: &str) -> Result<InstallMode, String> {
        mode.parse()
    }

    /// Parse the audio group argument.
    pub fn audio_group_choice(choice: &str) -> Result<AudioGroupChoice, String> {
        choice.parse()
    }
}
