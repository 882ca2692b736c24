use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deploy_core::control::ControlPlane;
use deploy_core::plugin::PluginRegistry;
use std::path::PathBuf;
use tracing::debug;

mod commands;
mod logging;
mod output;
mod settings;

use output::Format;
use settings::Settings;

#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "Deploy and operate multi-component clusters over SSH")]
#[command(version)]
struct Cli {
    /// Settings file path (defaults to the user config directory)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Deployment store directory, overriding the settings file
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log filter, overriding the settings file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store or replace a deployment document
    Config {
        /// Deployment name
        name: String,
        /// Deployment document
        #[arg(short = 'c', long = "config")]
        file: PathBuf,
    },

    /// Check servers and parameters before installing
    Precheck {
        /// Deployment name
        name: String,
    },

    /// Apply the automatic fixes proposed by precheck
    Recover {
        /// Deployment name
        name: String,
    },

    /// Install and start every component
    Install {
        /// Deployment name
        name: String,
    },

    /// Stop every component and remove it from its servers
    Destroy {
        /// Deployment name
        name: String,
    },

    /// Restart every component from scratch
    Reinstall {
        /// Deployment name
        name: String,
    },

    /// Move one component to another version
    Upgrade {
        /// Deployment name
        name: String,
        /// Component to upgrade
        component: String,
        /// Target version
        version: String,
    },

    /// Add components to an installed deployment
    AddComponent {
        /// Deployment name
        name: String,
        /// Document with the new components
        #[arg(short = 'c', long = "config")]
        file: PathBuf,
    },

    /// Remove one component from an installed deployment
    DelComponent {
        /// Deployment name
        name: String,
        /// Component to remove
        component: String,
    },

    /// Start every component
    Start {
        /// Deployment name
        name: String,
    },

    /// Stop every component
    Stop {
        /// Deployment name
        name: String,
    },

    /// Show a deployment, or list all of them
    Status {
        /// Deployment name
        name: Option<String>,
    },

    /// Show the processes of every component
    Display {
        /// Deployment name
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.settings.as_deref())?;
    if let Some(home) = cli.home {
        settings.home = home;
    }
    let level = cli.log_level.as_deref().unwrap_or(&settings.log_level);
    let _guard = logging::init(level, settings.log_file.as_deref())?;
    debug!(home = %settings.home.display(), "settings loaded");

    let plugins = PluginRegistry::from_profiles(&settings.components)
        .context("Invalid component profiles")?;
    let plane = ControlPlane::builder(settings.control_plane())
        .with_plugins(plugins)
        .build()
        .context("Failed to start the control plane")?;

    let format = cli.format;
    smol::block_on(async {
        match cli.command {
            Commands::Config { name, file } => commands::config::run(&plane, &name, &file, format),
            Commands::Precheck { name } => commands::precheck::run(&plane, &name, format).await,
            Commands::Recover { name } => commands::precheck::recover(&plane, &name, format).await,
            Commands::Install { name } => commands::lifecycle::install(&plane, &name, format).await,
            Commands::Destroy { name } => commands::lifecycle::destroy(&plane, &name, format).await,
            Commands::Reinstall { name } => commands::lifecycle::reinstall(&plane, &name, format).await,
            Commands::Upgrade { name, component, version } => {
                commands::lifecycle::upgrade(&plane, &name, &component, &version, format).await
            }
            Commands::AddComponent { name, file } => {
                commands::lifecycle::add_component(&plane, &name, &file, format).await
            }
            Commands::DelComponent { name, component } => {
                commands::lifecycle::del_component(&plane, &name, &component, format).await
            }
            Commands::Start { name } => commands::lifecycle::start(&plane, &name, format).await,
            Commands::Stop { name } => commands::lifecycle::stop(&plane, &name, format).await,
            Commands::Status { name: Some(name) } => commands::status::run(&plane, &name, format),
            Commands::Status { name: None } => commands::status::list(&plane, format),
            Commands::Display { name } => commands::status::display(&plane, &name, format).await,
        }
    })
}
