//! Config commands

use crate::config::{defaults_beside, load};
use crate::output::OutputFormat;
use crate::ConfigCommands;
use anyhow::Context;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tenancy_security::EncryptionManager;

pub fn handle(action: ConfigCommands, config_path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        ConfigCommands::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!("{} already exists (use --force)", config_path.display());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }

            let config = defaults_beside(config_path);
            if let Some(key_path) = &config.key_path {
                if key_path.exists() {
                    println!("Keeping existing key {}", key_path.display());
                } else {
                    EncryptionManager::generate_key_file(key_path)?;
                    println!("Generated master key {}", key_path.display());
                }
            }
            config.save(config_path)?;
            println!("{} {}", "Configuration written to".green(), config_path.display());
        }
        ConfigCommands::Show => {
            let config = load(config_path)?;
            format.print(&config)?;
        }
        ConfigCommands::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}

pub fn keygen(config_path: &Path, path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path,
        None => load(config_path)?
            .key_path
            .context("config has no key_path; pass --path")?,
    };
    EncryptionManager::generate_key_file(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Generated master key {}", path.display());
    Ok(())
}
