//! Config Commands

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::config::TandemConfig;
use crate::output::{print_json, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write the default configuration file
    Init {
        /// Target file (defaults to the global --config path)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    TandemConfig::default().save(path)
}

pub fn execute(cmd: ConfigCommands, config_path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Init { path, force } => {
            let path = path.as_deref().unwrap_or(config_path);
            init(path, force)?;
            print_success(&format!("Wrote {}", path.display()));
        }
        ConfigCommands::Show => {
            let config = TandemConfig::load(config_path)?;
            match format {
                OutputFormat::Json => print_json(&config),
                OutputFormat::Table => print!("{}", toml::to_string_pretty(&config)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.toml");

        init(&path, false).unwrap();
        assert!(TandemConfig::load(&path).is_ok());
        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();
    }
}
