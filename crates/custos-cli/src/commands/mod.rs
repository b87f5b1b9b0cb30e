//! CLI subcommands.

pub mod check_policy;
pub mod standalone_sign;
pub mod standalone_verify;
pub mod verify;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::{Result, WrapErr as _};
use custos_policy::{Policy, PolicyConfig};

/// Where to find the policy.
#[derive(Args)]
pub struct PolicySource {
    /// Policy file to use instead of the default locations.
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,

    /// TOML file overriding the default policy locations.
    #[arg(long, value_name = "PATH", conflicts_with = "policy")]
    pub config: Option<PathBuf>,
}

impl PolicySource {
    /// Load the selected policy and report which file it came from.
    pub fn load(&self) -> Result<(PathBuf, Policy)> {
        if let Some(path) = &self.policy {
            return Ok((path.clone(), Policy::from_file(path)?));
        }
        let config = match &self.config {
            Some(path) => PolicyConfig::from_toml_file(path)?,
            None => PolicyConfig::default(),
        };
        let path = config.policy_path().to_path_buf();
        let policy = config.default_policy()?;
        Ok((path, policy))
    }
}

/// Read a whole file, naming it on failure.
pub fn read_file(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).wrap_err_with(|| format!("failed to read {what} {}", path.display()))
}
