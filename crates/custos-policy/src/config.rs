//! Where policies live.
//!
//! The per-user policy wins over the system-wide one when it exists. The
//! locations can be overridden from a TOML file:
//!
//! ```toml
//! system_policy_path = "/etc/containers/policy.json"
//! user_policy_path = "/home/me/.config/containers/policy.json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::types::Policy;

/// System-wide policy location.
pub const SYSTEM_POLICY_PATH: &str = "/etc/containers/policy.json";

/// Per-user policy location, relative to the user's config directory.
pub const USER_POLICY_RELATIVE_PATH: &str = "containers/policy.json";

/// Policy file locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Used when the per-user policy does not exist.
    pub system_policy_path: PathBuf,
    /// `None` when no config directory can be determined.
    pub user_policy_path: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let user_policy_path = directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join(USER_POLICY_RELATIVE_PATH));
        if user_policy_path.is_none() {
            tracing::warn!("no home directory found, only the system policy will be used");
        }
        Self {
            system_policy_path: PathBuf::from(SYSTEM_POLICY_PATH),
            user_policy_path,
        }
    }
}

impl PolicyConfig {
    /// Read locations from a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Io`] if the file cannot be read and
    /// [`PolicyError::Config`] if it is not valid.
    pub fn from_toml_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| PolicyError::Config {
            path: path.to_owned(),
            message: e.message().to_owned(),
        })
    }

    /// The policy file that applies: the per-user one if it exists,
    /// otherwise the system one.
    #[must_use]
    pub fn policy_path(&self) -> &Path {
        match &self.user_policy_path {
            Some(user) if user.exists() => user,
            _ => &self.system_policy_path,
        }
    }

    /// Load the policy that applies.
    ///
    /// # Errors
    ///
    /// Fails if the chosen file cannot be read or decoded.
    pub fn default_policy(&self) -> Result<Policy, PolicyError> {
        let path = self.policy_path();
        tracing::debug!(path = %path.display(), "loading default policy");
        Policy::from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::PolicyRequirement;

    const REJECT_ALL: &str = r#"{"default": [{"type": "reject"}]}"#;
    const ACCEPT_ALL: &str = r#"{"default": [{"type": "insecureAcceptAnything"}]}"#;

    #[test]
    fn defaults() {
        let config = PolicyConfig::default();
        assert_eq!(config.system_policy_path, Path::new(SYSTEM_POLICY_PATH));
        if let Some(user) = &config.user_policy_path {
            assert!(user.ends_with(USER_POLICY_RELATIVE_PATH));
        }
    }

    #[test]
    fn user_policy_wins_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let system = dir.path().join("system.json");
        let user = dir.path().join("user.json");
        std::fs::write(&system, REJECT_ALL).expect("write system policy");

        let config = PolicyConfig {
            system_policy_path: system.clone(),
            user_policy_path: Some(user.clone()),
        };
        assert_eq!(config.policy_path(), system);
        assert_eq!(
            config.default_policy().expect("system policy").default,
            vec![PolicyRequirement::Reject]
        );

        std::fs::write(&user, ACCEPT_ALL).expect("write user policy");
        assert_eq!(config.policy_path(), user);
        assert_eq!(
            config.default_policy().expect("user policy").default,
            vec![PolicyRequirement::InsecureAcceptAnything]
        );
    }

    #[test]
    fn missing_policy_reports_path() {
        let config = PolicyConfig {
            system_policy_path: PathBuf::from("/nonexistent/custos/policy.json"),
            user_policy_path: None,
        };
        let err = config.default_policy().expect_err("missing file");
        assert!(matches!(err, PolicyError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/custos/policy.json"));
    }

    #[test]
    fn toml_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custos.toml");
        std::fs::write(&path, "system_policy_path = \"/srv/policy.json\"\n").expect("write config");
        let config = PolicyConfig::from_toml_file(&path).expect("valid config");
        assert_eq!(config.system_policy_path, Path::new("/srv/policy.json"));
        assert_eq!(config.user_policy_path, PolicyConfig::default().user_policy_path);

        std::fs::write(&path, "policy = \"/srv/policy.json\"\n").expect("write config");
        let err = PolicyConfig::from_toml_file(&path).expect_err("unknown key");
        assert!(matches!(err, PolicyError::Config { .. }), "{err}");
    }
}
