//! Configuration schema for multipackager
//!
//! Configuration is stored at `/etc/multipackager/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache and working directories
    pub paths: PathsConfig,

    /// Sandbox launcher and transaction settings
    pub sandbox: SandboxConfig,

    /// Package build settings
    pub build: BuildConfig,

    /// Distribution mirrors
    pub mirrors: MirrorsConfig,

    /// Distributions to build for
    pub targets: Vec<TargetConfig>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Record every target outcome in the build history journal
    pub history: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            history: true,
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where bootstrap and build tiers are kept between runs
    pub cache: PathBuf,

    /// Where per-run working copies are created
    pub working: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache: PathBuf::from("/var/opt/multipackager"),
            working: PathBuf::from("/root/multipackager"),
        }
    }
}

/// How cache tiers are mutated and copied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Overlayfs upper layer merged back on success
    #[default]
    Overlay,
    /// Full backup copy restored on failure
    Copy,
}

/// Sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Namespace launcher binary
    pub launcher: String,

    /// Shell started by the `shell` command
    pub shell: String,

    /// Host paths bind-mounted into interactive shells
    pub binds: Vec<String>,

    /// Transaction strategy for cache tiers and working copies
    pub strategy: StrategyKind,

    /// Unprivileged user that runs the compile step, if set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_user: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            launcher: "systemd-nspawn".to_string(),
            shell: "/bin/bash".to_string(),
            binds: vec![],
            strategy: StrategyKind::Overlay,
            build_user: None,
        }
    }
}

/// Package build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Package revision number embedded in artifact names
    pub revision: u32,

    /// Remove working copies after each target
    pub clean: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            revision: 1,
            clean: true,
        }
    }
}

/// Distribution mirrors used when generating bootstrap trees
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorsConfig {
    pub debian: String,
    pub ubuntu: String,
    /// Fedora metalink base
    pub fedora: String,
    /// Arch Linux mirror serving `iso/` and the package repositories
    pub arch: String,
}

impl Default for MirrorsConfig {
    fn default() -> Self {
        Self {
            debian: "http://deb.debian.org/debian/".to_string(),
            ubuntu: "http://archive.ubuntu.com/ubuntu/".to_string(),
            fedora: "https://mirrors.fedoraproject.org/metalink".to_string(),
            arch: "https://geo.mirror.pkgbuild.com".to_string(),
        }
    }
}

/// Which projects a target accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    All,
    /// Only projects without a `setup.py`
    Binary,
    /// Only projects with a `setup.py`
    Python,
}

impl TargetKind {
    /// Whether a project of the given flavour is built for this target
    pub fn accepts(&self, is_python: bool) -> bool {
        match self {
            Self::All => true,
            Self::Binary => !is_python,
            Self::Python => is_python,
        }
    }
}

/// One distribution/release/architecture to build for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub distro: String,
    pub release: String,
    pub arch: String,
    #[serde(default)]
    pub kind: TargetKind,
}

impl TargetConfig {
    /// Create a target accepting every project flavour
    pub fn new(distro: impl Into<String>, release: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            distro: distro.into(),
            release: release.into(),
            arch: arch.into(),
            kind: TargetKind::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[sandbox]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sandbox.launcher, "systemd-nspawn");
        assert_eq!(config.sandbox.strategy, StrategyKind::Overlay);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn config_deserializes_targets() {
        let toml = r#"
            [sandbox]
            strategy = "copy"

            [[targets]]
            distro = "debian"
            release = "bookworm"
            arch = "amd64"

            [[targets]]
            distro = "fedora"
            release = "40"
            arch = "amd64"
            kind = "python"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.strategy, StrategyKind::Copy);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].kind, TargetKind::All);
        assert_eq!(config.targets[1].kind, TargetKind::Python);
        assert_eq!(config.build.revision, 1); // default preserved
    }

    #[test]
    fn target_kind_filters_projects() {
        assert!(TargetKind::All.accepts(true));
        assert!(TargetKind::Binary.accepts(false));
        assert!(!TargetKind::Binary.accepts(true));
        assert!(!TargetKind::Python.accepts(false));
    }
}
