//! Project-local settings (`multipackager.toml` in the project directory)
//!
//! Declares locally built packages that must be installed into the sandbox
//! before the project is built, per target:
//!
//! ```toml
//! [preinstall."debian bookworm amd64"]
//! libfoo = "../libfoo/libfoo_*.deb"
//! ```
//!
//! The package name on the left is never installed from the distribution
//! repositories; the newest file matching the glob on the right is installed
//! instead.

use crate::error::{MultipackError, MultipackResult};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// File name looked up in the project directory
pub const PROJECT_CONFIG_FILE: &str = "multipackager.toml";

/// Local package files to install, keyed by target full name
pub type PreinstallMap = BTreeMap<String, Vec<PathBuf>>;

#[derive(Debug, Default, Deserialize)]
struct RawProjectConfig {
    #[serde(default)]
    preinstall: BTreeMap<String, BTreeMap<String, String>>,
}

/// Resolved project settings
#[derive(Debug, Clone, Default)]
pub struct ProjectSettings {
    preinstall: PreinstallMap,
    avoid: BTreeMap<String, BTreeSet<String>>,
}

impl ProjectSettings {
    /// Load `multipackager.toml` from the project directory, if present
    pub fn load(project_dir: &Path) -> MultipackResult<Self> {
        let path = project_dir.join(PROJECT_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| MultipackError::io(format!("reading {}", path.display()), e))?;
        let raw: RawProjectConfig =
            toml::from_str(&content).map_err(|e| MultipackError::ConfigInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let mut settings = Self::default();
        for (section, packages) in raw.preinstall {
            let target = normalize_target_name(&section);
            let mut files = Vec::new();
            let mut names = BTreeSet::new();

            for (name, pattern) in packages {
                let pattern = project_dir.join(pattern);
                match most_recent(&pattern.to_string_lossy()) {
                    Some(file) => {
                        debug!("Preinstall for {}: {} -> {}", target, name, file.display());
                        files.push(file);
                        names.insert(name);
                    }
                    None => warn!(
                        "No file matches {} for preinstalled package {}",
                        pattern.display(),
                        name
                    ),
                }
            }

            if !files.is_empty() {
                settings.preinstall.insert(target.clone(), files);
                settings.avoid.insert(target, names);
            }
        }

        Ok(settings)
    }

    /// All resolved preinstalled packages
    pub fn preinstalled(&self) -> &PreinstallMap {
        &self.preinstall
    }

    /// Local package files for one target
    pub fn packages_for(&self, full_name: &str) -> &[PathBuf] {
        self.preinstall
            .get(full_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Package names that must not come from the distribution repositories
    pub fn avoid_for(&self, full_name: &str) -> BTreeSet<String> {
        self.avoid.get(full_name).cloned().unwrap_or_default()
    }
}

/// Collapse runs of whitespace so `"debian  sid amd64"` matches `"debian sid amd64"`
fn normalize_target_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Newest regular file matching a glob pattern
fn most_recent(pattern: &str) -> Option<PathBuf> {
    let entries = glob::glob(pattern).ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for path in entries.flatten() {
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.file_type().is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    newest.map(|(_, path)| path)
}
