//! Distribution drivers
//!
//! Everything that depends on the package format lives behind
//! [`DistroDriver`]: creating a bootstrap root, updating it, reading the
//! project's packaging metadata, installing build dependencies and turning
//! the staged install tree into a package.

pub mod arch;
pub mod debian;
pub mod fedora;

pub use crate::config::project::PreinstallMap;
pub use arch::ArchDriver;
pub use debian::DebianDriver;
pub use fedora::FedoraDriver;

use crate::config::Config;
use crate::error::{MultipackError, MultipackResult};
use crate::sandbox::{ChrootExecutor, Personality, Sandbox};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Supported distribution families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DistroType {
    Debian,
    Ubuntu,
    Fedora,
    Arch,
}

impl DistroType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
            Self::Fedora => "fedora",
            Self::Arch => "arch",
        }
    }
}

impl FromStr for DistroType {
    type Err = MultipackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debian" => Ok(Self::Debian),
            "ubuntu" => Ok(Self::Ubuntu),
            "fedora" => Ok(Self::Fedora),
            "arch" => Ok(Self::Arch),
            _ => Err(MultipackError::UnknownDistro(s.to_string())),
        }
    }
}

impl fmt::Display for DistroType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    I386,
    Amd64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::I386 => "i386",
            Self::Amd64 => "amd64",
        }
    }

    /// Name the distribution's own tooling uses for this architecture
    pub fn name_for(&self, distro: DistroType) -> &'static str {
        match (distro, self) {
            (DistroType::Fedora | DistroType::Arch, Self::Amd64) => "x86_64",
            (DistroType::Arch, Self::I386) => "i686",
            _ => self.as_str(),
        }
    }

    pub fn personality(&self) -> Personality {
        match self {
            Self::I386 => Personality::X86,
            Self::Amd64 => Personality::X86_64,
        }
    }
}

impl FromStr for Architecture {
    type Err = MultipackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i386" => Ok(Self::I386),
            "amd64" | "x86_64" => Ok(Self::Amd64),
            _ => Err(MultipackError::UnsupportedArchitecture(s.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact name a driver predicts for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageName {
    /// Known before building
    Named(String),
    /// Only known once the package has been built
    Deferred,
    /// Packaging metadata is missing or unreadable
    Unknown,
}

/// Per-distribution capabilities used by the cache and the build pipeline
#[async_trait]
pub trait DistroDriver: Send + Sync {
    fn distro(&self) -> DistroType;

    fn release(&self) -> &str;

    fn arch(&self) -> Architecture;

    /// `"<distro> <release> <arch>"`, the key used by project-local settings
    fn full_name(&self) -> String {
        format!("{} {} {}", self.distro(), self.release(), self.arch())
    }

    /// Create a bootstrap root at `root`, which exists and is empty
    async fn generate(&self, root: &Path) -> MultipackResult<()>;

    /// Bring the packages installed in `root` up to date
    async fn update(&self, root: &Path) -> MultipackResult<()>;

    /// Predict the artifact file name for a project
    fn package_name(&self, project: &Path) -> PackageName;

    /// Install the project's build dependencies, skipping `avoid`
    async fn install_dependencies(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        avoid: &BTreeSet<String>,
        preinstalled: &PreinstallMap,
    ) -> MultipackResult<()>;

    /// Extra setup once dependencies are in place
    async fn install_postdependencies(
        &self,
        _sandbox: &Sandbox,
        _project: &Path,
    ) -> MultipackResult<()> {
        Ok(())
    }

    /// Install a package file already copied into the sandbox
    async fn install_local_package(&self, sandbox: &Sandbox, package: &str)
        -> MultipackResult<()>;

    /// Build a Python project with the distribution's setuptools integration
    async fn build_python(&self, sandbox: &Sandbox) -> MultipackResult<()>;

    /// Package the staged tree and move the artifact into `output_dir`,
    /// returning its file name
    async fn build_package(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        output_dir: &Path,
    ) -> MultipackResult<String>;

    /// Drop driver-owned caches outside the sandbox trees
    async fn clear_cache(&self) -> MultipackResult<()> {
        Ok(())
    }
}

/// Build the driver for one distribution/release/architecture
pub fn create_driver(
    distro: DistroType,
    release: &str,
    arch: Architecture,
    config: &Config,
    executor: Arc<dyn ChrootExecutor>,
) -> Arc<dyn DistroDriver> {
    match distro {
        DistroType::Debian | DistroType::Ubuntu => Arc::new(DebianDriver::new(
            distro, release, arch, config, executor,
        )),
        DistroType::Fedora => Arc::new(FedoraDriver::new(release, arch, config, executor)),
        DistroType::Arch => Arc::new(ArchDriver::new(release, arch, config, executor)),
    }
}

/// Drop packages the project provides itself, keeping order
pub(crate) fn without_avoided(deps: Vec<String>, avoid: &BTreeSet<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    deps.into_iter()
        .filter(|d| !d.is_empty() && !avoid.contains(d) && seen.insert(d.clone()))
        .collect()
}

/// First existing directory among `candidates` under `project`
pub(crate) fn find_metadata_dir(project: &Path, candidates: &[&str]) -> Option<std::path::PathBuf> {
    candidates
        .iter()
        .map(|c| project.join(c))
        .find(|p| p.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_distro_types() {
        assert_eq!("debian".parse::<DistroType>().unwrap(), DistroType::Debian);
        assert_eq!("Ubuntu".parse::<DistroType>().unwrap(), DistroType::Ubuntu);
        assert_eq!("arch".parse::<DistroType>().unwrap(), DistroType::Arch);
        assert!(matches!(
            "gentoo".parse::<DistroType>(),
            Err(MultipackError::UnknownDistro(_))
        ));
    }

    #[test]
    fn parses_architectures() {
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::Amd64);
        assert_eq!("i386".parse::<Architecture>().unwrap(), Architecture::I386);
        assert!("arm64".parse::<Architecture>().is_err());
    }

    #[test]
    fn fedora_names_amd64_differently() {
        assert_eq!(Architecture::Amd64.name_for(DistroType::Fedora), "x86_64");
        assert_eq!(Architecture::Amd64.name_for(DistroType::Debian), "amd64");
        assert_eq!(Architecture::I386.name_for(DistroType::Fedora), "i386");
        assert_eq!(Architecture::I386.name_for(DistroType::Arch), "i686");
        assert_eq!(Architecture::Amd64.name_for(DistroType::Arch), "x86_64");
    }

    #[test]
    fn personality_follows_architecture() {
        assert_eq!(Architecture::I386.personality(), Personality::X86);
        assert_eq!(Architecture::Amd64.personality(), Personality::X86_64);
    }

    #[test]
    fn avoided_packages_are_filtered() {
        let avoid: BTreeSet<String> = ["libfoo-dev".to_string()].into();
        let deps = vec![
            "gcc".to_string(),
            "libfoo-dev".to_string(),
            "gcc".to_string(),
            String::new(),
            "make".to_string(),
        ];
        assert_eq!(without_avoided(deps, &avoid), vec!["gcc", "make"]);
    }
}
