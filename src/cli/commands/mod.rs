//! CLI command implementations

pub mod build;
pub mod clear_cache;
pub mod completions;
pub mod config;
pub mod shell;
pub mod update;

pub use build::execute as build;
pub use clear_cache::execute as clear_cache;
pub use completions::execute as completions;
pub use config::execute as config;
pub use shell::execute as shell;
pub use update::execute as update;

use crate::cache::{CacheKey, CacheLayout, EnvironmentCache};
use crate::config::{Config, TargetConfig, TargetKind};
use crate::distro::{create_driver, Architecture, DistroDriver, DistroType};
use crate::error::{MultipackError, MultipackResult};
use crate::overlay::create_strategy;
use crate::sandbox::{ChrootExecutor, NspawnExecutor};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A configured target with its driver
pub struct ResolvedTarget {
    pub driver: Arc<dyn DistroDriver>,
    pub kind: TargetKind,
}

impl ResolvedTarget {
    pub fn key(&self) -> CacheKey {
        CacheKey::for_driver(self.driver.as_ref())
    }
}

/// Chroots, mounts and package managers all need root
pub fn require_root() -> MultipackResult<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(MultipackError::NotRoot)
    }
}

/// The single target given on the command line, or every configured one
pub fn resolve_targets(config: &Config, args: &[String]) -> MultipackResult<Vec<TargetConfig>> {
    match args {
        [] if config.targets.is_empty() => Err(MultipackError::NoTargets),
        [] => Ok(config.targets.clone()),
        [distro, release, arch] => Ok(vec![TargetConfig::new(
            distro.as_str(),
            release.as_str(),
            arch.as_str(),
        )]),
        other => Err(MultipackError::InvalidTarget(other.join(" "))),
    }
}

/// Build a driver for every target; an unknown distribution or architecture fails the command
pub fn drivers_for(
    targets: &[TargetConfig],
    config: &Config,
    executor: Arc<dyn ChrootExecutor>,
) -> MultipackResult<Vec<ResolvedTarget>> {
    targets
        .iter()
        .map(|t| {
            let distro: DistroType = t.distro.parse()?;
            let arch: Architecture = t.arch.parse()?;
            Ok(ResolvedTarget {
                driver: create_driver(distro, &t.release, arch, config, Arc::clone(&executor)),
                kind: t.kind,
            })
        })
        .collect()
}

/// Keep the first target of every cache key
pub fn distinct_keys(targets: Vec<ResolvedTarget>) -> Vec<ResolvedTarget> {
    let mut seen = BTreeSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert(t.key()))
        .collect()
}

pub fn executor(config: &Config) -> Arc<dyn ChrootExecutor> {
    Arc::new(NspawnExecutor::from_config(&config.sandbox))
}

pub fn environment_cache(config: &Config) -> Arc<EnvironmentCache> {
    Arc::new(EnvironmentCache::new(
        CacheLayout::from_config(config),
        create_strategy(config.sandbox.strategy),
    ))
}
