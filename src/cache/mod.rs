//! Two-tier sandbox cache
//!
//! Every (distribution, release, architecture) owns two trees under the
//! cache root:
//!
//! | Tier | Path | Contents |
//! |------|------|----------|
//! | Bootstrap | `<cache>/<distro>_chroot_<release>_<arch>` | Pristine tree from the driver's `generate` |
//! | Build | `<bootstrap>_<tag>` (tag defaults to `builder`) | Copy of bootstrap that builds start from |
//!
//! Both tiers are created through a `.tmp` sibling and renamed into place,
//! so a half-generated tree is never mistaken for a cache. After creation
//! they are only ever mutated inside a transaction.

pub mod lock;

pub use lock::CacheLock;

use crate::config::Config;
use crate::distro::{Architecture, DistroDriver, DistroType};
use crate::error::{MultipackError, MultipackResult};
use crate::overlay::transaction::{remove_leftovers, sibling};
use crate::overlay::{mutation, TransactionStrategy, WorkingEnvironment};
use crate::sandbox::host;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Purpose tag of the build tier when none is given
pub const DEFAULT_PURPOSE_TAG: &str = "builder";

const RESOLV_CONF: &str = "# OpenDNS IPv4 nameservers\n\
nameserver 208.67.222.222\n\
nameserver 208.67.220.220\n\
# OpenDNS IPv6 nameservers\n\
nameserver 2620:0:ccc::2\n\
nameserver 2620:0:ccd::2\n";

/// Identity of a pair of cache tiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub distro: DistroType,
    pub release: String,
    pub arch: Architecture,
    pub purpose_tag: Option<String>,
}

impl CacheKey {
    pub fn new(distro: DistroType, release: impl Into<String>, arch: Architecture) -> Self {
        Self {
            distro,
            release: release.into(),
            arch,
            purpose_tag: None,
        }
    }

    /// Key matching a driver's distribution, release and architecture
    pub fn for_driver(driver: &dyn DistroDriver) -> Self {
        Self::new(driver.distro(), driver.release(), driver.arch())
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.purpose_tag = Some(tag.into());
        self
    }

    /// `<distro>_chroot_<release>_<arch>`
    pub fn bootstrap_name(&self) -> String {
        format!(
            "{}_chroot_{}_{}",
            self.distro,
            self.release,
            self.arch.name_for(self.distro)
        )
    }

    /// `<bootstrap name>_<purpose tag>`
    pub fn build_name(&self) -> String {
        format!(
            "{}_{}",
            self.bootstrap_name(),
            self.purpose_tag.as_deref().unwrap_or(DEFAULT_PURPOSE_TAG)
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.distro, self.release, self.arch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Bootstrap,
    Build,
}

/// Cache and working roots; every derived path is a pure function of these
/// and a [`CacheKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    cache_root: PathBuf,
    working_root: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: impl Into<PathBuf>, working_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            working_root: working_root.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.paths.cache, &config.paths.working)
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn working_root(&self) -> &Path {
        &self.working_root
    }

    pub fn tier_path(&self, key: &CacheKey, tier: CacheTier) -> PathBuf {
        match tier {
            CacheTier::Bootstrap => self.cache_root.join(key.bootstrap_name()),
            CacheTier::Build => self.cache_root.join(key.build_name()),
        }
    }

    /// Where the working copy for one build of `key` is created
    pub fn working_path(&self, key: &CacheKey) -> PathBuf {
        self.working_root.join(key.build_name())
    }

    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        CacheLock::path_for(&self.cache_root, &key.bootstrap_name())
    }
}

/// Owner of the bootstrap and build tiers
pub struct EnvironmentCache {
    layout: CacheLayout,
    strategy: Arc<dyn TransactionStrategy>,
}

impl EnvironmentCache {
    pub fn new(layout: CacheLayout, strategy: Arc<dyn TransactionStrategy>) -> Self {
        Self { layout, strategy }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn strategy(&self) -> &Arc<dyn TransactionStrategy> {
        &self.strategy
    }

    /// Create the bootstrap tier with the driver if it does not exist yet
    pub async fn ensure_bootstrap(
        &self,
        key: &CacheKey,
        driver: &dyn DistroDriver,
    ) -> MultipackResult<PathBuf> {
        let path = self.layout.tier_path(key, CacheTier::Bootstrap);
        if path.exists() {
            debug!("Bootstrap tier {} present", path.display());
            return Ok(path);
        }

        info!("Generating the environment for {}", key.bootstrap_name());
        self.create_cache_root()?;
        let tmp = sibling(&path, ".tmp");
        host::remove_tree(&tmp).await?;
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(|e| MultipackError::io(format!("creating {}", tmp.display()), e))?;

        let generated = async {
            driver.generate(&tmp).await?;
            configure_resolver(&tmp).await?;
            host::sync();
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| MultipackError::io(format!("renaming {}", tmp.display()), e))
        }
        .await;

        if let Err(e) = generated {
            host::remove_tree(&tmp).await?;
            return Err(MultipackError::GenerationFailure {
                name: key.bootstrap_name(),
                reason: e.to_string(),
            });
        }

        host::sync();
        Ok(path)
    }

    /// Create the build tier as a full copy of the bootstrap tier
    pub async fn ensure_build_cache(
        &self,
        key: &CacheKey,
        driver: &dyn DistroDriver,
    ) -> MultipackResult<PathBuf> {
        let bootstrap = self.ensure_bootstrap(key, driver).await?;
        let path = self.layout.tier_path(key, CacheTier::Build);
        if path.exists() {
            debug!("Build tier {} present", path.display());
            return Ok(path);
        }

        info!("Creating build cache {}", key.build_name());
        let tmp = sibling(&path, ".tmp");
        host::remove_tree(&tmp).await?;

        if let Err(e) = host::copy_tree(&bootstrap, &tmp).await {
            host::remove_tree(&tmp).await?;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MultipackError::copy(&bootstrap, &path, e.to_string()))?;

        host::sync();
        Ok(path)
    }

    /// Remove both tiers and any transaction leftovers beside them;
    /// removing absent tiers succeeds
    pub async fn clear_cache(
        &self,
        key: &CacheKey,
        driver: &dyn DistroDriver,
    ) -> MultipackResult<()> {
        for tier in [CacheTier::Build, CacheTier::Bootstrap] {
            let path = self.layout.tier_path(key, tier);
            info!("Removing {}", path.display());
            let leftovers = path.clone();
            tokio::task::spawn_blocking(move || remove_leftovers(&leftovers))
                .await
                .map_err(|e| MultipackError::Internal(format!("cleanup task failed: {}", e)))?;
            host::remove_tree(&path).await?;
            host::remove_tree(&sibling(&path, ".tmp")).await?;
        }
        driver.clear_cache().await?;
        host::sync();
        Ok(())
    }

    /// Update both tiers with the driver, each in its own transaction
    pub async fn update_cache(
        &self,
        key: &CacheKey,
        driver: &dyn DistroDriver,
    ) -> MultipackResult<()> {
        self.ensure_build_cache(key, driver).await?;

        for tier in [CacheTier::Bootstrap, CacheTier::Build] {
            let path = self.layout.tier_path(key, tier);
            info!("Updating {} ({})", path.display(), self.strategy.name());
            let outcome = self
                .strategy
                .transact(
                    &path,
                    mutation(move |view| async move { driver.update(&view).await }),
                )
                .await;
            outcome.into_result(&path)?;
        }
        Ok(())
    }

    /// Ensure both tiers and return the build tier path
    pub async fn prepare(
        &self,
        key: &CacheKey,
        driver: &dyn DistroDriver,
    ) -> MultipackResult<PathBuf> {
        self.ensure_build_cache(key, driver).await
    }

    /// Disposable working copy of the build tier at `dest`
    pub async fn working_copy(
        &self,
        key: &CacheKey,
        dest: &Path,
    ) -> MultipackResult<WorkingEnvironment> {
        let template = self.layout.tier_path(key, CacheTier::Build);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MultipackError::io(format!("creating {}", parent.display()), e))?;
        }
        self.strategy.working_copy(&template, dest).await
    }

    fn create_cache_root(&self) -> MultipackResult<()> {
        std::fs::create_dir_all(&self.layout.cache_root).map_err(|e| {
            MultipackError::io(format!("creating {}", self.layout.cache_root.display()), e)
        })
    }
}

/// Point the tree at public resolvers so package managers work inside it
async fn configure_resolver(root: &Path) -> MultipackResult<()> {
    let etc = root.join("etc");
    let resolv = etc.join("resolv.conf");
    tokio::fs::create_dir_all(&etc)
        .await
        .map_err(|e| MultipackError::io(format!("creating {}", etc.display()), e))?;

    // may be a symlink into the host's /run
    match tokio::fs::remove_file(&resolv).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(MultipackError::io(format!("removing {}", resolv.display()), e)),
    }
    tokio::fs::write(&resolv, RESOLV_CONF)
        .await
        .map_err(|e| MultipackError::io(format!("writing {}", resolv.display()), e))
}
