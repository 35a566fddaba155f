//! Per-target build pipeline
//!
//! A target moves through
//!
//! ```text
//! Init → CacheReady → WorkingCopyReady → SourceInjected →
//! DependenciesInstalled → Built → ArtifactStaged → Packaged → Cleaned
//! ```
//!
//! or stops in `Failed`. The working copy is owned by the run and removed
//! on every exit path unless the caller asked to keep it.

pub mod detect;
pub mod report;

pub use detect::BuildSystem;
pub use report::BuildReport;

use crate::cache::{CacheKey, CacheLock, EnvironmentCache};
use crate::config::ProjectSettings;
use crate::distro::{DistroDriver, PackageName};
use crate::error::{MultipackError, MultipackResult};
use crate::overlay::WorkingEnvironment;
use crate::sandbox::{host, ChrootExecutor, Sandbox, SandboxCommand, INSTALL_ROOT, PROJECT_DIR};
use std::fmt;
use std::fs;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Where local packages are copied inside the sandbox before installing
const PREINSTALL_DIR: &str = "/multipackager_preinstall";

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    CacheReady,
    WorkingCopyReady,
    SourceInjected,
    DependenciesInstalled,
    Built,
    ArtifactStaged,
    Packaged,
    Cleaned,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CacheReady => "cache_ready",
            Self::WorkingCopyReady => "working_copy_ready",
            Self::SourceInjected => "source_injected",
            Self::DependenciesInstalled => "dependencies_installed",
            Self::Built => "built",
            Self::ArtifactStaged => "artifact_staged",
            Self::Packaged => "packaged",
            Self::Cleaned => "cleaned",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One project built for one distribution/release/architecture
#[derive(Clone)]
pub struct BuildTarget {
    project: PathBuf,
    driver: Arc<dyn DistroDriver>,
    key: CacheKey,
}

impl BuildTarget {
    pub fn new(project: impl Into<PathBuf>, driver: Arc<dyn DistroDriver>) -> Self {
        let key = CacheKey::for_driver(driver.as_ref());
        Self {
            project: project.into(),
            driver,
            key,
        }
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn driver(&self) -> &dyn DistroDriver {
        self.driver.as_ref()
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn full_name(&self) -> String {
        self.driver.full_name()
    }
}

impl fmt::Debug for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildTarget")
            .field("project", &self.project)
            .field("key", &self.key)
            .finish()
    }
}

/// Result of running one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Built { target: String, package: String },
    /// The artifact already exists in the output directory
    Skipped { target: String, package: String },
    Failed {
        target: String,
        stage: Stage,
        reason: String,
    },
}

impl TargetOutcome {
    pub fn target(&self) -> &str {
        match self {
            Self::Built { target, .. } | Self::Skipped { target, .. } | Self::Failed { target, .. } => {
                target
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Caller-selected knobs of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Where finished packages are moved
    pub output_dir: PathBuf,
    /// Remove the working copy when the target ends
    pub clean: bool,
    /// Run the compile step as this user
    pub build_user: Option<String>,
    /// Serialize on the cache key's lock file
    pub lock: bool,
}

impl PipelineOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            clean: true,
            build_user: None,
            lock: true,
        }
    }
}

/// Drives build targets through the stages against a shared cache
pub struct BuildPipeline {
    cache: Arc<EnvironmentCache>,
    executor: Arc<dyn ChrootExecutor>,
    options: PipelineOptions,
}

/// Stage bookkeeping for one run; `Failed` is absorbing
struct Progress {
    target: String,
    stage: Stage,
}

impl Progress {
    fn advance(&mut self, next: Stage) {
        if self.stage == Stage::Failed {
            return;
        }
        debug!("{}: {} -> {}", self.target, self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, error: MultipackError) -> TargetOutcome {
        let stage = self.stage;
        self.stage = Stage::Failed;
        error!("{} failed after {}: {}", self.target, stage, error);
        TargetOutcome::Failed {
            target: self.target.clone(),
            stage,
            reason: error.to_string(),
        }
    }
}

impl BuildPipeline {
    pub fn new(
        cache: Arc<EnvironmentCache>,
        executor: Arc<dyn ChrootExecutor>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            cache,
            executor,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run one target end to end; failures are reported, never returned
    pub async fn run(&self, target: &BuildTarget, settings: &ProjectSettings) -> TargetOutcome {
        let mut progress = Progress {
            target: target.full_name(),
            stage: Stage::Init,
        };
        info!("Building {} for {}", target.project().display(), progress.target);

        let expected = match target.driver().package_name(target.project()) {
            PackageName::Named(name) => Some(name),
            PackageName::Deferred => None,
            PackageName::Unknown => {
                return progress.fail(MultipackError::Packaging {
                    distro: progress.target.clone(),
                    reason: "cannot determine the package name".to_string(),
                });
            }
        };
        if let Some(ref name) = expected {
            if self.options.output_dir.join(name).exists() {
                info!("{} already exists, skipping {}", name, progress.target);
                return TargetOutcome::Skipped {
                    target: progress.target,
                    package: name.clone(),
                };
            }
        }

        let _lock = if self.options.lock {
            match CacheLock::acquire_async(self.cache.layout().lock_path(target.key())).await {
                Ok(lock) => Some(lock),
                Err(e) => return progress.fail(e),
            }
        } else {
            None
        };

        if let Err(e) = self.cache.prepare(target.key(), target.driver()).await {
            return progress.fail(e);
        }
        progress.advance(Stage::CacheReady);

        let dest = self.cache.layout().working_path(target.key());
        let mut env = match self.cache.working_copy(target.key(), &dest).await {
            Ok(env) => env,
            Err(e) => return progress.fail(e),
        };
        if !self.options.clean {
            env.keep();
        }
        progress.advance(Stage::WorkingCopyReady);

        let outcome = match self.build_in(&env, target, settings, &mut progress).await {
            Ok(package) => TargetOutcome::Built {
                target: progress.target.clone(),
                package,
            },
            Err(e) => progress.fail(e),
        };

        if self.options.clean {
            env.destroy();
        } else {
            info!("Keeping working copy {}", env.root().display());
        }
        progress.advance(Stage::Cleaned);
        outcome
    }

    async fn build_in(
        &self,
        env: &WorkingEnvironment,
        target: &BuildTarget,
        settings: &ProjectSettings,
        progress: &mut Progress,
    ) -> MultipackResult<String> {
        let driver = target.driver();
        let sandbox = Sandbox::new(
            env.root(),
            driver.arch().personality(),
            Arc::clone(&self.executor),
        );

        inject_sources(&sandbox, target.project()).await?;
        progress.advance(Stage::SourceInjected);

        let full_name = target.full_name();
        driver
            .install_dependencies(
                &sandbox,
                target.project(),
                &settings.avoid_for(&full_name),
                settings.preinstalled(),
            )
            .await?;
        driver
            .install_postdependencies(&sandbox, target.project())
            .await?;
        for package in settings.packages_for(&full_name) {
            install_local(&sandbox, driver, package).await?;
        }
        progress.advance(Stage::DependenciesInstalled);

        let staged_project = sandbox.host_path(PROJECT_DIR);
        let system = BuildSystem::detect(&staged_project, driver.distro())?;
        info!("Building with {}", system);
        match system.script() {
            None => driver.build_python(&sandbox).await?,
            Some(script) => {
                if let Some(dir) = system.build_dir() {
                    let path = staged_project.join(dir);
                    host::remove_tree(&path).await?;
                    create_dir(&path)?;
                }
                if let Some(ref user) = self.options.build_user {
                    sandbox
                        .run(
                            &SandboxCommand::new("chown")
                                .arg("-R")
                                .arg(user.as_str())
                                .args([PROJECT_DIR, INSTALL_ROOT]),
                        )
                        .await?;
                }
                sandbox
                    .run_as(&script.into_command(), self.options.build_user.as_deref())
                    .await?;
            }
        }
        progress.advance(Stage::Built);

        let root = sandbox.root().to_path_buf();
        tokio::task::spawn_blocking(move || fix_staged_permissions(&root))
            .await
            .map_err(|e| MultipackError::Internal(format!("permission fixup failed: {}", e)))??;
        progress.advance(Stage::ArtifactStaged);

        let package = driver
            .build_package(&sandbox, target.project(), &self.options.output_dir)
            .await?;
        progress.advance(Stage::Packaged);
        Ok(package)
    }
}

fn create_dir(path: &Path) -> MultipackResult<()> {
    fs::create_dir_all(path)
        .map_err(|e| MultipackError::io(format!("creating {}", path.display()), e))
}

/// Copy the project to `/project` and create an empty `/install_root`
async fn inject_sources(sandbox: &Sandbox, project: &Path) -> MultipackResult<()> {
    let staged = sandbox.host_path(PROJECT_DIR);
    host::remove_tree(&staged).await?;
    host::copy_tree(project, &staged)
        .await
        .map_err(|e| MultipackError::SourceCopy(e.to_string()))?;

    let install_root = sandbox.host_path(INSTALL_ROOT);
    host::remove_tree(&install_root).await?;
    create_dir(&install_root)
}

/// Copy a pre-built package into the sandbox and install it
async fn install_local(
    sandbox: &Sandbox,
    driver: &dyn DistroDriver,
    package: &Path,
) -> MultipackResult<()> {
    let file_name = package
        .file_name()
        .ok_or_else(|| MultipackError::PathNotFound(package.to_path_buf()))?
        .to_string_lossy()
        .into_owned();
    let dir = sandbox.host_path(PREINSTALL_DIR);
    create_dir(&dir)?;
    tokio::fs::copy(package, dir.join(&file_name))
        .await
        .map_err(|e| MultipackError::copy(package, dir.join(&file_name), e.to_string()))?;

    info!("Installing package {}", package.display());
    driver
        .install_local_package(sandbox, &format!("{}/{}", PREINSTALL_DIR, file_name))
        .await
}

/// Give staged directories that also exist in the sandbox the sandbox's
/// mode and ownership, so packaging `/install_root/usr` does not change
/// the installed system's `/usr`
pub fn fix_staged_permissions(sandbox_root: &Path) -> MultipackResult<()> {
    let staging = sandbox_root.join(INSTALL_ROOT.trim_start_matches('/'));
    let mut fixed = 0usize;

    for entry in WalkDir::new(&staging).min_depth(1) {
        let entry = entry.map_err(|e| MultipackError::Internal(e.to_string()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&staging) else {
            continue;
        };
        // DEBIAN/ and friends have no counterpart
        let Some(meta) = sandbox_dir_metadata(sandbox_root, rel) else {
            continue;
        };

        if let Err(e) = chown(entry.path(), Some(meta.uid()), Some(meta.gid())) {
            warn!("Cannot chown {}: {}", entry.path().display(), e);
        }
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| MultipackError::io(format!("chmod {}", entry.path().display()), e))?;
        fixed += 1;
    }

    debug!("Fixed permissions of {} staged directories", fixed);
    Ok(())
}

/// Metadata of the directory at `rel` inside the sandbox, or `None` when
/// it is missing, not a directory, or reached through a symlink (whose
/// target would resolve against the host)
fn sandbox_dir_metadata(sandbox_root: &Path, rel: &Path) -> Option<fs::Metadata> {
    let mut path = sandbox_root.to_path_buf();
    let mut meta = None;
    for component in rel.components() {
        path.push(component);
        let m = fs::symlink_metadata(&path).ok()?;
        if !m.is_dir() {
            return None;
        }
        meta = Some(m);
    }
    meta
}
