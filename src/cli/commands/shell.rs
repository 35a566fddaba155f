//! Shell command - interactive shell inside an environment folder
//!
//! `shell <dir> <arch>` enters an existing folder. `shell <dir> <distro>
//! <release> <arch>` first fills a missing folder with a full copy of the
//! build tier, so the folder outlives both the shell and the overlay mounts
//! used by builds.

use super::{drivers_for, environment_cache, executor, require_root};
use crate::cache::CacheLock;
use crate::cli::args::ShellArgs;
use crate::config::{Config, ConfigManager, TargetConfig};
use crate::distro::Architecture;
use crate::error::{MultipackError, MultipackResult};
use crate::overlay::WorkingEnvironment;
use crate::sandbox::{host, ChrootExecutor, Personality};
use crate::ui::{self, TaskSpinner, UiContext};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Execute the shell command
pub async fn execute(args: ShellArgs, config: &Config) -> MultipackResult<()> {
    require_root()?;
    let ctx = UiContext::detect();
    let executor = executor(config);

    let personality = match args.target.as_slice() {
        [arch] => {
            if !args.dir.is_dir() {
                return Err(MultipackError::PathNotFound(args.dir.clone()));
            }
            arch.parse::<Architecture>()?.personality()
        }
        [distro, release, arch] => {
            let target = TargetConfig::new(distro.as_str(), release.as_str(), arch.as_str());
            populate(&ctx, &args.dir, target, config, Arc::clone(&executor)).await?
        }
        other => return Err(MultipackError::InvalidTarget(other.join(" "))),
    };

    let env = WorkingEnvironment::existing(&args.dir);
    ui::step_info(&ctx, &format!("Launched shell at {}", env.root().display()));

    let code = executor
        .interactive(
            env.root(),
            personality,
            &config.sandbox.binds,
            &config.sandbox.shell,
        )
        .await?;
    debug!("Shell exited with code {}", code);
    Ok(())
}

/// Copy the build tier into `dir` unless it already exists
async fn populate(
    ctx: &UiContext,
    dir: &Path,
    target: TargetConfig,
    config: &Config,
    executor: Arc<dyn ChrootExecutor>,
) -> MultipackResult<Personality> {
    let resolved = drivers_for(std::slice::from_ref(&target), config, executor)?
        .into_iter()
        .next()
        .ok_or_else(|| MultipackError::InvalidTarget(target.distro.clone()))?;
    let personality = resolved.driver.arch().personality();

    if dir.exists() {
        ui::remark(ctx, "The folder exists; launching the shell without copying data");
        return Ok(personality);
    }

    ConfigManager::ensure_work_dirs(config).await?;
    let cache = environment_cache(config);
    let key = resolved.key();
    let _lock = CacheLock::acquire_async(cache.layout().lock_path(&key)).await?;
    let template = cache.prepare(&key, resolved.driver.as_ref()).await?;

    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!("Copying {} to {}...", key, dir.display()));
    if let Err(e) = host::copy_tree(&template, dir).await {
        spinner.stop_error("Copy failed");
        host::remove_tree(dir).await?;
        return Err(e);
    }
    spinner.stop(&format!("Environment ready at {}", dir.display()));
    info!("Populated {} from {}", dir.display(), template.display());

    Ok(personality)
}
