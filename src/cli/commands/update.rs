//! Update command - upgrade the packages in cached environments

use super::{distinct_keys, drivers_for, environment_cache, executor, require_root, resolve_targets};
use crate::cache::CacheLock;
use crate::cli::args::TargetArgs;
use crate::config::{Config, ConfigManager};
use crate::error::{MultipackError, MultipackResult};
use crate::history::BuildHistory;
use crate::ui::{self, UiContext};
use serde_json::json;
use tracing::error;

/// Execute the update command
pub async fn execute(args: TargetArgs, config: &Config) -> MultipackResult<()> {
    require_root()?;
    let ctx = UiContext::detect();

    let targets = resolve_targets(config, &args.target)?;
    ConfigManager::ensure_work_dirs(config).await?;

    let resolved = distinct_keys(drivers_for(&targets, config, executor(config))?);
    let cache = environment_cache(config);
    let history = BuildHistory::new(config);

    ui::intro(&ctx, "Updating cached environments");
    let mut failures = 0;

    for target in resolved {
        let key = target.key();
        ui::section(&ctx, &key.to_string());

        let _lock = CacheLock::acquire_async(cache.layout().lock_path(&key)).await?;
        let result = cache.update_cache(&key, target.driver.as_ref()).await;

        match result {
            Ok(()) => ui::step_ok(&ctx, "Updated"),
            Err(ref e) => {
                error!("Updating {} failed: {}", key, e);
                ui::step_error(&ctx, &e.to_string());
                failures += 1;
            }
        }

        history
            .log(
                "cache.updated",
                &json!({ "target": key.to_string(), "ok": result.is_ok() }),
            )
            .await;
    }

    if failures > 0 {
        ui::outro_error(&ctx, &format!("{} update(s) failed", failures));
        Err(MultipackError::TargetsFailed(failures))
    } else {
        ui::outro_success(&ctx, "Caches are up to date");
        Ok(())
    }
}
