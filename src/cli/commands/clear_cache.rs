//! Clear-cache command - remove cached environments

use super::{distinct_keys, drivers_for, environment_cache, executor, require_root, resolve_targets};
use crate::cache::CacheLock;
use crate::cli::args::ClearCacheArgs;
use crate::config::Config;
use crate::error::MultipackResult;
use crate::history::BuildHistory;
use crate::ui::{self, TaskSpinner, UiContext};
use serde_json::json;

/// Execute the clear-cache command
pub async fn execute(args: ClearCacheArgs, config: &Config) -> MultipackResult<()> {
    require_root()?;
    let ctx = UiContext::detect().with_auto_yes(args.yes);

    let targets = resolve_targets(config, &args.target.target)?;
    let resolved = distinct_keys(drivers_for(&targets, config, executor(config))?);

    let names: Vec<String> = resolved.iter().map(|t| t.key().to_string()).collect();
    ui::intro(&ctx, "Clearing cached environments");
    for name in &names {
        ui::remark(&ctx, name);
    }

    let question = format!("Remove {} cached environment(s)?", names.len());
    if !ui::confirm(&ctx, &question, true).await? {
        ui::step_warn(&ctx, "Nothing removed");
        return Ok(());
    }

    let cache = environment_cache(config);
    let history = BuildHistory::new(config);

    for target in resolved {
        let key = target.key();
        let _lock = CacheLock::acquire_async(cache.layout().lock_path(&key)).await?;

        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start(&format!("Removing {}...", key));
        match cache.clear_cache(&key, target.driver.as_ref()).await {
            Ok(()) => spinner.stop(&format!("Removed {}", key)),
            Err(e) => {
                spinner.stop_error(&format!("Removing {} failed", key));
                return Err(e);
            }
        }

        history
            .log("cache.cleared", &json!({ "target": key.to_string() }))
            .await;
    }

    ui::outro_success(&ctx, "Cache cleared");
    Ok(())
}
