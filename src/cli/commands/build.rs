//! Build command - package a project for every target

use super::{drivers_for, environment_cache, executor, require_root, resolve_targets};
use crate::cli::args::BuildArgs;
use crate::config::{Config, ConfigManager, ProjectSettings};
use crate::error::{MultipackError, MultipackResult};
use crate::history::BuildHistory;
use crate::pipeline::{BuildPipeline, BuildReport, BuildTarget, PipelineOptions, TargetOutcome};
use crate::ui::{self, UiContext};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> MultipackResult<()> {
    require_root()?;
    let ctx = UiContext::detect();

    let project = project_dir(&args.project)?;
    let output_dir = output_dir(args.output.as_deref()).await?;

    let mut config = config.clone();
    if let Some(revision) = args.revision {
        config.build.revision = revision;
    }

    let settings = ProjectSettings::load(&project)?;
    let targets = resolve_targets(&config, &args.target)?;
    ConfigManager::ensure_work_dirs(&config).await?;

    let executor = executor(&config);
    let resolved = drivers_for(&targets, &config, executor.clone())?;

    let mut options = PipelineOptions::new(&output_dir);
    options.clean = config.build.clean && !args.noclean;
    options.build_user = config.sandbox.build_user.clone();
    let pipeline = BuildPipeline::new(environment_cache(&config), executor, options);

    let history = BuildHistory::new(&config);
    let is_python = project.join("setup.py").exists();
    info!(
        "Packaging {} into {} (run {})",
        project.display(),
        output_dir.display(),
        history.run_id()
    );

    ui::intro(&ctx, &format!("Packaging {}", project.display()));
    let mut report = BuildReport::new();

    for target in resolved {
        let name = target.driver.full_name();
        if !target.kind.accepts(is_python) {
            debug!("{} does not accept this project ({:?})", name, target.kind);
            continue;
        }

        ui::section(&ctx, &name);
        let build = BuildTarget::new(&project, target.driver);
        let outcome = pipeline.run(&build, &settings).await;

        match &outcome {
            TargetOutcome::Built { package, .. } => ui::step_ok_detail(&ctx, "Built", package),
            TargetOutcome::Skipped { package, .. } => {
                ui::step_info(&ctx, &format!("{} already exists", package))
            }
            TargetOutcome::Failed { reason, .. } => ui::step_error(&ctx, reason),
        }

        history.record(&project, &outcome).await;
        report.record(&outcome);
    }

    report.print(&ctx);

    if report.has_failures() {
        Err(MultipackError::TargetsFailed(report.failed.len()))
    } else {
        Ok(())
    }
}

fn project_dir(path: &Path) -> MultipackResult<PathBuf> {
    if !path.is_dir() {
        return Err(MultipackError::PathNotFound(path.to_path_buf()));
    }
    path.canonicalize()
        .map_err(|e| MultipackError::io(format!("resolving {}", path.display()), e))
}

async fn output_dir(requested: Option<&Path>) -> MultipackResult<PathBuf> {
    let dir = match requested {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()
            .map_err(|e| MultipackError::io("getting current directory", e))?,
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| MultipackError::io(format!("creating {}", dir.display()), e))?;
    dir.canonicalize()
        .map_err(|e| MultipackError::io(format!("resolving {}", dir.display()), e))
}
