//! Build history journal
//!
//! Appends one JSON line per target outcome to `history.log` in the state
//! directory. Write failures are logged and otherwise ignored.

use crate::config::{schema::Config, ConfigManager};
use crate::pipeline::TargetOutcome;
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// JSON-lines journal shared by every target of one invocation
pub struct BuildHistory {
    enabled: bool,
    path: PathBuf,
    run_id: Uuid,
}

impl BuildHistory {
    pub fn new(config: &Config) -> Self {
        Self::at(config.general.history, ConfigManager::history_path())
    }

    pub fn at(enabled: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            path: path.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the outcome of one target
    pub async fn record(&self, project: &Path, outcome: &TargetOutcome) {
        let (event, mut data) = match outcome {
            TargetOutcome::Built { target, package } => {
                ("target.built", json!({ "target": target, "package": package }))
            }
            TargetOutcome::Skipped { target, package } => {
                ("target.skipped", json!({ "target": target, "package": package }))
            }
            TargetOutcome::Failed {
                target,
                stage,
                reason,
            } => (
                "target.failed",
                json!({ "target": target, "stage": stage.as_str(), "reason": reason }),
            ),
        };
        data["project"] = json!(project.display().to_string());
        self.log(event, &data).await;
    }

    /// Log an arbitrary event
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "run": self.run_id.to_string(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize history event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write build history: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
