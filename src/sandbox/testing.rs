//! Test doubles for sandbox execution

use super::chroot::{ChrootExecutor, Personality, SandboxCommand};
use crate::error::{MultipackError, MultipackResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type Hook = Box<dyn Fn(&Path, &SandboxCommand) + Send + Sync>;

/// Records every command instead of launching anything
#[derive(Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<(PathBuf, String)>>,
    fail_on: Option<String>,
    hook: Option<Hook>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any command whose rendering contains `pattern`
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            fail_on: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    /// Run `hook` for every successful command, e.g. to fake build output
    pub fn with_hook(
        mut self,
        hook: impl Fn(&Path, &SandboxCommand) + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }
}

#[async_trait]
impl ChrootExecutor for RecordingExecutor {
    async fn run(
        &self,
        root: &Path,
        command: &SandboxCommand,
        _personality: Personality,
        _user: Option<&str>,
    ) -> MultipackResult<()> {
        let rendered = command.to_string();
        self.commands
            .lock()
            .unwrap()
            .push((root.to_path_buf(), rendered.clone()));

        if let Some(ref pattern) = self.fail_on {
            if rendered.contains(pattern.as_str()) {
                return Err(MultipackError::CommandExit {
                    command: rendered,
                    code: 1,
                });
            }
        }
        if let Some(ref hook) = self.hook {
            hook(root, command);
        }
        Ok(())
    }

    async fn interactive(
        &self,
        _root: &Path,
        _personality: Personality,
        _binds: &[String],
        _shell: &str,
    ) -> MultipackResult<i32> {
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
