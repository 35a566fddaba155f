//! Sandbox roots and the commands run inside them

pub mod chroot;
pub mod host;
#[cfg(test)]
pub(crate) mod testing;

pub use chroot::{ChrootExecutor, NspawnExecutor, Personality, SandboxCommand, ShellScript};

use crate::error::MultipackResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-sandbox location of the project sources
pub const PROJECT_DIR: &str = "/project";

/// In-sandbox staging directory (`DESTDIR`)
pub const INSTALL_ROOT: &str = "/install_root";

/// A root filesystem tree together with the executor that runs commands in it
#[derive(Clone)]
pub struct Sandbox {
    root: PathBuf,
    personality: Personality,
    executor: Arc<dyn ChrootExecutor>,
}

impl Sandbox {
    pub fn new(
        root: impl Into<PathBuf>,
        personality: Personality,
        executor: Arc<dyn ChrootExecutor>,
    ) -> Self {
        Self {
            root: root.into(),
            personality,
            executor,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    /// Host path of an absolute in-sandbox path
    pub fn host_path(&self, inner: &str) -> PathBuf {
        self.root.join(inner.trim_start_matches('/'))
    }

    pub async fn run(&self, command: &SandboxCommand) -> MultipackResult<()> {
        self.run_as(command, None).await
    }

    pub async fn run_as(&self, command: &SandboxCommand, user: Option<&str>) -> MultipackResult<()> {
        self.executor
            .run(&self.root, command, self.personality, user)
            .await
    }

    pub async fn run_script(&self, script: ShellScript) -> MultipackResult<()> {
        self.run(&script.into_command()).await
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("root", &self.root)
            .field("personality", &self.personality)
            .field("executor", &self.executor.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_path_strips_leading_slash() {
        let sandbox = Sandbox::new(
            "/root/multipackager/debian_chroot_sid_amd64",
            Personality::X86_64,
            Arc::new(NspawnExecutor::default()),
        );
        assert_eq!(
            sandbox.host_path(INSTALL_ROOT),
            PathBuf::from("/root/multipackager/debian_chroot_sid_amd64/install_root")
        );
        assert_eq!(
            sandbox.host_path("/project/debian/control"),
            PathBuf::from("/root/multipackager/debian_chroot_sid_amd64/project/debian/control")
        );
    }
}
