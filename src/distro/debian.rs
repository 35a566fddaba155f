//! Debian and Ubuntu driver (`debootstrap`, `apt-get`, `dpkg -b`)

use super::{
    find_metadata_dir, without_avoided, Architecture, DistroDriver, DistroType, PackageName,
    PreinstallMap,
};
use crate::config::Config;
use crate::error::{MultipackError, MultipackResult};
use crate::sandbox::{host, ChrootExecutor, Sandbox, SandboxCommand, ShellScript, INSTALL_ROOT, PROJECT_DIR};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DEBIAN_DIRS: &[&str] = &["debian", "DEBIAN", "Debian"];
const UBUNTU_DIRS: &[&str] = &["ubuntu", "UBUNTU", "Ubuntu", "debian", "DEBIAN", "Debian"];
const PYTHON_BUILD_DEPS: &[&str] = &["python3", "python3-stdeb", "python3-all", "fakeroot"];
const MAINTAINER_SCRIPTS: &[&str] = &["preinst", "postinst", "prerm", "postrm"];

/// Fields of a `debian/control` file the driver cares about
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub build_depends: Vec<String>,
}

/// Parse `Source:`/`Package:`, `Version:` and the `Build-Depends*` fields
///
/// Later `Package:` lines override `Source:`, so the binary package name wins.
pub fn parse_control(content: &str) -> ControlInfo {
    let mut info = ControlInfo::default();
    let mut in_depends = false;

    for line in content.lines() {
        if in_depends && line.starts_with([' ', '\t']) {
            info.build_depends.extend(parse_dependency_list(line));
            continue;
        }
        in_depends = false;

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Source" | "Package" => info.name = Some(value.trim().to_string()),
            "Version" => info.version = Some(value.trim().to_string()),
            "Build-Depends" | "Build-Depends-Indep" | "Build-Depends-Arch" => {
                info.build_depends.extend(parse_dependency_list(value));
                in_depends = true;
            }
            _ => {}
        }
    }

    info
}

/// Package names from a comma-separated relation list, without version
/// constraints, architecture lists, build profiles or alternatives
fn parse_dependency_list(list: &str) -> Vec<String> {
    list.split(',')
        .filter_map(|relation| {
            let first = relation.split('|').next()?;
            let end = first.find(['(', '[', '<']).unwrap_or(first.len());
            let name = first[..end].trim();
            if name.is_empty() || name.starts_with("${") {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// Turn a source `control` file into a binary package control file
pub fn rewrite_control(content: &str, arch: Architecture) -> String {
    let mut out = String::with_capacity(content.len());
    let mut skipping = false;

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if skipping && line.starts_with([' ', '\t']) {
            continue;
        }
        skipping = false;

        if let Some(value) = line.strip_prefix("Architecture:") {
            if value.trim() == "any" {
                out.push_str(&format!("Architecture: {}\n", arch));
                continue;
            }
        } else if line.starts_with("Source:") || line.starts_with("Build-Depends") {
            skipping = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out
}

/// Driver for `.deb` based distributions
pub struct DebianDriver {
    distro: DistroType,
    release: String,
    arch: Architecture,
    mirror: String,
    executor: Arc<dyn ChrootExecutor>,
}

impl DebianDriver {
    pub fn new(
        distro: DistroType,
        release: &str,
        arch: Architecture,
        config: &Config,
        executor: Arc<dyn ChrootExecutor>,
    ) -> Self {
        let mirror = match distro {
            DistroType::Ubuntu => config.mirrors.ubuntu.clone(),
            _ => config.mirrors.debian.clone(),
        };
        Self {
            distro,
            release: release.to_string(),
            arch,
            mirror,
            executor,
        }
    }

    fn sandbox(&self, root: &Path) -> Sandbox {
        Sandbox::new(root, self.arch.personality(), Arc::clone(&self.executor))
    }

    /// The packaging metadata directory (`ubuntu/` is preferred on Ubuntu)
    fn metadata_dir(&self, project: &Path) -> Option<PathBuf> {
        let candidates = match self.distro {
            DistroType::Ubuntu => UBUNTU_DIRS,
            _ => DEBIAN_DIRS,
        };
        find_metadata_dir(project, candidates)
    }

    fn read_control(&self, project: &Path) -> Option<ControlInfo> {
        let dir = self.metadata_dir(project)?;
        let content = fs::read_to_string(dir.join("control")).ok()?;
        Some(parse_control(&content))
    }

    /// Contents written to `/etc/apt/sources.list` of a new bootstrap root
    pub fn sources_list(&self) -> String {
        let components = match self.distro {
            DistroType::Ubuntu => "main restricted universe multiverse",
            _ => "main contrib non-free",
        };
        format!("deb {} {} {}\n", self.mirror, self.release, components)
    }

    fn apt<I, S>(args: I) -> ShellScript
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ShellScript::new().step_with_env(&[("DEBIAN_FRONTEND", "noninteractive")], args)
    }

    fn dependency_error(&self, reason: impl Into<String>) -> MultipackError {
        MultipackError::DependencyResolution {
            distro: self.full_name(),
            reason: reason.into(),
        }
    }

    fn packaging_error(&self, reason: impl Into<String>) -> MultipackError {
        MultipackError::Packaging {
            distro: self.full_name(),
            reason: reason.into(),
        }
    }

    /// Move the `.deb` produced by stdeb into the output directory
    async fn collect_python_package(
        &self,
        sandbox: &Sandbox,
        output_dir: &Path,
    ) -> MultipackResult<String> {
        let dist = sandbox.host_path(&format!("{}/deb_dist", PROJECT_DIR));
        let mut debs: Vec<PathBuf> = fs::read_dir(&dist)
            .map_err(|e| self.packaging_error(format!("reading {}: {}", dist.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "deb"))
            .collect();
        debs.sort();

        let built = debs
            .into_iter()
            .next()
            .ok_or_else(|| self.packaging_error("stdeb produced no .deb file"))?;
        let stem = built
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = format!("{}.{}{}.deb", stem, self.distro, self.release);

        host::move_file(&built, &output_dir.join(&name)).await?;
        Ok(name)
    }
}

#[async_trait]
impl DistroDriver for DebianDriver {
    fn distro(&self) -> DistroType {
        self.distro
    }

    fn release(&self) -> &str {
        &self.release
    }

    fn arch(&self) -> Architecture {
        self.arch
    }

    async fn generate(&self, root: &Path) -> MultipackResult<()> {
        let args = vec![
            "--variant=buildd".to_string(),
            "--arch".to_string(),
            self.arch.to_string(),
            self.release.clone(),
            root.display().to_string(),
            self.mirror.clone(),
        ];
        host::run("debootstrap", &args).await?;

        let sources = root.join("etc/apt/sources.list");
        tokio::fs::write(&sources, self.sources_list())
            .await
            .map_err(|e| MultipackError::io(format!("writing {}", sources.display()), e))
    }

    async fn update(&self, root: &Path) -> MultipackResult<()> {
        let sandbox = self.sandbox(root);
        sandbox.run(&SandboxCommand::new("apt-get").arg("update")).await?;
        sandbox
            .run_script(Self::apt(["apt-get", "dist-upgrade", "-y"]))
            .await
    }

    fn package_name(&self, project: &Path) -> PackageName {
        if project.join("setup.py").exists() {
            return PackageName::Deferred;
        }
        let Some(info) = self.read_control(project) else {
            return PackageName::Unknown;
        };
        PackageName::Named(format!(
            "{}.{}_{}~{}0_{}.deb",
            info.name.as_deref().unwrap_or("project"),
            self.release,
            info.version.as_deref().unwrap_or("1.0"),
            self.distro,
            self.arch
        ))
    }

    async fn install_dependencies(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        avoid: &BTreeSet<String>,
        _preinstalled: &PreinstallMap,
    ) -> MultipackResult<()> {
        let deps = if project.join("setup.py").exists() {
            let mut deps: Vec<String> = PYTHON_BUILD_DEPS.iter().map(|d| d.to_string()).collect();
            if let Ok(cfg) = fs::read_to_string(project.join("stdeb.cfg")) {
                deps.extend(parse_control(&cfg).build_depends);
            }
            deps
        } else {
            let dir = self
                .metadata_dir(project)
                .ok_or_else(|| self.dependency_error("no debian/ directory with packaging data"))?;
            let content = fs::read_to_string(dir.join("control"))
                .map_err(|e| self.dependency_error(format!("reading control file: {}", e)))?;
            parse_control(&content).build_depends
        };

        let deps = without_avoided(deps, avoid);
        if deps.is_empty() {
            debug!("No build dependencies to install");
            return Ok(());
        }

        info!("Installing build dependencies: {}", deps.join(" "));
        let mut args = vec!["apt-get".to_string(), "install".to_string(), "-y".to_string()];
        args.extend(deps);
        sandbox
            .run_script(Self::apt(args))
            .await
            .map_err(|e| self.dependency_error(e.to_string()))
    }

    async fn install_local_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> MultipackResult<()> {
        sandbox
            .run_script(Self::apt(["apt-get", "install", "-y", package]))
            .await
    }

    async fn build_python(&self, sandbox: &Sandbox) -> MultipackResult<()> {
        sandbox
            .run_script(ShellScript::in_dir(PROJECT_DIR).step([
                "python3",
                "setup.py",
                "--command-packages=stdeb.command",
                "bdist_deb",
            ]))
            .await
    }

    async fn build_package(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        output_dir: &Path,
    ) -> MultipackResult<String> {
        let staged_project = sandbox.host_path(PROJECT_DIR);
        if staged_project.join("setup.py").exists() {
            return self.collect_python_package(sandbox, output_dir).await;
        }

        let PackageName::Named(name) = self.package_name(project) else {
            return Err(self.packaging_error("cannot determine the package name"));
        };
        let metadata = self
            .metadata_dir(&staged_project)
            .ok_or_else(|| self.packaging_error("no debian/ directory in the sandbox"))?;

        let control_dir = sandbox.host_path(INSTALL_ROOT).join("DEBIAN");
        host::copy_tree(&metadata, &control_dir)
            .await
            .map_err(|e| self.packaging_error(e.to_string()))?;

        for script in MAINTAINER_SCRIPTS {
            let path = control_dir.join(script);
            if path.exists() {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(|e| {
                    MultipackError::io(format!("marking {} executable", path.display()), e)
                })?;
            }
        }

        let control = control_dir.join("control");
        let content = fs::read_to_string(&control)
            .map_err(|e| self.packaging_error(format!("reading control file: {}", e)))?;
        fs::write(&control, rewrite_control(&content, self.arch))
            .map_err(|e| MultipackError::io(format!("writing {}", control.display()), e))?;

        sandbox
            .run_script(ShellScript::in_dir("/").step(["dpkg", "-b", INSTALL_ROOT, name.as_str()]))
            .await
            .map_err(|e| self.packaging_error(e.to_string()))?;

        host::move_file(&sandbox.host_path(&name), &output_dir.join(&name)).await?;
        info!("Built {}", name);
        Ok(name)
    }
}
