//! Fedora driver (`dnf --installroot`, `rpmbuild`)

use super::{
    find_metadata_dir, without_avoided, Architecture, DistroDriver, DistroType, PackageName,
    PreinstallMap,
};
use crate::config::Config;
use crate::error::{MultipackError, MultipackResult};
use crate::sandbox::{host, ChrootExecutor, Sandbox, SandboxCommand, ShellScript, PROJECT_DIR};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

const SPEC_DIRS: &[&str] = &["rpmbuild/SPECS", "RPM/SPECS", "rpm/SPECS", "rpmbuild", "RPM", "rpm"];
const BASE_PACKAGES: &[&str] = &["fedora-release", "bash", "dnf", "util-linux", "meson"];
const RPM_TREE: &[&str] = &["SPECS", "SOURCES", "BUILD", "RPMS", "SRPMS"];

/// Name, version and dependencies read from an RPM `.spec` file
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpecInfo {
    pub path: PathBuf,
    pub name: Option<String>,
    pub version: Option<String>,
    pub requires: Vec<String>,
}

/// Parse the preamble tags of a `.spec` file
pub fn parse_spec(content: &str) -> SpecInfo {
    let mut info = SpecInfo::default();
    for line in content.lines() {
        if let Some(v) = line.strip_prefix("BuildRequires:") {
            info.requires.push(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Requires:") {
            info.requires.push(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Name:") {
            info.name = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Version:") {
            info.version = Some(v.trim().to_string());
        }
    }
    info
}

/// Rewrite a project `.spec` so `rpmbuild` packages `/install_root` as is
///
/// Section bodies of `%prep`, `%build`, `%install`, `%clean` and `%files`
/// are dropped up to the next blank line and replaced by fixed content.
pub fn rewrite_spec(content: &str, revision: u32) -> String {
    let mut out = String::with_capacity(content.len());
    let mut copying = true;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            copying = true;
            out.push('\n');
            continue;
        }
        if !copying {
            continue;
        }

        if line.starts_with("Release:") {
            out.push_str(&format!("Release: {}\n", revision));
        } else if line.starts_with("%prep") {
            out.push_str("%prep\n");
            copying = false;
        } else if line.starts_with("%build") {
            out.push_str("%build\n");
            copying = false;
        } else if line.starts_with("%install") {
            out.push_str("%install\n");
            out.push_str("rm -rf $RPM_BUILD_ROOT/*\n");
            out.push_str("cp -a /install_root/* $RPM_BUILD_ROOT/\n");
            copying = false;
        } else if line.starts_with("%clean") {
            out.push_str("%clean\n");
            out.push_str("rm -rf $RPM_BUILD_ROOT/*\n");
            copying = false;
        } else if line.starts_with("%files") {
            out.push_str("%files\n");
            out.push_str("/*\n");
            copying = false;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

/// Metadata of a setuptools project relevant to `bdist_rpm`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PythonMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub build_requires: Vec<String>,
}

impl PythonMetadata {
    /// Read `setup.cfg` (`[metadata]`, then `[bdist_rpm]` overrides), falling
    /// back to literal `name=`/`version=` keywords in `setup.py`
    pub fn load(project: &Path) -> Self {
        let mut meta = Self::default();

        if let Ok(cfg) = fs::read_to_string(project.join("setup.cfg")) {
            let mut section = String::new();
            for line in cfg.lines() {
                let line = line.trim();
                if line.starts_with('#') || line.starts_with(';') || line.is_empty() {
                    continue;
                }
                if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                    section = name.trim().to_string();
                    continue;
                }
                let Some((key, value)) = line.split_once(['=', ':']) else {
                    continue;
                };
                let value = value.trim().to_string();
                match (section.as_str(), key.trim()) {
                    ("metadata" | "bdist_rpm", "name") => meta.name = Some(value),
                    ("metadata" | "bdist_rpm", "version") => meta.version = Some(value),
                    ("bdist_rpm", "build_requires") => meta
                        .build_requires
                        .extend(value.split_whitespace().map(str::to_string)),
                    _ => {}
                }
            }
        }

        if meta.name.is_none() || meta.version.is_none() {
            if let Ok(setup) = fs::read_to_string(project.join("setup.py")) {
                meta.name = meta.name.or_else(|| setup_keyword(&setup, "name"));
                meta.version = meta.version.or_else(|| setup_keyword(&setup, "version"));
            }
        }

        meta
    }
}

/// Literal string value of `keyword=` in a `setup()` call
fn setup_keyword(source: &str, keyword: &str) -> Option<String> {
    source.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(keyword)?.trim_start().strip_prefix('=')?;
        let rest = rest.trim_start();
        let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let body = &rest[1..];
        body.find(quote).map(|end| body[..end].to_string())
    })
}

/// Driver for Fedora
pub struct FedoraDriver {
    release: String,
    arch: Architecture,
    metalink: String,
    revision: u32,
    executor: Arc<dyn ChrootExecutor>,
}

impl FedoraDriver {
    pub fn new(
        release: &str,
        arch: Architecture,
        config: &Config,
        executor: Arc<dyn ChrootExecutor>,
    ) -> Self {
        Self {
            release: release.to_string(),
            arch,
            metalink: config.mirrors.fedora.clone(),
            revision: config.build.revision,
            executor,
        }
    }

    fn arch_name(&self) -> &'static str {
        self.arch.name_for(DistroType::Fedora)
    }

    fn sandbox(&self, root: &Path) -> Sandbox {
        Sandbox::new(root, self.arch.personality(), Arc::clone(&self.executor))
    }

    /// First `.spec` file in the project's spec directory
    fn read_spec(&self, project: &Path) -> Result<SpecInfo, String> {
        let dir = find_metadata_dir(project, SPEC_DIRS)
            .ok_or_else(|| "no rpmbuild/SPECS directory".to_string())?;

        let mut specs: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| format!("reading {}: {}", dir.display(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "spec"))
            .collect();
        specs.sort();
        let path = specs
            .into_iter()
            .next()
            .ok_or_else(|| format!("no .spec file in {}", dir.display()))?;

        let content =
            fs::read_to_string(&path).map_err(|e| format!("reading {}: {}", path.display(), e))?;
        Ok(SpecInfo {
            path,
            ..parse_spec(&content)
        })
    }

    /// `yum.conf` used by the host-side bootstrap install
    pub fn yum_conf(&self, root: &Path) -> String {
        format!(
            "[main]\n\
             cachedir=/var/cache/yum\n\
             persistdir=/var/lib/yum\n\
             keepcache=0\n\
             debuglevel=2\n\
             logfile={}\n\
             exactarch=0\n\
             obsoletes=1\n\
             gpgcheck=1\n\
             plugins=1\n\
             installonly_limit=3\n\
             reposdir={}\n",
            root.join("build.log").display(),
            root.join("yum.repos.d").display()
        )
    }

    /// Repository definition pointing at the Fedora metalink
    pub fn repo_file(&self) -> String {
        let arch = self.arch_name();
        format!(
            "[fedora]\n\
             name=Fedora {rel} - {arch}\n\
             metalink={link}?repo=fedora-{rel}&arch={arch}\n\
             enabled=1\n\
             gpgcheck=1\n\
             gpgkey=file:///etc/pki/rpm-gpg/RPM-GPG-KEY-fedora-{rel}-{arch}\n\
             skip_if_unavailable=False\n",
            rel = self.release,
            arch = arch,
            link = self.metalink
        )
    }

    fn dependencies(&self, project: &Path) -> Result<Vec<String>, String> {
        let mut deps = vec!["rpm-build".to_string()];
        if project.join("setup.py").exists() {
            deps.push("python3".to_string());
            deps.extend(PythonMetadata::load(project).build_requires);
        } else {
            deps.push("meson".to_string());
            deps.push("ninja-build".to_string());
            deps.extend(self.read_spec(project)?.requires);
        }
        Ok(deps)
    }

    fn packaging_error(&self, reason: impl Into<String>) -> MultipackError {
        MultipackError::Packaging {
            distro: self.full_name(),
            reason: reason.into(),
        }
    }

    /// First file whose name ends in `suffix` under `dir`, searched recursively
    fn find_built(dir: &Path, suffix: &str) -> Option<PathBuf> {
        let mut found: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.to_string_lossy().ends_with(suffix))
            .collect();
        found.sort();
        found.into_iter().next()
    }

    async fn collect(
        &self,
        built: Option<PathBuf>,
        project: &Path,
        output_dir: &Path,
    ) -> MultipackResult<String> {
        let built = built.ok_or_else(|| self.packaging_error("rpmbuild produced no .rpm file"))?;
        let PackageName::Named(name) = self.package_name(project) else {
            return Err(self.packaging_error("cannot determine the package name"));
        };
        host::move_file(&built, &output_dir.join(&name)).await?;
        info!("Built {}", name);
        Ok(name)
    }
}

#[async_trait]
impl DistroDriver for FedoraDriver {
    fn distro(&self) -> DistroType {
        DistroType::Fedora
    }

    fn release(&self) -> &str {
        &self.release
    }

    fn arch(&self) -> Architecture {
        self.arch
    }

    async fn generate(&self, root: &Path) -> MultipackResult<()> {
        let conf = root.join("yum.conf");
        let repos = root.join("yum.repos.d");
        let write = |path: PathBuf, content: String| {
            fs::write(&path, content)
                .map_err(|e| MultipackError::io(format!("writing {}", path.display()), e))
        };

        fs::create_dir_all(&repos)
            .map_err(|e| MultipackError::io(format!("creating {}", repos.display()), e))?;
        write(conf.clone(), self.yum_conf(root))?;
        write(repos.join("fedora.repo"), self.repo_file())?;
        let rpmdb = root.join("var/lib/rpm");
        fs::create_dir_all(&rpmdb)
            .map_err(|e| MultipackError::io(format!("creating {}", rpmdb.display()), e))?;

        let mut args = vec![
            "-y".to_string(),
            format!("--config={}", conf.display()),
            format!("--releasever={}", self.release),
            "--nogpg".to_string(),
            format!("--installroot={}", root.display()),
            "install".to_string(),
        ];
        args.extend(BASE_PACKAGES.iter().map(|p| p.to_string()));
        host::run("dnf", &args).await?;

        host::remove_tree(&repos).await?;
        host::remove_tree(&conf).await?;

        // the host-side install leaves an incomplete rpm database
        let releasever = format!("--releasever={}", self.release);
        self.sandbox(root)
            .run(
                &SandboxCommand::new("dnf")
                    .args(["-y", releasever.as_str(), "install"])
                    .args(BASE_PACKAGES.iter().copied()),
            )
            .await
    }

    async fn update(&self, root: &Path) -> MultipackResult<()> {
        self.sandbox(root)
            .run(&SandboxCommand::new("dnf").args(["update", "-y"]))
            .await
    }

    fn package_name(&self, project: &Path) -> PackageName {
        let (name, version, arch) = if project.join("setup.py").exists() {
            let meta = PythonMetadata::load(project);
            (meta.name, meta.version, "noarch")
        } else {
            match self.read_spec(project) {
                Ok(spec) => (spec.name, spec.version, self.arch_name()),
                Err(reason) => {
                    debug!("No package name for {}: {}", project.display(), reason);
                    return PackageName::Unknown;
                }
            }
        };
        let Some(name) = name else {
            return PackageName::Unknown;
        };
        PackageName::Named(format!(
            "{}.fedora{}-{}-{}.{}.rpm",
            name,
            self.release,
            version.as_deref().unwrap_or("1.0"),
            self.revision,
            arch
        ))
    }

    async fn install_dependencies(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        avoid: &BTreeSet<String>,
        _preinstalled: &PreinstallMap,
    ) -> MultipackResult<()> {
        let deps = self
            .dependencies(project)
            .map_err(|reason| MultipackError::DependencyResolution {
                distro: self.full_name(),
                reason,
            })?;
        let deps = without_avoided(deps, avoid);
        if deps.is_empty() {
            return Ok(());
        }

        info!("Installing build dependencies: {}", deps.join(" "));
        sandbox
            .run(&SandboxCommand::new("dnf").args(["-y", "install"]).args(deps))
            .await
            .map_err(|e| MultipackError::DependencyResolution {
                distro: self.full_name(),
                reason: e.to_string(),
            })
    }

    async fn install_local_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> MultipackResult<()> {
        sandbox
            .run(&SandboxCommand::new("dnf").args(["install", "-y", package]))
            .await
    }

    async fn build_python(&self, sandbox: &Sandbox) -> MultipackResult<()> {
        host::remove_tree(&sandbox.host_path(&format!("{}/dist", PROJECT_DIR))).await?;
        sandbox
            .run_script(ShellScript::in_dir(PROJECT_DIR).step(["python3", "setup.py", "bdist_rpm"]))
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
            let built = Self::find_built(&staged_project.join("dist"), ".noarch.rpm");
            return self.collect(built, project, output_dir).await;
        }

        let spec = self
            .read_spec(&staged_project)
            .map_err(|reason| self.packaging_error(reason))?;
        let name = spec
            .name
            .clone()
            .ok_or_else(|| self.packaging_error("the spec file has no Name: tag"))?;

        let top = sandbox.host_path("/rpmpackage");
        for dir in RPM_TREE {
            let path = top.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| MultipackError::io(format!("creating {}", path.display()), e))?;
        }

        let macros = sandbox.host_path("/root/.rpmmacros");
        fs::write(
            &macros,
            "%_topdir /rpmpackage\n\
             %_builddir %{_topdir}/BUILD\n\
             %_rpmdir %{_topdir}/RPMS\n\
             %_sourcedir %{_topdir}/SOURCES\n\
             %_specdir %{_topdir}/SPECS\n\
             %_srcrpmdir %{_topdir}/SRPMS\n",
        )
        .map_err(|e| self.packaging_error(format!("writing {}: {}", macros.display(), e)))?;

        let original = fs::read_to_string(&spec.path)
            .map_err(|e| self.packaging_error(format!("reading {}: {}", spec.path.display(), e)))?;
        let spec_name = format!("{}.specs", name);
        let rewritten = top.join("SPECS").join(&spec_name);
        fs::write(&rewritten, rewrite_spec(&original, self.revision))
            .map_err(|e| MultipackError::io(format!("writing {}", rewritten.display()), e))?;

        sandbox
            .run(
                &SandboxCommand::new("rpmbuild")
                    .arg("-bb")
                    .arg(format!("rpmpackage/SPECS/{}", spec_name)),
            )
            .await
            .map_err(|e| self.packaging_error(e.to_string()))?;

        let built = Self::find_built(&top.join("RPMS"), ".rpm");
        self.collect(built, project, output_dir).await
    }
}
