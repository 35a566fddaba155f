//! Arch Linux driver (bootstrap tarball, `pacman`, `makepkg`)
//!
//! Only the official repositories are used. A dependency that pacman cannot
//! find (typically an AUR package) fails dependency installation.

use super::fedora::PythonMetadata;
use super::{without_avoided, Architecture, DistroDriver, DistroType, PackageName, PreinstallMap};
use crate::config::Config;
use crate::error::{MultipackError, MultipackResult};
use crate::sandbox::{host, ChrootExecutor, Sandbox, SandboxCommand, ShellScript, PROJECT_DIR};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Unprivileged user `makepkg` runs as
pub const MAKEPKG_USER: &str = "multipackager";

const BASE_TOOLS: &[&str] = &["fakeroot", "make", "gcc", "patch", "cmake", "autoconf", "automake"];
const PKGEXT: &str = ".pkg.tar.xz";
const PKGINFO_DIR: &str = "/var/tmp/multipackager_pkginfo";

/// PKGBUILD functions that are replaced when packaging
const PKGBUILD_FUNCTIONS: &[&str] = &["pkgver()", "prepare()", "build()", "check()", "package()"];

/// Name, version and dependencies read from a PKGBUILD
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PkgbuildInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    /// `depends` followed by `makedepends`, version constraints removed
    pub depends: Vec<String>,
}

/// Parse the variables of a PKGBUILD, including multi-line arrays
pub fn parse_pkgbuild(content: &str) -> PkgbuildInfo {
    let mut info = PkgbuildInfo::default();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "pkgname" => info.name = Some(unquote(value)),
            // a `-suffix` is a packaging revision, not part of the version
            "pkgver" => {
                let v = unquote(value);
                let v = v.rsplit_once('-').map_or(v.as_str(), |(head, _)| head);
                info.version = Some(v.to_string());
            }
            "depends" | "makedepends" => {
                let mut array = value.to_string();
                if array.contains('(') && !array.contains(')') {
                    for next in lines.by_ref() {
                        array.push(' ');
                        array.push_str(next);
                        if next.contains(')') {
                            break;
                        }
                    }
                }
                info.depends.extend(array_items(&array));
            }
            _ => {}
        }
    }
    info
}

/// `depend = <pkg>` lines of a built package's `.PKGINFO`
pub fn parse_pkginfo(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            matches!(key.trim(), "depend" | "makedepend").then(|| strip_constraint(value.trim()))
        })
        .filter(|d| !d.is_empty())
        .collect()
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches(['"', '\'']).to_string()
}

fn array_items(array: &str) -> Vec<String> {
    array
        .replace(['(', ')', '"', '\''], " ")
        .split_whitespace()
        .map(strip_constraint)
        .filter(|d| !d.is_empty())
        .collect()
}

/// `glib2>=2.40` → `glib2`
fn strip_constraint(dep: &str) -> String {
    dep.split(['<', '>', '='])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Keep the PKGBUILD header and replace its functions with ones that
/// package `/install_root` as is
pub fn rewrite_pkgbuild(content: &str, revision: u32) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if PKGBUILD_FUNCTIONS.iter().any(|f| line.starts_with(f)) {
            break;
        }
        if line.trim_start().starts_with("pkgrel=") {
            out.push_str(&format!("pkgrel={}\n", revision));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str(&package_functions(false));
    out
}

fn package_functions(python: bool) -> String {
    let install = if python {
        "\tcd /project\n\tpython3 setup.py install --prefix /usr --root \"${pkgdir}\"\n"
    } else {
        "\tcp -a /install_root/. \"${pkgdir}\"/\n"
    };
    format!(
        "\nbuild() {{\n\ttrue\n}}\n\npackage() {{\n\tmkdir -p \"${{pkgdir}}\"\n{}}}\n",
        install
    )
}

/// `[DEFAULT] depends=` / `makedepends=` of a Python project's `stpacman.cfg`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PythonDepends {
    pub depends: Vec<String>,
    pub makedepends: Vec<String>,
}

impl PythonDepends {
    pub fn load(project: &Path) -> Self {
        let mut deps = Self::default();
        let Ok(content) = fs::read_to_string(project.join("stpacman.cfg")) else {
            return deps;
        };
        let mut in_default = false;
        for line in content.lines() {
            let line = line.trim();
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_default = section == "DEFAULT";
                continue;
            }
            if !in_default {
                continue;
            }
            let Some((key, value)) = line.split_once(['=', ':']) else {
                continue;
            };
            let list = value
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty());
            match key.trim() {
                "depends" => deps.depends.extend(list),
                "makedepends" => deps.makedepends.extend(list),
                _ => {}
            }
        }
        deps
    }
}

/// Driver for Arch Linux
pub struct ArchDriver {
    release: String,
    arch: Architecture,
    mirror: String,
    revision: u32,
    executor: Arc<dyn ChrootExecutor>,
}

impl ArchDriver {
    pub fn new(
        release: &str,
        arch: Architecture,
        config: &Config,
        executor: Arc<dyn ChrootExecutor>,
    ) -> Self {
        Self {
            release: release.to_string(),
            arch,
            mirror: config.mirrors.arch.trim_end_matches('/').to_string(),
            revision: config.build.revision,
            executor,
        }
    }

    fn arch_name(&self) -> &'static str {
        self.arch.name_for(DistroType::Arch)
    }

    fn sandbox(&self, root: &Path) -> Sandbox {
        Sandbox::new(root, self.arch.personality(), Arc::clone(&self.executor))
    }

    /// `archlinux-bootstrap-<release>-<arch>.tar.gz`
    pub fn bootstrap_file(&self) -> String {
        format!("archlinux-bootstrap-{}-{}.tar.gz", self.release, self.arch_name())
    }

    pub fn bootstrap_url(&self) -> String {
        format!("{}/iso/{}/{}", self.mirror, self.release, self.bootstrap_file())
    }

    /// Contents of `/etc/pacman.d/mirrorlist`
    pub fn mirrorlist(&self) -> String {
        format!("Server = {}/$repo/os/$arch\n", self.mirror)
    }

    fn read_pkgbuild(&self, project: &Path) -> Option<PkgbuildInfo> {
        let content = fs::read_to_string(project.join("PKGBUILD")).ok()?;
        Some(parse_pkgbuild(&content))
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

    /// Dependencies declared by the packages in `.PKGINFO` of each file
    async fn preinstalled_depends(
        &self,
        sandbox: &Sandbox,
        preinstalled: &PreinstallMap,
    ) -> MultipackResult<Vec<String>> {
        let Some(packages) = preinstalled.get(&self.full_name()) else {
            return Ok(Vec::new());
        };
        let dir = sandbox.host_path(PKGINFO_DIR);
        let mut deps = Vec::new();
        for package in packages {
            host::remove_tree(&dir).await?;
            fs::create_dir_all(&dir)
                .map_err(|e| MultipackError::io(format!("creating {}", dir.display()), e))?;
            let args = vec![
                "-xf".to_string(),
                package.display().to_string(),
                "-C".to_string(),
                dir.display().to_string(),
                ".PKGINFO".to_string(),
            ];
            host::run("tar", &args)
                .await
                .map_err(|e| self.dependency_error(e.to_string()))?;
            if let Ok(info) = fs::read_to_string(dir.join(".PKGINFO")) {
                deps.extend(parse_pkginfo(&info));
            }
        }
        host::remove_tree(&dir).await?;
        Ok(deps)
    }

    /// Python projects get a PKGBUILD generated from their metadata
    fn python_pkgbuild(&self, project: &Path) -> MultipackResult<String> {
        let meta = PythonMetadata::load(project);
        let name = meta
            .name
            .ok_or_else(|| self.packaging_error("cannot determine the Python project name"))?;
        let deps = PythonDepends::load(project);
        let array = |list: &[String]| {
            let mut items: Vec<String> = list.iter().map(|d| format!("'{}'", d)).collect();
            if !list.iter().any(|d| d == "python") {
                items.push("'python'".to_string());
            }
            items.join(" ")
        };
        let mut out = format!(
            "pkgname=python-{}\npkgver={}\npkgrel={}\narch=('any')\n",
            name,
            meta.version.as_deref().unwrap_or("1.0"),
            self.revision
        );
        out.push_str(&format!("depends=({})\n", array(&deps.depends)));
        out.push_str(&format!("makedepends=({})\n", array(&deps.makedepends)));
        out.push_str(&package_functions(true));
        Ok(out)
    }

    fn find_built(dir: &Path) -> Option<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(PKGEXT))
            .collect();
        found.sort();
        found.into_iter().next()
    }
}

#[async_trait]
impl DistroDriver for ArchDriver {
    fn distro(&self) -> DistroType {
        DistroType::Arch
    }

    fn release(&self) -> &str {
        &self.release
    }

    fn arch(&self) -> Architecture {
        self.arch
    }

    async fn generate(&self, root: &Path) -> MultipackResult<()> {
        let tarball = root.join(self.bootstrap_file());
        info!("Downloading {}", self.bootstrap_url());
        host::run(
            "wget",
            &[
                self.bootstrap_url(),
                "-O".to_string(),
                tarball.display().to_string(),
            ],
        )
        .await?;

        // the tarball holds a single `root.<arch>/` directory
        host::run(
            "tar",
            &[
                "-xzf".to_string(),
                tarball.display().to_string(),
                "-C".to_string(),
                root.display().to_string(),
                "--strip-components=1".to_string(),
                "--numeric-owner".to_string(),
            ],
        )
        .await?;
        host::remove_tree(&tarball).await?;

        let mirrorlist = root.join("etc/pacman.d/mirrorlist");
        if let Some(parent) = mirrorlist.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MultipackError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(&mirrorlist, self.mirrorlist())
            .map_err(|e| MultipackError::io(format!("writing {}", mirrorlist.display()), e))?;

        let sandbox = self.sandbox(root);
        sandbox
            .run(&SandboxCommand::new("pacman-key").arg("--init"))
            .await?;
        sandbox
            .run(&SandboxCommand::new("pacman-key").args(["--populate", "archlinux"]))
            .await?;
        sandbox
            .run(&SandboxCommand::new("pacman").args(["-Syu", "--noconfirm", "base"]))
            .await?;
        sandbox
            .run(&SandboxCommand::new("useradd").args([MAKEPKG_USER, "-m", "-b", "/"]))
            .await?;
        sandbox
            .run(
                &SandboxCommand::new("pacman")
                    .args(["-S", "--needed", "--noconfirm"])
                    .args(BASE_TOOLS.iter().copied()),
            )
            .await
    }

    async fn update(&self, root: &Path) -> MultipackResult<()> {
        self.sandbox(root)
            .run(&SandboxCommand::new("pacman").args(["-Syu", "--noconfirm"]))
            .await
    }

    fn package_name(&self, project: &Path) -> PackageName {
        let revision = self.revision;
        if project.join("setup.py").exists() {
            let meta = PythonMetadata::load(project);
            let Some(name) = meta.name else {
                return PackageName::Unknown;
            };
            return PackageName::Named(format!(
                "python-{}-{}-{}-any{}",
                name,
                meta.version.as_deref().unwrap_or("1.0"),
                revision,
                PKGEXT
            ));
        }
        let Some(PkgbuildInfo {
            name: Some(name),
            version,
            ..
        }) = self.read_pkgbuild(project)
        else {
            debug!("No PKGBUILD name in {}", project.display());
            return PackageName::Unknown;
        };
        PackageName::Named(format!(
            "{}-{}-{}-{}{}",
            name,
            version.as_deref().unwrap_or("1.0"),
            revision,
            self.arch_name(),
            PKGEXT
        ))
    }

    async fn install_dependencies(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        avoid: &BTreeSet<String>,
        preinstalled: &PreinstallMap,
    ) -> MultipackResult<()> {
        let mut deps = if project.join("setup.py").exists() {
            let python = PythonDepends::load(project);
            let mut deps = python.depends;
            deps.extend(python.makedepends);
            deps.push("python".to_string());
            deps
        } else {
            self.read_pkgbuild(project)
                .ok_or_else(|| self.dependency_error("no PKGBUILD with the package data"))?
                .depends
        };
        deps.extend(self.preinstalled_depends(sandbox, preinstalled).await?);

        let deps: Vec<String> = without_avoided(deps, avoid)
            .into_iter()
            .map(|d| if d == "sh" { "bash".to_string() } else { d })
            .collect();
        if deps.is_empty() {
            debug!("No build dependencies to install");
            return Ok(());
        }

        info!("Installing build dependencies: {}", deps.join(" "));
        sandbox
            .run(
                &SandboxCommand::new("pacman")
                    .args(["-S", "--needed", "--noconfirm"])
                    .args(deps),
            )
            .await
            .map_err(|e| {
                self.dependency_error(format!(
                    "{} (packages outside the official repositories are not fetched)",
                    e
                ))
            })
    }

    async fn install_local_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> MultipackResult<()> {
        sandbox
            .run(&SandboxCommand::new("pacman").args(["--noconfirm", "-U", package]))
            .await
    }

    /// `makepkg` runs `setup.py install` itself while packaging
    async fn build_python(&self, _sandbox: &Sandbox) -> MultipackResult<()> {
        Ok(())
    }

    async fn build_package(
        &self,
        sandbox: &Sandbox,
        project: &Path,
        output_dir: &Path,
    ) -> MultipackResult<String> {
        let staged = sandbox.host_path(PROJECT_DIR);
        let pkgbuild = staged.join("PKGBUILD");

        let content = if staged.join("setup.py").exists() {
            self.python_pkgbuild(&staged)?
        } else {
            let original = fs::read_to_string(&pkgbuild).map_err(|e| {
                self.packaging_error(format!("reading {}: {}", pkgbuild.display(), e))
            })?;
            rewrite_pkgbuild(&original, self.revision)
        };
        fs::write(&pkgbuild, content)
            .map_err(|e| MultipackError::io(format!("writing {}", pkgbuild.display()), e))?;

        // makepkg refuses to run as root and writes into the project
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o777))
            .map_err(|e| MultipackError::io(format!("chmod {}", staged.display()), e))?;

        let script = ShellScript::in_dir(PROJECT_DIR).step_with_env(&[("PKGEXT", PKGEXT)], ["makepkg"]);
        sandbox
            .run_as(&script.into_command(), Some(MAKEPKG_USER))
            .await
            .map_err(|e| self.packaging_error(e.to_string()))?;

        let built = Self::find_built(&staged)
            .ok_or_else(|| self.packaging_error(format!("makepkg produced no {} file", PKGEXT)))?;
        let PackageName::Named(name) = self.package_name(project) else {
            return Err(self.packaging_error("cannot determine the package name"));
        };
        host::move_file(&built, &output_dir.join(&name)).await?;
        info!("Built {}", name);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::RecordingExecutor;
    use tempfile::TempDir;

    const PKGBUILD: &str = "\
# Maintainer: someone
pkgname=hello
pkgver=2.1.0-3
pkgrel=7
arch=('x86_64')
depends=('glib2>=2.40' 'gtk3')
makedepends=(
    'meson'
    \"vala\"
    'sh'
)

build() {
    meson build
}

package() {
    DESTDIR=\"$pkgdir\" ninja -C build install
}
";

    fn driver(executor: Arc<RecordingExecutor>) -> ArchDriver {
        ArchDriver::new("2024.05.01", Architecture::Amd64, &Config::default(), executor)
    }

    fn project_with_pkgbuild() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("PKGBUILD"), PKGBUILD).unwrap();
        temp
    }

    #[test]
    fn pkgbuild_variables_are_parsed() {
        let info = parse_pkgbuild(PKGBUILD);
        assert_eq!(info.name.as_deref(), Some("hello"));
        assert_eq!(info.version.as_deref(), Some("2.1.0"));
        assert_eq!(info.depends, vec!["glib2", "gtk3", "meson", "vala", "sh"]);
    }

    #[test]
    fn pkginfo_depends_are_read() {
        let info = "pkgname = libfoo\ndepend = glibc>=2.38\ndepend = zlib\nsize = 10\n";
        assert_eq!(parse_pkginfo(info), vec!["glibc", "zlib"]);
    }

    #[test]
    fn pkgbuild_rewrite_replaces_functions() {
        let out = rewrite_pkgbuild(PKGBUILD, 4);
        assert!(out.contains("pkgrel=4\n"));
        assert!(!out.contains("pkgrel=7"));
        assert!(!out.contains("meson build"));
        assert!(!out.contains("ninja -C build install"));
        assert!(out.contains("cp -a /install_root/. \"${pkgdir}\"/\n"));
        assert!(out.contains("'meson'"));
    }

    #[test]
    fn binary_package_name_uses_arch_naming() {
        let project = project_with_pkgbuild();
        let d = driver(Arc::new(RecordingExecutor::new()));
        assert_eq!(
            d.package_name(project.path()),
            PackageName::Named("hello-2.1.0-1-x86_64.pkg.tar.xz".to_string())
        );
    }

    #[test]
    fn python_package_name_is_any_arch() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("setup.py"),
            "setup(\n    name='tool',\n    version='0.4',\n)\n",
        )
        .unwrap();
        let d = driver(Arc::new(RecordingExecutor::new()));
        assert_eq!(
            d.package_name(temp.path()),
            PackageName::Named("python-tool-0.4-1-any.pkg.tar.xz".to_string())
        );
    }

    #[test]
    fn missing_pkgbuild_is_unknown() {
        let temp = TempDir::new().unwrap();
        let d = driver(Arc::new(RecordingExecutor::new()));
        assert_eq!(d.package_name(temp.path()), PackageName::Unknown);
    }

    #[test]
    fn bootstrap_urls_follow_mirror() {
        let d = driver(Arc::new(RecordingExecutor::new()));
        assert_eq!(
            d.bootstrap_url(),
            "https://geo.mirror.pkgbuild.com/iso/2024.05.01/archlinux-bootstrap-2024.05.01-x86_64.tar.gz"
        );
        assert_eq!(
            d.mirrorlist(),
            "Server = https://geo.mirror.pkgbuild.com/$repo/os/$arch\n"
        );
    }

    #[test]
    fn stpacman_cfg_is_read() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("stpacman.cfg"),
            "[DEFAULT]\ndepends = python-gobject, gtk3\nmakedepends = python-setuptools\n",
        )
        .unwrap();
        let deps = PythonDepends::load(temp.path());
        assert_eq!(deps.depends, vec!["python-gobject", "gtk3"]);
        assert_eq!(deps.makedepends, vec!["python-setuptools"]);
    }

    #[tokio::test]
    async fn dependencies_come_from_official_repositories() {
        let project = project_with_pkgbuild();
        let executor = Arc::new(RecordingExecutor::new());
        let d = driver(executor.clone());
        let sandbox = d.sandbox(Path::new("/tmp/sandbox"));
        let avoid: BTreeSet<String> = ["gtk3".to_string()].into();

        d.install_dependencies(&sandbox, project.path(), &avoid, &PreinstallMap::new())
            .await
            .unwrap();

        assert_eq!(
            executor.commands(),
            vec!["pacman -S --needed --noconfirm glib2 meson vala bash"]
        );
    }

    #[tokio::test]
    async fn unavailable_dependency_is_a_resolution_failure() {
        let project = project_with_pkgbuild();
        let executor = Arc::new(RecordingExecutor::failing_on("pacman"));
        let d = driver(executor);
        let sandbox = d.sandbox(Path::new("/tmp/sandbox"));

        let err = d
            .install_dependencies(&sandbox, project.path(), &BTreeSet::new(), &PreinstallMap::new())
            .await
            .unwrap_err();

        match err {
            MultipackError::DependencyResolution { distro, reason } => {
                assert_eq!(distro, "arch 2024.05.01 amd64");
                assert!(reason.contains("official repositories"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_package_runs_makepkg_and_collects() {
        let project = project_with_pkgbuild();
        let sandbox_root = TempDir::new().unwrap();
        let staged = sandbox_root.path().join("project");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("PKGBUILD"), PKGBUILD).unwrap();
        let output = TempDir::new().unwrap();

        let executor = Arc::new(RecordingExecutor::new().with_hook(|root, cmd| {
            if cmd.argv().iter().any(|a| a.contains("makepkg")) {
                fs::write(root.join("project/hello-2.1.0-1-x86_64.pkg.tar.xz"), "pkg").unwrap();
            }
        }));
        let d = driver(executor.clone());
        let sandbox = d.sandbox(sandbox_root.path());

        let name = d
            .build_package(&sandbox, project.path(), output.path())
            .await
            .unwrap();

        assert_eq!(name, "hello-2.1.0-1-x86_64.pkg.tar.xz");
        assert!(output.path().join(&name).exists());
        assert_eq!(
            executor.commands(),
            vec!["bash -c 'cd /project && PKGEXT=.pkg.tar.xz makepkg'"]
        );
        let rewritten = fs::read_to_string(staged.join("PKGBUILD")).unwrap();
        assert!(rewritten.contains("pkgrel=1\n"));
        let mode = fs::metadata(&staged).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o777);
    }
}
