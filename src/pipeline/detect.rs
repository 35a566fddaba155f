//! Build-system detection
//!
//! The first match in this order wins:
//!
//! 1. `multipackager_<distro>.sh`
//! 2. `multipackager.sh`
//! 3. `setup.py` (built by the distribution driver)
//! 4. `configure`
//! 5. `autogen.sh`, run before `configure`
//! 6. `CMakeLists.txt`
//! 7. `meson.build`
//! 8. `Makefile`

use crate::distro::DistroType;
use crate::error::{MultipackError, MultipackResult};
use crate::sandbox::{ShellScript, INSTALL_ROOT, PROJECT_DIR};
use std::fmt;
use std::path::Path;

const DESTDIR: &str = "DESTDIR=/install_root";

/// How a project is compiled and installed into the staging tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSystem {
    /// A project-provided script, sourced from `/project`
    Script(String),
    /// setuptools project packaged by the driver
    Python,
    Autoconf { autogen: bool },
    CMake,
    Meson,
    Makefile,
}

impl BuildSystem {
    /// Probe the project directory for a known build system
    pub fn detect(project: &Path, distro: DistroType) -> MultipackResult<Self> {
        let specific = format!("multipackager_{}.sh", distro);
        let has = |name: &str| project.join(name).exists();

        let system = if has(&specific) {
            Self::Script(specific)
        } else if has("multipackager.sh") {
            Self::Script("multipackager.sh".to_string())
        } else if has("setup.py") {
            Self::Python
        } else if has("configure") {
            Self::Autoconf { autogen: false }
        } else if has("autogen.sh") {
            Self::Autoconf { autogen: true }
        } else if has("CMakeLists.txt") {
            Self::CMake
        } else if has("meson.build") {
            Self::Meson
        } else if has("Makefile") {
            Self::Makefile
        } else {
            return Err(MultipackError::UnknownBuildSystem(project.to_path_buf()));
        };
        Ok(system)
    }

    /// Out-of-tree build directory under `/project`, recreated before building
    pub fn build_dir(&self) -> Option<&'static str> {
        match self {
            Self::CMake => Some("install"),
            Self::Meson => Some("meson"),
            _ => None,
        }
    }

    /// The in-sandbox script, or `None` when the driver builds the project
    ///
    /// Make-based builds run `make clean` first and tolerate its failure;
    /// out-of-tree builds start from a fresh build directory instead.
    pub fn script(&self) -> Option<ShellScript> {
        let project = ShellScript::in_dir(PROJECT_DIR);
        let script = match self {
            Self::Python => return None,
            Self::Script(file) => project.step(["source", file.as_str()]),
            Self::Autoconf { autogen } => {
                let mut s = project;
                if *autogen {
                    s = s.step(["./autogen.sh"]);
                }
                s.step(["./configure", "--prefix=/usr"])
                    .tolerant_step(["make", "clean"])
                    .step(["make"])
                    .step(["make", DESTDIR, "install"])
            }
            Self::CMake => ShellScript::in_dir(format!("{}/install", PROJECT_DIR))
                .step(["cmake", "..", "-DCMAKE_INSTALL_PREFIX=/usr"])
                .step(["make"])
                .step(["make", DESTDIR, "install"]),
            Self::Meson => ShellScript::in_dir(format!("{}/meson", PROJECT_DIR))
                .step(["meson", "setup", "--prefix=/usr", ".."])
                .step(["ninja"])
                .step_with_env(&[("DESTDIR", INSTALL_ROOT)], ["ninja", "install"]),
            Self::Makefile => project
                .tolerant_step(["make", "clean"])
                .step(["make"])
                .step(["make", "PREFIX=/usr", DESTDIR, "install"]),
        };
        Some(script)
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(file) => write!(f, "script {}", file),
            Self::Python => f.write_str("setuptools"),
            Self::Autoconf { autogen: true } => f.write_str("autogen + autoconf"),
            Self::Autoconf { autogen: false } => f.write_str("autoconf"),
            Self::CMake => f.write_str("cmake"),
            Self::Meson => f.write_str("meson"),
            Self::Makefile => f.write_str("makefile"),
        }
    }
}
