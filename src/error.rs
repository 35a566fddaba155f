//! Error types for multipackager
//!
//! All modules use `MultipackResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for multipackager operations
pub type MultipackResult<T> = Result<T, MultipackError>;

/// All errors that can occur in multipackager
#[derive(Error, Debug)]
pub enum MultipackError {
    // Environment errors
    #[error("This program must be run as root")]
    NotRoot,

    #[error("Unknown distribution: {0}. Supported: debian, ubuntu, fedora, arch")]
    UnknownDistro(String),

    #[error("Unsupported architecture: {0}. Supported: i386, amd64")]
    UnsupportedArchitecture(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No build targets configured")]
    NoTargets,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    // Cache errors
    #[error("Failed to generate the bootstrap environment for {name}: {reason}")]
    GenerationFailure { name: String, reason: String },

    #[error("Failed to copy {from} to {to}: {reason}")]
    CopyFailure {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("Failed to mount overlay at {mount_point}: {reason}")]
    MountFailure { mount_point: PathBuf, reason: String },

    #[error("Transaction on {path} was rolled back: {reason}")]
    TransactionRolledBack { path: PathBuf, reason: String },

    #[error("Cache lock {path} could not be acquired: {reason}")]
    CacheLock { path: PathBuf, reason: String },

    // Pipeline errors
    #[error("Failed to copy the project sources into the sandbox: {0}")]
    SourceCopy(String),

    #[error("Unknown build system in {0}")]
    UnknownBuildSystem(PathBuf),

    #[error("Dependency installation failed for {distro}: {reason}")]
    DependencyResolution { distro: String, reason: String },

    #[error("Packaging failed for {distro}: {reason}")]
    Packaging { distro: String, reason: String },

    #[error("{0} target(s) failed")]
    TargetsFailed(usize),

    #[error("Interrupted")]
    Interrupted,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed to start: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with code {code}: {command}")]
    CommandExit { command: String, code: i32 },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MultipackError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a copy failure error
    pub fn copy(
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CopyFailure {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotRoot => Some("Re-run with sudo"),
            Self::MountFailure { .. } => {
                Some("Set sandbox.strategy = \"copy\" if the filesystem lacks overlay support")
            }
            Self::NoTargets => Some("Add [[targets]] to the configuration or pass <distro> <release> <arch>"),
            Self::TargetsFailed(_) => Some("Re-run with -v to see the failing commands"),
            Self::InvalidTarget(_) => Some("Targets are given as <distro> <release> <arch>, e.g. debian sid amd64"),
            Self::CacheLock { .. } => Some("Another multipackager run is using this cache"),
            _ => None,
        }
    }
}
