//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// multipackager - build distribution packages in cached chroot sandboxes
///
/// Builds .deb and .rpm packages for a project across several
/// distributions, releases and architectures.
#[derive(Parser, Debug)]
#[command(name = "multipackager")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MULTIPACKAGER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build packages for a project
    Build(BuildArgs),

    /// Upgrade the packages inside cached environments
    Update(TargetArgs),

    /// Remove cached environments
    #[command(name = "clear-cache")]
    ClearCache(ClearCacheArgs),

    /// Open a shell inside a working copy of an environment
    Shell(ShellArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Project folder to package
    pub project: PathBuf,

    /// Build only for <distro> <release> <arch> instead of the configured targets
    #[arg(value_names = ["DISTRO", "RELEASE", "ARCH"], num_args = 1..=3)]
    pub target: Vec<String>,

    /// Package revision number
    #[arg(short, long)]
    pub revision: Option<u32>,

    /// Directory that receives the packages (defaults to the current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Keep working copies after each target
    #[arg(long)]
    pub noclean: bool,
}

/// A single optional `<distro> <release> <arch>` triple
#[derive(Parser, Debug)]
pub struct TargetArgs {
    /// Act only on <distro> <release> <arch> instead of the configured targets
    #[arg(value_names = ["DISTRO", "RELEASE", "ARCH"], num_args = 1..=3)]
    pub target: Vec<String>,
}

/// Arguments for the clear-cache command
#[derive(Parser, Debug)]
pub struct ClearCacheArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

/// Arguments for the shell command
#[derive(Parser, Debug)]
pub struct ShellArgs {
    /// Folder holding the environment; created from the cache if missing
    pub dir: PathBuf,

    /// Either <arch> for an existing folder, or <distro> <release> <arch>
    #[arg(value_names = ["DISTRO", "RELEASE", "ARCH"], num_args = 1..=3, required = true)]
    pub target: Vec<String>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

/// Arguments for the completions command
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn build_with_target_override() {
        let cli = Cli::parse_from([
            "multipackager",
            "build",
            "/src/hello",
            "debian",
            "sid",
            "amd64",
            "--revision",
            "3",
            "--noclean",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.project, PathBuf::from("/src/hello"));
                assert_eq!(args.target, ["debian", "sid", "amd64"]);
                assert_eq!(args.revision, Some(3));
                assert!(args.noclean);
                assert!(args.output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn build_without_override() {
        let cli = Cli::parse_from(["multipackager", "-vv", "build", "."]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Build(args) => assert!(args.target.is_empty()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn clear_cache_flags() {
        let cli = Cli::parse_from(["multipackager", "clear-cache", "-y", "fedora", "40", "amd64"]);
        match cli.command {
            Commands::ClearCache(args) => {
                assert!(args.yes);
                assert_eq!(args.target.target, ["fedora", "40", "amd64"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn shell_requires_a_target() {
        assert!(Cli::try_parse_from(["multipackager", "shell", "/tmp/vm"]).is_err());
        let cli = Cli::parse_from(["multipackager", "shell", "/tmp/vm", "i386"]);
        match cli.command {
            Commands::Shell(args) => assert_eq!(args.target, ["i386"]),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
