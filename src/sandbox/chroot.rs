//! Isolated-root command execution
//!
//! Commands are composed as argument vectors and only flattened into a
//! `bash -c` string at the last moment, with every argument quoted.

use crate::config::schema::SandboxConfig;
use crate::error::{MultipackError, MultipackResult};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// CPU personality of processes inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    X86,
    X86_64,
}

impl Personality {
    /// Flag value understood by `systemd-nspawn --personality`
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X86_64 => "x86-64",
        }
    }
}

/// A single command to run inside the sandbox, as an argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    argv: Vec<String>,
}

impl SandboxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl fmt::Display for SandboxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted: Vec<String> = self.argv.iter().map(|a| quote(a)).collect();
        write!(f, "{}", quoted.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    env: Vec<(String, String)>,
    argv: Vec<String>,
    tolerant: bool,
}

/// A sequence of commands run in one shell, each starting only if the
/// previous one succeeded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellScript {
    workdir: Option<String>,
    steps: Vec<Step>,
}

impl ShellScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the script with `cd <dir>`
    pub fn in_dir(dir: impl Into<String>) -> Self {
        Self {
            workdir: Some(dir.into()),
            steps: Vec::new(),
        }
    }

    pub fn step<I, S>(self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Vec::new(), argv, false)
    }

    /// A step run with extra environment variables
    pub fn step_with_env<I, S>(self, env: &[(&str, &str)], argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let env = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.push(env, argv, false)
    }

    /// A step whose failure does not stop the script
    pub fn tolerant_step<I, S>(self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Vec::new(), argv, true)
    }

    fn push<I, S>(mut self, env: Vec<(String, String)>, argv: I, tolerant: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(Step {
            env,
            argv: argv.into_iter().map(Into::into).collect(),
            tolerant,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Flatten into a single shell line
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.steps.len() + 1);
        if let Some(ref dir) = self.workdir {
            parts.push(format!("cd {}", quote(dir)));
        }
        for step in &self.steps {
            let mut words: Vec<String> = step
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, quote(v)))
                .collect();
            words.extend(step.argv.iter().map(|a| quote(a)));
            let line = words.join(" ");
            if step.tolerant {
                parts.push(format!("({} || true)", line));
            } else {
                parts.push(line);
            }
        }
        parts.join(" && ")
    }

    /// Wrap into `bash -c '<script>'`
    pub fn into_command(self) -> SandboxCommand {
        SandboxCommand::new("bash").arg("-c").arg(self.render())
    }
}

/// Escape single quotes for use inside a single-quoted shell string
pub fn shell_escape(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Quote a word only when the shell would otherwise split or expand it
pub fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", shell_escape(s))
    }
}

/// Runs commands inside an isolated root
#[async_trait]
pub trait ChrootExecutor: Send + Sync {
    /// Run a command to completion; a non-zero exit is an error
    async fn run(
        &self,
        root: &Path,
        command: &SandboxCommand,
        personality: Personality,
        user: Option<&str>,
    ) -> MultipackResult<()>;

    /// Start an interactive shell and return its exit code
    async fn interactive(
        &self,
        root: &Path,
        personality: Personality,
        binds: &[String],
        shell: &str,
    ) -> MultipackResult<i32>;

    /// Human-readable launcher name
    fn name(&self) -> &'static str;
}

/// `systemd-nspawn` based executor
pub struct NspawnExecutor {
    launcher: String,
}

impl NspawnExecutor {
    pub fn new(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.launcher.clone())
    }

    /// Launcher arguments preceding the command itself
    fn launcher_args(
        root: &Path,
        personality: Personality,
        user: Option<&str>,
        binds: &[String],
    ) -> Vec<String> {
        let mut args = vec![
            "-D".to_string(),
            root.display().to_string(),
            "--personality".to_string(),
            personality.as_flag().to_string(),
        ];
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        for bind in binds {
            args.push(format!("--bind={}", bind));
        }
        args
    }

    fn describe(&self, args: &[String]) -> String {
        let mut line = self.launcher.clone();
        for a in args {
            line.push(' ');
            line.push_str(&quote(a));
        }
        line
    }
}

impl Default for NspawnExecutor {
    fn default() -> Self {
        Self::new("systemd-nspawn")
    }
}

#[async_trait]
impl ChrootExecutor for NspawnExecutor {
    async fn run(
        &self,
        root: &Path,
        command: &SandboxCommand,
        personality: Personality,
        user: Option<&str>,
    ) -> MultipackResult<()> {
        let mut args = Self::launcher_args(root, personality, user, &[]);
        args.extend(command.argv().iter().cloned());

        let line = self.describe(&args);
        info!("Launching {}", line);

        let status = Command::new(&self.launcher)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| MultipackError::command_failed(line.clone(), e))?;

        if status.success() {
            Ok(())
        } else {
            Err(MultipackError::CommandExit {
                command: command.to_string(),
                code: status.code().unwrap_or(-1),
            })
        }
    }

    async fn interactive(
        &self,
        root: &Path,
        personality: Personality,
        binds: &[String],
        shell: &str,
    ) -> MultipackResult<i32> {
        let mut args = Self::launcher_args(root, personality, None, binds);
        args.push(shell.to_string());

        let line = self.describe(&args);
        debug!("Executing interactively: {}", line);

        let status = Command::new(&self.launcher)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| MultipackError::command_failed(line, e))?;

        Ok(status.code().unwrap_or(-1))
    }

    fn name(&self) -> &'static str {
        "systemd-nspawn"
    }
}
