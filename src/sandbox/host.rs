//! Commands and tree operations on the host side of the sandbox

use crate::error::{MultipackError, MultipackResult};
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::chroot::quote;

/// Run a host program to completion; a non-zero exit is an error
pub async fn run(program: &str, args: &[String]) -> MultipackResult<()> {
    let line = describe(program, args);
    info!("Launching {}", line);

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| MultipackError::command_failed(line.clone(), e))?;

    if status.success() {
        Ok(())
    } else {
        Err(MultipackError::CommandExit {
            command: line,
            code: status.code().unwrap_or(-1),
        })
    }
}

fn describe(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for a in args {
        line.push(' ');
        line.push_str(&quote(a));
    }
    line
}

/// Copy the contents of `src` into `dest` with `cp -a`, preserving
/// ownership, modes, timestamps, links and device nodes
///
/// `dest` is created if missing and takes on `src`'s own attributes.
pub async fn copy_tree(src: &Path, dest: &Path) -> MultipackResult<()> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| MultipackError::copy(src, dest, e.to_string()))?;

    let args = vec![
        "-a".to_string(),
        format!("{}/.", src.display()),
        dest.display().to_string(),
    ];
    run("cp", &args)
        .await
        .map_err(|e| MultipackError::copy(src, dest, e.to_string()))
}

/// Remove a tree; a missing path is not an error
pub async fn remove_tree(path: &Path) -> MultipackResult<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(MultipackError::io(
                format!("inspecting {}", path.display()),
                e,
            ))
        }
    };

    debug!("Removing {}", path.display());
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MultipackError::io(format!("removing {}", path.display()), e)),
    }
}

/// Move a file, replacing any existing destination; falls back to
/// copy-and-delete across filesystems
pub async fn move_file(src: &Path, dest: &Path) -> MultipackResult<()> {
    remove_tree(dest).await?;
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dest)
        .await
        .map_err(|e| MultipackError::copy(src, dest, e.to_string()))?;
    tokio::fs::remove_file(src)
        .await
        .map_err(|e| MultipackError::io(format!("removing {}", src.display()), e))
}

/// Best-effort removal used on teardown paths
pub fn remove_tree_blocking(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Flush filesystem buffers
pub fn sync() {
    nix::unistd::sync();
}
