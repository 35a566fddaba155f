//! Transactional mutation of cache trees
//!
//! A [`TransactionStrategy`] runs a mutation against a disposable view of a
//! base tree and either commits the result into the base or leaves the base
//! exactly as it was. Two strategies exist:
//!
//! - [`UnionMount`]: overlayfs with the base as lower layer; commit merges
//!   the upper layer back with [`OverlayMerger`].
//! - [`FullCopy`]: back the base up with `cp -a`, mutate in place, restore
//!   the backup on failure.
//!
//! Both also produce long-lived [`WorkingEnvironment`]s that are never
//! committed back.

use crate::config::StrategyKind;
use crate::error::{MultipackError, MultipackResult};
use crate::overlay::merge::OverlayMerger;
use crate::sandbox::host;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::ffi::OsString;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Operation run against the transaction's view of the base tree
pub type Mutation<'a> =
    Box<dyn FnOnce(PathBuf) -> BoxFuture<'a, MultipackResult<()>> + Send + 'a>;

/// Box an async closure into a [`Mutation`]
pub fn mutation<'a, F, Fut>(f: F) -> Mutation<'a>
where
    F: FnOnce(PathBuf) -> Fut + Send + 'a,
    Fut: Future<Output = MultipackResult<()>> + Send + 'a,
{
    Box::new(move |path| f(path).boxed())
}

/// How a transaction ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The mutation succeeded and its changes are now in the base
    Committed,
    /// The mutation failed or never ran; the base is unchanged
    RolledBack { reason: String },
    /// The mutation succeeded but applying it to the base failed
    CommitFailed { reason: String },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    /// Convert into a result naming the base path on failure
    pub fn into_result(self, base: &Path) -> MultipackResult<()> {
        match self {
            Self::Committed => Ok(()),
            Self::RolledBack { reason } | Self::CommitFailed { reason } => {
                Err(MultipackError::TransactionRolledBack {
                    path: base.to_path_buf(),
                    reason,
                })
            }
        }
    }
}

/// Policy for mutating a cache tier and deriving working copies from it
#[async_trait]
pub trait TransactionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `mutation` against a view of `base`, committing only on success
    async fn transact<'a>(&self, base: &Path, mutation: Mutation<'a>) -> TransactionOutcome;

    /// Create a disposable working copy of `template` at `dest`
    async fn working_copy(&self, template: &Path, dest: &Path)
        -> MultipackResult<WorkingEnvironment>;
}

/// Build the strategy selected in the configuration
pub fn create_strategy(kind: StrategyKind) -> Arc<dyn TransactionStrategy> {
    match kind {
        StrategyKind::Overlay => Arc::new(UnionMount::new()),
        StrategyKind::Copy => Arc::new(FullCopy::new()),
    }
}

/// `<path><suffix>` next to `path`
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Scratch siblings a transaction may leave beside its base
pub const LEFTOVER_SUFFIXES: [&str; 6] = [
    ".mount",
    ".upper",
    ".work",
    ".backup",
    ".backup.tmp",
    ".backup.discard",
];

/// Detach and remove everything a transaction on `base` could have left
/// behind, without touching `base` itself
pub fn remove_leftovers(base: &Path) {
    detach(&sibling(base, ".mount"));
    for suffix in LEFTOVER_SUFFIXES {
        host::remove_tree_blocking(&sibling(base, suffix));
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("operation panicked: {}", s)
    } else {
        "operation panicked".to_string()
    }
}

/// Run the mutation, turning both errors and panics into a reason string
async fn run_mutation(mutation: Mutation<'_>, view: PathBuf) -> Result<(), String> {
    match AssertUnwindSafe(mutation(view)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_reason(payload)),
    }
}

fn detach(mount_point: &Path) {
    match umount2(mount_point, MntFlags::MNT_DETACH) {
        Ok(()) => debug!("Detached stale mount at {}", mount_point.display()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
        Err(e) => warn!("Failed to detach {}: {}", mount_point.display(), e),
    }
}

/// Unmount cleanly, falling back to a lazy detach if the mount is busy
fn unmount(mount_point: &Path) -> MultipackResult<()> {
    match umount2(mount_point, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EBUSY) => {
            warn!("{} is busy, detaching lazily", mount_point.display());
            umount2(mount_point, MntFlags::MNT_DETACH).map_err(|e| MultipackError::MountFailure {
                mount_point: mount_point.to_path_buf(),
                reason: format!("unmount failed: {}", e),
            })
        }
        Err(e) => Err(MultipackError::MountFailure {
            mount_point: mount_point.to_path_buf(),
            reason: format!("unmount failed: {}", e),
        }),
    }
}

fn mount_overlay(lower: &Path, upper: &Path, work: &Path, target: &Path) -> MultipackResult<()> {
    for path in [lower, upper, work] {
        let text = path.to_string_lossy();
        if text.contains(',') || text.contains(':') {
            return Err(MultipackError::MountFailure {
                mount_point: target.to_path_buf(),
                reason: format!("path {} cannot be used in overlay options", text),
            });
        }
    }

    let options = format!(
        "lowerdir={},upperdir={},workdir={},redirect_dir=off,metacopy=off",
        lower.display(),
        upper.display(),
        work.display()
    );
    debug!("mount -t overlay overlay -o {} {}", options, target.display());

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| MultipackError::MountFailure {
        mount_point: target.to_path_buf(),
        reason: e.to_string(),
    })
}

fn create_dirs(dirs: &[&Path]) -> MultipackResult<()> {
    for dir in dirs {
        std::fs::create_dir_all(dir)
            .map_err(|e| MultipackError::io(format!("creating {}", dir.display()), e))?;
    }
    Ok(())
}

/// Upper, work and mount directories of one union-mount transaction
///
/// Dropping the guard unmounts (if still mounted) and removes all three.
struct ScratchDirs {
    upper: PathBuf,
    work: PathBuf,
    mount: PathBuf,
    mounted: bool,
}

impl ScratchDirs {
    fn beside(base: &Path) -> Self {
        Self {
            upper: sibling(base, ".upper"),
            work: sibling(base, ".work"),
            mount: sibling(base, ".mount"),
            mounted: false,
        }
    }

    fn recreate(&self) -> MultipackResult<()> {
        detach(&self.mount);
        for dir in [&self.upper, &self.work, &self.mount] {
            host::remove_tree_blocking(dir);
        }
        create_dirs(&[&self.upper, &self.work, &self.mount])
    }
}

impl Drop for ScratchDirs {
    fn drop(&mut self) {
        if self.mounted {
            detach(&self.mount);
        }
        for dir in [&self.mount, &self.work, &self.upper] {
            host::remove_tree_blocking(dir);
        }
    }
}

/// Overlayfs-backed transactions
#[derive(Debug, Default)]
pub struct UnionMount;

impl UnionMount {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransactionStrategy for UnionMount {
    fn name(&self) -> &'static str {
        "overlay"
    }

    async fn transact<'a>(&self, base: &Path, mutation: Mutation<'a>) -> TransactionOutcome {
        let mut scratch = ScratchDirs::beside(base);

        if let Err(e) = scratch.recreate() {
            return TransactionOutcome::RolledBack {
                reason: e.to_string(),
            };
        }
        if let Err(e) = mount_overlay(base, &scratch.upper, &scratch.work, &scratch.mount) {
            error!("{}", e);
            return TransactionOutcome::RolledBack {
                reason: e.to_string(),
            };
        }
        scratch.mounted = true;
        info!("Transaction on {} started", base.display());

        let result = run_mutation(mutation, scratch.mount.clone()).await;

        if let Err(e) = unmount(&scratch.mount) {
            error!("{}", e);
            drop(scratch);
            host::sync();
            return TransactionOutcome::RolledBack {
                reason: e.to_string(),
            };
        }
        scratch.mounted = false;

        if let Err(reason) = result {
            error!("Rolling back {}: {}", base.display(), reason);
            drop(scratch);
            host::sync();
            return TransactionOutcome::RolledBack { reason };
        }

        // The guard moves into the blocking task so scratch removal waits
        // for the merge even if this future is dropped.
        let base_path = base.to_path_buf();
        let merged = tokio::task::spawn_blocking(move || {
            let stats = OverlayMerger::new().merge(&scratch.upper, &base_path);
            drop(scratch);
            host::sync();
            stats
        })
        .await;

        match merged {
            Ok(Ok(stats)) => {
                info!(
                    "Committed transaction on {} ({} moved, {} copied, {} removed)",
                    base.display(),
                    stats.moved,
                    stats.copied,
                    stats.removed
                );
                TransactionOutcome::Committed
            }
            Ok(Err(e)) => {
                error!("Merge into {} failed: {}", base.display(), e);
                TransactionOutcome::CommitFailed {
                    reason: e.to_string(),
                }
            }
            Err(e) => TransactionOutcome::CommitFailed {
                reason: format!("merge task failed: {}", e),
            },
        }
    }

    async fn working_copy(
        &self,
        template: &Path,
        dest: &Path,
    ) -> MultipackResult<WorkingEnvironment> {
        let upper = sibling(dest, ".upper");
        let work = sibling(dest, ".work");

        detach(dest);
        for dir in [dest, upper.as_path(), work.as_path()] {
            host::remove_tree(dir).await?;
        }
        create_dirs(&[dest, &upper, &work])?;

        let mut env = WorkingEnvironment {
            root: dest.to_path_buf(),
            kind: WorkingKind::Overlay { upper, work },
            keep: false,
            torn_down: false,
        };

        if let Err(e) = mount_overlay(template, env.upper_dir(), env.work_dir(), dest) {
            env.teardown();
            return Err(e);
        }

        info!(
            "Working copy of {} mounted at {}",
            template.display(),
            dest.display()
        );
        Ok(env)
    }
}

/// Backup directory of a full-copy transaction
///
/// While armed, dropping the guard puts the backup back in place.
struct BackupGuard {
    base: PathBuf,
    backup: PathBuf,
    armed: bool,
}

impl BackupGuard {
    fn restore(&mut self) -> std::io::Result<()> {
        self.armed = false;
        restore_backup(&self.base, &self.backup)
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Transaction on {} aborted, restoring backup", self.base.display());
            if let Err(e) = self.restore() {
                error!("Failed to restore {}: {}", self.base.display(), e);
            }
            host::sync();
        }
    }
}

fn restore_backup(base: &Path, backup: &Path) -> std::io::Result<()> {
    if base.exists() {
        std::fs::remove_dir_all(base)?;
    }
    std::fs::rename(backup, base)
}

/// Backup-and-restore transactions
#[derive(Debug, Default)]
pub struct FullCopy;

impl FullCopy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransactionStrategy for FullCopy {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn transact<'a>(&self, base: &Path, mutation: Mutation<'a>) -> TransactionOutcome {
        let backup = sibling(base, ".backup");
        let discard = sibling(base, ".backup.discard");

        // A discarded backup belongs to a committed transaction
        host::remove_tree_blocking(&discard);

        if backup.exists() {
            warn!(
                "Found leftover backup {}, restoring it before continuing",
                backup.display()
            );
            if let Err(e) = restore_backup(base, &backup) {
                return TransactionOutcome::RolledBack {
                    reason: format!("restoring leftover backup failed: {}", e),
                };
            }
            host::sync();
        }

        // Only a complete copy is ever renamed to the backup name
        let partial = sibling(base, ".backup.tmp");
        host::remove_tree_blocking(&partial);

        info!("Generating a backup of {}", base.display());
        if let Err(e) = host::copy_tree(base, &partial).await {
            host::remove_tree_blocking(&partial);
            return TransactionOutcome::RolledBack {
                reason: e.to_string(),
            };
        }
        host::sync();
        if let Err(e) = std::fs::rename(&partial, &backup) {
            host::remove_tree_blocking(&partial);
            return TransactionOutcome::RolledBack {
                reason: format!("renaming backup into place failed: {}", e),
            };
        }

        let mut guard = BackupGuard {
            base: base.to_path_buf(),
            backup: backup.clone(),
            armed: true,
        };

        match run_mutation(mutation, base.to_path_buf()).await {
            Ok(()) => {
                host::sync();
                // Once renamed, the backup can no longer be mistaken for an
                // interrupted mutation, however its removal ends.
                if let Err(e) = std::fs::rename(&backup, &discard) {
                    error!("Failed to retire backup {}: {}", backup.display(), e);
                    let restored = guard.restore();
                    host::sync();
                    return TransactionOutcome::CommitFailed {
                        reason: match restored {
                            Ok(()) => format!("retiring backup failed: {}", e),
                            Err(r) => format!(
                                "retiring backup failed: {}; restoring it failed too: {}",
                                e, r
                            ),
                        },
                    };
                }
                guard.armed = false;
                host::sync();
                if let Err(e) = host::remove_tree(&discard).await {
                    warn!("Failed to remove old backup {}: {}", discard.display(), e);
                }
                info!("Committed transaction on {}", base.display());
                TransactionOutcome::Committed
            }
            Err(reason) => {
                error!("Rolling back {}: {}", base.display(), reason);
                let restored = guard.restore();
                host::sync();
                match restored {
                    Ok(()) => TransactionOutcome::RolledBack { reason },
                    Err(e) => TransactionOutcome::RolledBack {
                        reason: format!(
                            "{}; restoring backup failed ({}), it is kept at {}",
                            reason,
                            e,
                            backup.display()
                        ),
                    },
                }
            }
        }
    }

    async fn working_copy(
        &self,
        template: &Path,
        dest: &Path,
    ) -> MultipackResult<WorkingEnvironment> {
        host::remove_tree(dest).await?;
        info!("Creating working copy of {}", template.display());

        let mut env = WorkingEnvironment {
            root: dest.to_path_buf(),
            kind: WorkingKind::Copy,
            keep: false,
            torn_down: false,
        };
        if let Err(e) = host::copy_tree(template, dest).await {
            env.teardown();
            return Err(e);
        }
        Ok(env)
    }
}

#[derive(Debug)]
enum WorkingKind {
    Copy,
    Overlay { upper: PathBuf, work: PathBuf },
}

/// A disposable sandbox tree owned by one build
///
/// Removed when dropped unless [`WorkingEnvironment::keep`] was called.
#[derive(Debug)]
pub struct WorkingEnvironment {
    root: PathBuf,
    kind: WorkingKind,
    keep: bool,
    torn_down: bool,
}

impl WorkingEnvironment {
    /// Adopt an existing tree (interactive shells on a kept working copy)
    pub fn existing(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            kind: WorkingKind::Copy,
            keep: true,
            torn_down: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_overlay(&self) -> bool {
        matches!(self.kind, WorkingKind::Overlay { .. })
    }

    /// Leave the tree in place after the build
    pub fn keep(&mut self) {
        self.keep = true;
    }

    fn upper_dir(&self) -> &Path {
        match self.kind {
            WorkingKind::Overlay { ref upper, .. } => upper,
            WorkingKind::Copy => &self.root,
        }
    }

    fn work_dir(&self) -> &Path {
        match self.kind {
            WorkingKind::Overlay { ref work, .. } => work,
            WorkingKind::Copy => &self.root,
        }
    }

    /// Remove the tree now, unless it is being kept
    pub fn destroy(mut self) {
        if !self.keep {
            self.teardown();
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        debug!("Removing working copy {}", self.root.display());
        match self.kind {
            WorkingKind::Copy => host::remove_tree_blocking(&self.root),
            WorkingKind::Overlay { ref upper, ref work } => {
                detach(&self.root);
                for dir in [&self.root, work, upper] {
                    host::remove_tree_blocking(dir);
                }
            }
        }
    }
}

impl Drop for WorkingEnvironment {
    fn drop(&mut self) {
        if !self.keep {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    type Snapshot = BTreeMap<PathBuf, (bool, Vec<u8>, u32, u32, u32)>;

    fn snapshot(root: &Path) -> Snapshot {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let meta = fs::symlink_metadata(e.path()).unwrap();
                let content = if meta.is_file() {
                    fs::read(e.path()).unwrap()
                } else {
                    Vec::new()
                };
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                (
                    rel,
                    (meta.is_dir(), content, meta.mode(), meta.uid(), meta.gid()),
                )
            })
            .collect()
    }

    fn sample_base(temp: &TempDir) -> PathBuf {
        let base = temp.path().join("debian_chroot_sid_amd64");
        fs::create_dir_all(base.join("etc/apt")).unwrap();
        fs::create_dir_all(base.join("usr/bin")).unwrap();
        fs::write(base.join("etc/apt/sources.list"), "deb old").unwrap();
        fs::write(base.join("usr/bin/tool"), "v1").unwrap();
        base
    }

    fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    /// Root and a kernel that lets us mount overlayfs here
    fn overlay_available(temp: &TempDir) -> bool {
        if !is_root() {
            return false;
        }
        let scratch = temp.path().join("overlay-check");
        let dirs: Vec<PathBuf> = ["lower", "upper", "work", "mnt"]
            .iter()
            .map(|d| scratch.join(d))
            .collect();
        for d in &dirs {
            fs::create_dir_all(d).unwrap();
        }
        let ok = mount_overlay(&dirs[0], &dirs[1], &dirs[2], &dirs[3]).is_ok();
        if ok {
            let _ = umount2(dirs[3].as_path(), MntFlags::MNT_DETACH);
        }
        ok
    }

    #[test]
    fn sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/var/opt/multipackager/fedora_chroot_40_x86_64"), ".backup"),
            PathBuf::from("/var/opt/multipackager/fedora_chroot_40_x86_64.backup")
        );
    }

    #[test]
    fn overlay_options_reject_separators() {
        let err = mount_overlay(
            Path::new("/tmp/a,b"),
            Path::new("/tmp/u"),
            Path::new("/tmp/w"),
            Path::new("/tmp/m"),
        )
        .unwrap_err();
        assert!(matches!(err, MultipackError::MountFailure { .. }));
    }

    #[test]
    fn outcome_into_result() {
        let base = Path::new("/cache/x");
        assert!(TransactionOutcome::Committed.into_result(base).is_ok());
        let err = TransactionOutcome::RolledBack {
            reason: "apt-get failed".into(),
        }
        .into_result(base)
        .unwrap_err();
        assert!(err.to_string().contains("apt-get failed"));
    }

    #[tokio::test]
    async fn full_copy_commits_changes() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);

        let outcome = FullCopy::new()
            .transact(
                &base,
                mutation(|root| async move {
                    tokio::fs::write(root.join("usr/bin/tool"), "v2").await.unwrap();
                    tokio::fs::remove_file(root.join("etc/apt/sources.list"))
                        .await
                        .unwrap();
                    Ok(())
                }),
            )
            .await;

        assert_eq!(outcome, TransactionOutcome::Committed);
        assert_eq!(fs::read_to_string(base.join("usr/bin/tool")).unwrap(), "v2");
        assert!(!base.join("etc/apt/sources.list").exists());
        assert!(!sibling(&base, ".backup").exists());
    }

    #[tokio::test]
    async fn full_copy_rollback_leaves_base_identical() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);
        let before = snapshot(&base);

        let outcome = FullCopy::new()
            .transact(
                &base,
                mutation(|root| async move {
                    tokio::fs::write(root.join("usr/bin/tool"), "broken").await.unwrap();
                    tokio::fs::remove_dir_all(root.join("etc")).await.unwrap();
                    tokio::fs::write(root.join("stray"), "x").await.unwrap();
                    Err(MultipackError::CommandExit {
                        command: "apt-get dist-upgrade -y".into(),
                        code: 100,
                    })
                }),
            )
            .await;

        assert!(matches!(outcome, TransactionOutcome::RolledBack { .. }));
        assert_eq!(snapshot(&base), before);
        assert!(!sibling(&base, ".backup").exists());
    }

    #[tokio::test]
    async fn full_copy_panic_rolls_back() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);
        let before = snapshot(&base);

        let outcome = FullCopy::new()
            .transact(
                &base,
                mutation(|root| async move {
                    tokio::fs::write(root.join("usr/bin/tool"), "half").await.unwrap();
                    if root.exists() {
                        panic!("driver blew up");
                    }
                    Ok(())
                }),
            )
            .await;

        match outcome {
            TransactionOutcome::RolledBack { reason } => assert!(reason.contains("driver blew up")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(snapshot(&base), before);
    }

    #[tokio::test]
    async fn full_copy_restores_leftover_backup_first() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);
        let before = snapshot(&base);

        // A previous run died after backing up and half-mutating the base
        host::copy_tree(&base, &sibling(&base, ".backup")).await.unwrap();
        fs::write(base.join("usr/bin/tool"), "half-upgraded").unwrap();

        let outcome = FullCopy::new()
            .transact(&base, mutation(|_root| async move { Ok(()) }))
            .await;

        assert!(outcome.is_committed());
        assert_eq!(snapshot(&base), before);
    }

    #[tokio::test]
    async fn full_copy_ignores_partly_removed_old_backup() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);
        let before = snapshot(&base);

        // A committed run died while deleting its retired backup
        fs::create_dir_all(sibling(&base, ".backup.discard").join("usr")).unwrap();

        let outcome = FullCopy::new()
            .transact(&base, mutation(|_root| async move { Ok(()) }))
            .await;

        assert!(outcome.is_committed());
        assert_eq!(snapshot(&base), before);
        for suffix in [".backup", ".backup.discard", ".backup.tmp"] {
            assert!(!sibling(&base, suffix).exists());
        }
    }

    #[tokio::test]
    async fn copy_working_environment_is_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);
        let dest = temp.path().join("work/debian_chroot_sid_amd64");

        let env = FullCopy::new().working_copy(&base, &dest).await.unwrap();
        assert_eq!(fs::read_to_string(dest.join("usr/bin/tool")).unwrap(), "v1");
        assert!(!env.is_overlay());
        drop(env);
        assert!(!dest.exists());
        assert!(base.exists());
    }

    #[tokio::test]
    async fn kept_working_environment_survives() {
        let temp = TempDir::new().unwrap();
        let base = sample_base(&temp);
        let dest = temp.path().join("work/kept");

        let mut env = FullCopy::new().working_copy(&base, &dest).await.unwrap();
        env.keep();
        env.destroy();
        assert!(dest.join("usr/bin/tool").exists());
    }

    #[tokio::test]
    async fn union_mount_commit_and_rollback() {
        let temp = TempDir::new().unwrap();
        if !overlay_available(&temp) {
            eprintln!("skipping: overlayfs not available");
            return;
        }
        let base = sample_base(&temp);
        let before = snapshot(&base);
        let strategy = UnionMount::new();

        let outcome = strategy
            .transact(
                &base,
                mutation(|root| async move {
                    tokio::fs::write(root.join("usr/bin/tool"), "broken").await.unwrap();
                    Err(MultipackError::Internal("update failed".into()))
                }),
            )
            .await;
        assert!(matches!(outcome, TransactionOutcome::RolledBack { .. }));
        assert_eq!(snapshot(&base), before);

        let outcome = strategy
            .transact(
                &base,
                mutation(|root| async move {
                    tokio::fs::write(root.join("usr/bin/tool"), "v2").await.unwrap();
                    tokio::fs::remove_file(root.join("etc/apt/sources.list"))
                        .await
                        .unwrap();
                    tokio::fs::create_dir(root.join("opt")).await.unwrap();
                    Ok(())
                }),
            )
            .await;
        assert_eq!(outcome, TransactionOutcome::Committed);
        assert_eq!(fs::read_to_string(base.join("usr/bin/tool")).unwrap(), "v2");
        assert!(!base.join("etc/apt/sources.list").exists());
        assert!(base.join("opt").is_dir());

        for suffix in [".upper", ".work", ".mount"] {
            assert!(!sibling(&base, suffix).exists());
        }
    }

    #[tokio::test]
    async fn union_mount_commit_matches_direct_apply() {
        let temp = TempDir::new().unwrap();
        if !overlay_available(&temp) {
            eprintln!("skipping: overlayfs not available");
            return;
        }
        let base = sample_base(&temp);
        let direct = temp.path().join("direct");
        host::copy_tree(&base, &direct).await.unwrap();

        async fn apply(root: PathBuf) -> MultipackResult<()> {
            tokio::fs::remove_dir_all(root.join("etc/apt")).await.unwrap();
            tokio::fs::write(root.join("etc/apt"), "now a file").await.unwrap();
            tokio::fs::remove_file(root.join("usr/bin/tool")).await.unwrap();
            tokio::fs::create_dir(root.join("usr/bin/tool")).await.unwrap();
            tokio::fs::write(root.join("usr/bin/tool/inner"), "x").await.unwrap();
            Ok(())
        }

        apply(direct.clone()).await.unwrap();
        let outcome = UnionMount::new().transact(&base, mutation(apply)).await;

        assert!(outcome.is_committed());
        assert_eq!(snapshot(&base), snapshot(&direct));
    }

    #[tokio::test]
    async fn union_mount_recreated_directory_drops_old_entries() {
        let temp = TempDir::new().unwrap();
        if !overlay_available(&temp) {
            eprintln!("skipping: overlayfs not available");
            return;
        }
        let base = sample_base(&temp);
        fs::write(base.join("usr/bin/helper"), "old").unwrap();
        let direct = temp.path().join("direct");
        host::copy_tree(&base, &direct).await.unwrap();

        async fn apply(root: PathBuf) -> MultipackResult<()> {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::remove_dir_all(root.join("usr/bin")).await.unwrap();
            tokio::fs::create_dir(root.join("usr/bin")).await.unwrap();
            tokio::fs::write(root.join("usr/bin/fresh"), "new").await.unwrap();
            tokio::fs::set_permissions(root.join("etc"), fs::Permissions::from_mode(0o700))
                .await
                .unwrap();
            nix::unistd::chown(
                root.join("etc/apt/sources.list").as_path(),
                Some(nix::unistd::Uid::from_raw(1000)),
                Some(nix::unistd::Gid::from_raw(1000)),
            )
            .unwrap();
            tokio::fs::rename(
                root.join("etc/apt/sources.list"),
                root.join("etc/apt/sources.list.save"),
            )
            .await
            .unwrap();
            Ok(())
        }

        apply(direct.clone()).await.unwrap();
        let outcome = UnionMount::new().transact(&base, mutation(apply)).await;

        assert!(outcome.is_committed());
        assert!(!base.join("usr/bin/tool").exists());
        assert!(!base.join("usr/bin/helper").exists());
        assert_eq!(snapshot(&base), snapshot(&direct));
    }

    #[tokio::test]
    async fn union_mount_panic_rolls_back() {
        let temp = TempDir::new().unwrap();
        if !overlay_available(&temp) {
            eprintln!("skipping: overlayfs not available");
            return;
        }
        let base = sample_base(&temp);
        let before = snapshot(&base);

        let outcome = UnionMount::new()
            .transact(
                &base,
                mutation(|root| async move {
                    tokio::fs::write(root.join("usr/bin/tool"), "half").await.unwrap();
                    if root.exists() {
                        panic!("boom");
                    }
                    Ok(())
                }),
            )
            .await;

        match outcome {
            TransactionOutcome::RolledBack { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(snapshot(&base), before);
        for suffix in [".upper", ".work", ".mount"] {
            assert!(!sibling(&base, suffix).exists());
        }
    }

    #[tokio::test]
    async fn union_mount_detaches_stale_mount_first() {
        let temp = TempDir::new().unwrap();
        if !overlay_available(&temp) {
            eprintln!("skipping: overlayfs not available");
            return;
        }
        let base = sample_base(&temp);

        // A crashed run left its overlay mounted at the mount point
        let stale: Vec<PathBuf> = [".mount", ".upper", ".work"]
            .iter()
            .map(|s| sibling(&base, s))
            .collect();
        for d in &stale {
            fs::create_dir_all(d).unwrap();
        }
        fs::write(stale[1].join("leaked"), "x").unwrap();
        mount_overlay(&base, &stale[1], &stale[2], &stale[0]).unwrap();

        let outcome = UnionMount::new()
            .transact(
                &base,
                mutation(|root| async move {
                    assert!(!root.join("leaked").exists());
                    assert_eq!(
                        tokio::fs::read_to_string(root.join("usr/bin/tool")).await.unwrap(),
                        "v1"
                    );
                    Ok(())
                }),
            )
            .await;

        assert!(outcome.is_committed());
        assert_eq!(fs::read_to_string(base.join("usr/bin/tool")).unwrap(), "v1");
        assert!(!base.join("leaked").exists());
        for d in &stale {
            assert!(!d.exists());
        }
    }

    #[tokio::test]
    async fn union_mount_dropped_transaction_tears_down() {
        let temp = TempDir::new().unwrap();
        if !overlay_available(&temp) {
            eprintln!("skipping: overlayfs not available");
            return;
        }
        let base = sample_base(&temp);
        let before = snapshot(&base);
        let started = temp.path().join("started");

        let marker = started.clone();
        let union = UnionMount::new();
        let transaction = union.transact(
            &base,
            mutation(move |root| async move {
                tokio::fs::write(root.join("usr/bin/tool"), "interrupted").await.unwrap();
                tokio::fs::write(&marker, "").await.unwrap();
                futures_util::future::pending::<()>().await;
                Ok(())
            }),
        );
        let waiter = tokio::task::spawn_blocking(move || {
            while !started.exists() {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        });

        tokio::select! {
            outcome = transaction => panic!("transaction finished: {outcome:?}"),
            _ = waiter => {}
        }

        assert_eq!(snapshot(&base), before);
        for suffix in [".upper", ".work", ".mount"] {
            assert!(!sibling(&base, suffix).exists());
        }
    }
}
