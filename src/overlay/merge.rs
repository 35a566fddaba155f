//! Reconcile an overlayfs upper layer back into its lower directory
//!
//! After a successful transaction the upper layer holds every change made
//! through the mount: new and modified entries, whiteouts for deletions and
//! opaque directories for trees that were removed and recreated. Merging
//! walks the upper layer and applies each entry to the base so the base ends
//! up as if the mutation had run directly against it.

use crate::error::{MultipackError, MultipackResult};
use filetime::FileTime;
use nix::sys::stat::{major, mknod, Mode, SFlag};
use std::fs::{self, Metadata, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::{lchown, symlink, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, trace};

const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// Counters describing what a merge did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Base entries deleted by whiteouts
    pub removed: usize,
    /// Upper entries renamed into the base
    pub moved: usize,
    /// Upper entries copied over an existing base entry
    pub copied: usize,
    /// Directories present in both layers
    pub merged_dirs: usize,
}

/// Merges an upper layer into a base tree
#[derive(Debug, Default)]
pub struct OverlayMerger {
    stats: MergeStats,
}

impl OverlayMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `upper` onto `base`, consuming entries of `upper` as they are moved
    pub fn merge(mut self, upper: &Path, base: &Path) -> MultipackResult<MergeStats> {
        debug!("Merging {} into {}", upper.display(), base.display());
        self.merge_dir(upper, base)?;
        debug!("Merge finished: {:?}", self.stats);
        Ok(self.stats)
    }

    fn merge_dir(&mut self, upper_dir: &Path, base_dir: &Path) -> MultipackResult<()> {
        let entries = fs::read_dir(upper_dir)
            .map_err(|e| MultipackError::io(format!("reading {}", upper_dir.display()), e))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| MultipackError::io(format!("reading {}", upper_dir.display()), e))?;
            let upper_path = entry.path();
            let base_path = base_dir.join(entry.file_name());
            let upper_meta = metadata(&upper_path)?;

            if is_whiteout(&upper_meta) {
                trace!("whiteout {}", base_path.display());
                remove_entry(&base_path)?;
                self.stats.removed += 1;
                continue;
            }

            let base_meta = match fs::symlink_metadata(&base_path) {
                Ok(meta) => Some(meta),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => {
                    return Err(MultipackError::io(
                        format!("inspecting {}", base_path.display()),
                        e,
                    ))
                }
            };

            match base_meta {
                None => {
                    move_entry(&upper_path, &base_path)?;
                    self.stats.moved += 1;
                }
                Some(_) if !upper_meta.is_dir() => {
                    remove_entry(&base_path)?;
                    copy_entry(&upper_path, &base_path, &upper_meta).map_err(|e| {
                        MultipackError::copy(&upper_path, &base_path, e.to_string())
                    })?;
                    self.stats.copied += 1;
                }
                Some(base_meta) if !base_meta.is_dir() || is_opaque(&upper_path) => {
                    remove_entry(&base_path)?;
                    move_entry(&upper_path, &base_path)?;
                    self.stats.moved += 1;
                }
                Some(_) => {
                    apply_owner_and_mode(&base_path, &upper_meta).map_err(|e| {
                        MultipackError::io(
                            format!("updating attributes of {}", base_path.display()),
                            e,
                        )
                    })?;
                    self.stats.merged_dirs += 1;
                    self.merge_dir(&upper_path, &base_path)?;
                }
            }
        }

        Ok(())
    }
}

/// Whiteouts are character devices with device number 0/0
pub fn is_whiteout(meta: &Metadata) -> bool {
    meta.file_type().is_char_device() && major(meta.rdev()) == 0
}

/// A directory recreated after its lower counterpart was deleted
fn is_opaque(path: &Path) -> bool {
    match xattr::get(path, OPAQUE_XATTR) {
        Ok(Some(value)) => value == b"y",
        Ok(None) => false,
        Err(e) => {
            trace!("Cannot read {} on {}: {}", OPAQUE_XATTR, path.display(), e);
            false
        }
    }
}

fn metadata(path: &Path) -> MultipackResult<Metadata> {
    fs::symlink_metadata(path)
        .map_err(|e| MultipackError::io(format!("inspecting {}", path.display()), e))
}

fn remove_entry(path: &Path) -> MultipackResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| MultipackError::io(format!("removing {}", path.display()), e))
}

fn move_entry(from: &Path, to: &Path) -> MultipackResult<()> {
    fs::rename(from, to).map_err(|e| MultipackError::copy(from, to, e.to_string()))
}

/// Copy a single non-directory entry without following symlinks
fn copy_entry(src: &Path, dest: &Path, meta: &Metadata) -> io::Result<()> {
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        symlink(fs::read_link(src)?, dest)?;
    } else if file_type.is_file() {
        fs::copy(src, dest)?;
    } else {
        let kind = if file_type.is_char_device() {
            SFlag::S_IFCHR
        } else if file_type.is_block_device() {
            SFlag::S_IFBLK
        } else if file_type.is_fifo() {
            SFlag::S_IFIFO
        } else {
            SFlag::S_IFSOCK
        };
        mknod(
            dest,
            kind,
            Mode::from_bits_truncate(meta.mode() & 0o7777),
            meta.rdev(),
        )
        .map_err(io::Error::from)?;
    }

    apply_owner_and_mode(dest, meta)?;

    filetime::set_symlink_file_times(
        dest,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )
}

/// Ownership first; chown clears set-id bits
fn apply_owner_and_mode(path: &Path, meta: &Metadata) -> io::Result<()> {
    lchown(path, Some(meta.uid()), Some(meta.gid()))?;
    if !meta.file_type().is_symlink() {
        fs::set_permissions(path, Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn layers() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        let upper = temp.path().join("upper");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&upper).unwrap();
        (temp, base, upper)
    }

    fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn whiteout(path: &Path) {
        mknod(path, SFlag::S_IFCHR, Mode::empty(), 0).unwrap();
    }

    #[test]
    fn new_entries_are_moved() {
        let (_temp, base, upper) = layers();
        fs::create_dir_all(upper.join("etc/apt")).unwrap();
        fs::write(upper.join("etc/apt/sources.list"), "deb x").unwrap();

        let stats = OverlayMerger::new().merge(&upper, &base).unwrap();

        assert_eq!(fs::read_to_string(base.join("etc/apt/sources.list")).unwrap(), "deb x");
        assert_eq!(stats.moved, 1);
        assert!(!upper.join("etc").exists());
    }

    #[test]
    fn modified_file_replaces_base_with_metadata() {
        let (_temp, base, upper) = layers();
        fs::create_dir(base.join("A")).unwrap();
        fs::create_dir(upper.join("A")).unwrap();
        fs::write(base.join("A/d"), "old").unwrap();
        fs::write(upper.join("A/d"), "new").unwrap();
        fs::set_permissions(upper.join("A/d"), Permissions::from_mode(0o640)).unwrap();
        filetime::set_file_mtime(upper.join("A/d"), FileTime::from_unix_time(1_234_567, 0))
            .unwrap();

        let stats = OverlayMerger::new().merge(&upper, &base).unwrap();

        let meta = fs::metadata(base.join("A/d")).unwrap();
        assert_eq!(fs::read_to_string(base.join("A/d")).unwrap(), "new");
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_234_567);
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.merged_dirs, 1);
    }

    #[test]
    fn symlinks_are_copied_not_followed() {
        let (_temp, base, upper) = layers();
        fs::write(base.join("link"), "regular file").unwrap();
        symlink("/nonexistent/target", upper.join("link")).unwrap();

        OverlayMerger::new().merge(&upper, &base).unwrap();

        let meta = fs::symlink_metadata(base.join("link")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            fs::read_link(base.join("link")).unwrap(),
            Path::new("/nonexistent/target")
        );
    }

    #[test]
    fn file_replaces_directory() {
        let (_temp, base, upper) = layers();
        fs::create_dir_all(base.join("P/inner")).unwrap();
        fs::write(base.join("P/inner/leftover"), "x").unwrap();
        fs::write(upper.join("P"), "now a file").unwrap();

        OverlayMerger::new().merge(&upper, &base).unwrap();

        let meta = fs::symlink_metadata(base.join("P")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read_to_string(base.join("P")).unwrap(), "now a file");
    }

    #[test]
    fn directory_replaces_file() {
        let (_temp, base, upper) = layers();
        fs::write(base.join("P"), "file").unwrap();
        fs::create_dir(upper.join("P")).unwrap();
        fs::write(upper.join("P/child"), "child").unwrap();

        OverlayMerger::new().merge(&upper, &base).unwrap();

        assert!(base.join("P").is_dir());
        assert_eq!(fs::read_to_string(base.join("P/child")).unwrap(), "child");
    }

    #[test]
    fn shared_directory_takes_upper_mode_and_keeps_base_children() {
        let (_temp, base, upper) = layers();
        fs::create_dir(base.join("usr")).unwrap();
        fs::write(base.join("usr/keep"), "keep").unwrap();
        fs::create_dir(upper.join("usr")).unwrap();
        fs::set_permissions(upper.join("usr"), Permissions::from_mode(0o700)).unwrap();
        fs::write(upper.join("usr/added"), "added").unwrap();

        OverlayMerger::new().merge(&upper, &base).unwrap();

        let mode = fs::metadata(base.join("usr")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(base.join("usr/keep").exists());
        assert!(base.join("usr/added").exists());
    }

    #[test]
    fn whiteouts_delete_base_entries() {
        if !is_root() {
            eprintln!("skipping: whiteout device nodes need root");
            return;
        }
        let (_temp, base, upper) = layers();
        fs::create_dir(base.join("A")).unwrap();
        fs::write(base.join("A/b"), "doomed").unwrap();
        fs::write(base.join("A/d"), "old").unwrap();
        fs::create_dir_all(base.join("gone/deep")).unwrap();

        fs::create_dir(upper.join("A")).unwrap();
        whiteout(&upper.join("A/b"));
        fs::write(upper.join("A/c"), "created").unwrap();
        fs::write(upper.join("A/d"), "modified").unwrap();
        whiteout(&upper.join("gone"));

        let stats = OverlayMerger::new().merge(&upper, &base).unwrap();

        assert!(!base.join("A/b").exists());
        assert!(!base.join("gone").exists());
        assert_eq!(fs::read_to_string(base.join("A/c")).unwrap(), "created");
        assert_eq!(fs::read_to_string(base.join("A/d")).unwrap(), "modified");
        assert_eq!(stats.removed, 2);
    }

    #[test]
    fn opaque_directory_replaces_base_children() {
        if !is_root() {
            eprintln!("skipping: trusted xattrs need root");
            return;
        }
        let (_temp, base, upper) = layers();
        fs::create_dir_all(base.join("lib/old")).unwrap();
        fs::write(base.join("lib/stale.so"), "old").unwrap();
        fs::create_dir(upper.join("lib")).unwrap();
        fs::write(upper.join("lib/fresh.so"), "new").unwrap();
        if xattr::set(upper.join("lib"), OPAQUE_XATTR, b"y").is_err() {
            eprintln!("skipping: filesystem rejects trusted xattrs");
            return;
        }

        OverlayMerger::new().merge(&upper, &base).unwrap();

        assert!(!base.join("lib/old").exists());
        assert!(!base.join("lib/stale.so").exists());
        assert_eq!(fs::read_to_string(base.join("lib/fresh.so")).unwrap(), "new");
    }

    #[test]
    fn whiteout_for_missing_entry_is_ignored() {
        if !is_root() {
            eprintln!("skipping: whiteout device nodes need root");
            return;
        }
        let (_temp, base, upper) = layers();
        whiteout(&upper.join("never-existed"));

        OverlayMerger::new().merge(&upper, &base).unwrap();
        assert!(fs::symlink_metadata(base.join("never-existed")).is_err());
    }
}
