//! Temp-write-then-rename file replacement.
//!
//! A staged file lives next to its target as `.<name>.<uuid>.staging` so the
//! final rename never crosses a filesystem boundary. Readers of the target see
//! either the previous contents or the new contents, never a prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const STAGING_SUFFIX: &str = ".staging";

/// Fully written and fsynced staging file that has not replaced its target yet.
#[derive(Debug)]
#[must_use = "a staged write does nothing until committed"]
pub struct StagedWrite {
    staging: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    pub fn write(target: &Path, bytes: &[u8]) -> io::Result<Self> {
        Self::write_with(target, |file| file.write_all(bytes))
    }

    pub fn write_with<F>(target: &Path, fill: F) -> io::Result<Self>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let parent = parent_dir(target);
        fs::create_dir_all(&parent)?;
        let staging = parent.join(format!(
            ".{}.{}{STAGING_SUFFIX}",
            file_name(target),
            Uuid::new_v4()
        ));
        let result = (|| {
            let mut file = create_private(&staging)?;
            fill(&mut file)?;
            file.flush()?;
            file.sync_all()
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(Self {
            staging,
            target: target.to_path_buf(),
        })
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn commit(self) -> io::Result<()> {
        fs::rename(&self.staging, &self.target)?;
        fsync_dir(&parent_dir(&self.target))
    }

    pub fn discard(self) {
        let _ = fs::remove_file(&self.staging);
    }
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    StagedWrite::write(target, bytes)?.commit()
}

/// Remove staging files for `target` left behind by an interrupted write.
pub fn cleanup_orphans(target: &Path) -> usize {
    let prefix = format!(".{}.", file_name(target));
    sweep_staging(&parent_dir(target), |name| name.starts_with(&prefix))
}

/// Remove every staging file in `dir`, whatever its target.
pub fn cleanup_staging_dir(dir: &Path) -> usize {
    sweep_staging(dir, |name| name.starts_with('.'))
}

fn sweep_staging(dir: &Path, matches: impl Fn(&str) -> bool) -> usize {
    let mut removed = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if matches(&name) && name.ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                if fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}

/// Copy `source` to `dest` and flush it to disk.
pub fn durable_copy(source: &Path, dest: &Path) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let copied = fs::copy(source, dest)?;
    File::open(dest)?.sync_all()?;
    fsync_dir(&parent_dir(dest))?;
    Ok(copied)
}

pub fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn create_private(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("data.bin");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn uncommitted_stage_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("data.bin");
        write_atomic(&target, b"stable").unwrap();

        let staged = StagedWrite::write(&target, b"never committed").unwrap();
        assert!(staged.staging_path().exists());
        // the process "dies" here: no commit, no cleanup
        std::mem::forget(staged);

        assert_eq!(fs::read(&target).unwrap(), b"stable");
        assert_eq!(cleanup_orphans(&target), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn directory_sweep_removes_staging_for_any_target() {
        let dir = tempdir().unwrap();
        write_atomic(&dir.path().join("kept.bin"), b"kept").unwrap();
        std::mem::forget(StagedWrite::write(&dir.path().join("a.bin"), b"a").unwrap());
        std::mem::forget(StagedWrite::write(&dir.path().join("b.bin"), b"b").unwrap());

        assert_eq!(cleanup_staging_dir(dir.path()), 2);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["kept.bin".to_string()]);
    }

    #[test]
    fn failed_fill_removes_staging_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("data.bin");
        let err = StagedWrite::write_with(&target, |_| {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn staged_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let target = dir.path().join("secret.bin");
        write_atomic(&target, b"x").unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
