//! Filesystem side of the orchestrator: discovery, atomic rewrites and the
//! pending -> completed promotion.
//!
//! Every write goes to a hidden temp file in the destination directory, is
//! fsynced, then renamed over the target. A pending file is only removed after
//! its completed copy has been renamed into place and the directory synced.

use crate::document::JobDocument;
use crate::error::JobFileError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of checking a pending file against an existing completed copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No completed copy exists; process normally.
    NotNeeded,
    /// A previous run crashed after promotion; the pending copy was removed.
    Recovered,
    /// Both copies exist and disagree; neither was touched.
    Diverged,
}

/// `.json` files directly under `dir`, sorted by name. Hidden temp files are skipped.
pub fn discover(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.tmp", name))
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Write `bytes` to `target` so that readers see either the old or the new
/// content, never a torn file.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), JobFileError> {
    let write_err = |source| JobFileError::Write {
        path: target.to_path_buf(),
        source,
    };
    let temp = temp_path_for(target);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, target)?;
        if let Some(dir) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            sync_dir(dir)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        if temp.exists() {
            let _ = fs::remove_file(&temp);
        }
        return Err(write_err(e));
    }
    Ok(())
}

/// Rewrite the pending file in place with the current in-memory document.
pub fn checkpoint(pending: &Path, document: &JobDocument) -> Result<(), JobFileError> {
    atomic_write(pending, &document.to_pretty_json())?;
    debug!("Checkpointed {}", pending.display());
    Ok(())
}

pub fn completed_path(pending: &Path, done_dir: &Path) -> PathBuf {
    done_dir.join(pending.file_name().unwrap_or_default())
}

/// Durably write the finished document to `done_dir`, then remove the pending file.
pub fn promote(pending: &Path, done_dir: &Path, document: &JobDocument) -> Result<PathBuf, JobFileError> {
    let target = completed_path(pending, done_dir);
    atomic_write(&target, &document.to_pretty_json())?;

    fs::remove_file(pending).map_err(|source| JobFileError::Write {
        path: pending.to_path_buf(),
        source,
    })?;
    Ok(target)
}

/// Detect a promotion interrupted between the completed write and the pending removal.
///
/// `empty_is_missing` must match the extraction setting, since empty slots
/// in the pending copy were then units the completed copy filled.
pub fn recover_interrupted(
    pending: &Path,
    done_dir: &Path,
    empty_is_missing: bool,
) -> Result<Recovery, JobFileError> {
    let completed = completed_path(pending, done_dir);
    if !completed.exists() {
        return Ok(Recovery::NotNeeded);
    }

    let pending_doc = JobDocument::load(pending)?;
    let completed_doc = match JobDocument::load(&completed) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("Completed copy {} is unreadable: {}", completed.display(), e);
            return Ok(Recovery::Diverged);
        }
    };

    if pending_doc.is_filled_by(&completed_doc, empty_is_missing) {
        fs::remove_file(pending).map_err(|source| JobFileError::Write {
            path: pending.to_path_buf(),
            source,
        })?;
        Ok(Recovery::Recovered)
    } else {
        Ok(Recovery::Diverged)
    }
}

/// Move a failed file out of the pending directory.
pub fn move_to(pending: &Path, dir: &Path) -> Result<PathBuf, JobFileError> {
    let target = dir.join(pending.file_name().unwrap_or_default());
    let io_err = |source| JobFileError::Write {
        path: target.clone(),
        source,
    };

    fs::create_dir_all(dir).map_err(io_err)?;
    if fs::rename(pending, &target).is_err() {
        // Cross-device: copy durably, then drop the original
        let bytes = fs::read(pending).map_err(|source| JobFileError::Read {
            path: pending.to_path_buf(),
            source,
        })?;
        atomic_write(&target, &bytes)?;
        fs::remove_file(pending).map_err(io_err)?;
    }
    Ok(target)
}
