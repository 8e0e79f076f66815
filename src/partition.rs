//! Date partitioned work directories: `<root>/YYYY/MM/DD`.

use std::fs::DirBuilder;
use std::path::{Path, PathBuf};

use chrono::Datelike;

use crate::landing::{self, LandingError};

#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

pub fn work_dir_path<T: Datelike>(root_dir: &Path, today: &T) -> PathBuf {
    root_dir
        .join(format!("{:04}", today.year()))
        .join(format!("{:02}", today.month()))
        .join(format!("{:02}", today.day()))
}

/// `dir` and those of its ancestors that do not exist yet, deepest first.
fn missing_dirs(dir: &Path) -> Vec<PathBuf> {
    dir.ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .map(Path::to_path_buf)
        .collect()
}

/// Returns the work directory for `today`, creating it and any missing
/// ancestors. An existing directory, including one created concurrently by
/// another request, is not an error. The parent of every newly created
/// directory is synced so the new entries survive a crash.
pub fn resolve<T: Datelike>(root_dir: &Path, today: &T) -> Result<PathBuf, LandingError> {
    let work_dir = work_dir_path(root_dir, today);
    if work_dir.is_dir() {
        return Ok(work_dir);
    }
    let created = missing_dirs(&work_dir);

    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }

    builder
        .create(&work_dir)
        .map_err(|source| LandingError::CreateDir {
            path: work_dir.clone(),
            source,
        })?;

    for dir in &created {
        if let Some(parent) = dir.parent() {
            landing::sync_dir(parent).map_err(|source| LandingError::SyncDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    Ok(work_dir)
}
