//! Durable landing of an uploaded stream.
//!
//! The stream is written to a temporary file inside the work directory,
//! synced, made world readable and then renamed to its final name. The final
//! name therefore either shows a complete, synced file or does not exist.
//! Temporary files are removed on every failure path.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

const TEMP_PREFIX: &str = ".intake-";
const TEMP_SUFFIX: &str = ".part";

#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum LandingError {
    #[error("unable to create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("unable to create temporary file in {}: {source}", .path.display())]
    CreateTemp { path: PathBuf, source: io::Error },
    #[error("unable to save request to temporary file {}: {source}", .path.display())]
    Copy { path: PathBuf, source: io::Error },
    #[error("unable to sync temporary file {}: {source}", .path.display())]
    Sync { path: PathBuf, source: io::Error },
    #[error("unable to change mode of temporary file {}: {source}", .path.display())]
    Permissions { path: PathBuf, source: io::Error },
    #[error("unable to rename temporary file to {}: {source}", .path.display())]
    Rename { path: PathBuf, source: io::Error },
    #[error("{} already exists", .path.display())]
    AlreadyExists { path: PathBuf },
    #[error("unable to sync directory {}: {source}", .path.display())]
    SyncDir { path: PathBuf, source: io::Error },
    #[error("unable to remove temporary file {}: {source}", .path.display())]
    Cleanup { path: PathBuf, source: io::Error },
}

/// What happens when the final name is already taken.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum CollisionPolicy {
    /// The rename replaces the existing file, last landing wins.
    #[default]
    Overwrite,
    /// The landing fails and the existing file is left alone.
    Reject,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LandedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Lands everything readable from `source` as `work_dir/final_name`.
///
/// `work_dir` must already exist, see [`crate::partition::resolve`].
pub fn land<R: Read + ?Sized>(
    work_dir: &Path,
    final_name: &str,
    source: &mut R,
    policy: CollisionPolicy,
) -> Result<LandedFile, LandingError> {
    land_with(work_dir, final_name, source, policy, sync_dir)
}

fn land_with<R, S>(
    work_dir: &Path,
    final_name: &str,
    source: &mut R,
    policy: CollisionPolicy,
    sync_work_dir: S,
) -> Result<LandedFile, LandingError>
where
    R: Read + ?Sized,
    S: FnOnce(&Path) -> io::Result<()>,
{
    let dest = work_dir.join(final_name);

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(work_dir)
        .map_err(|source| LandingError::CreateTemp {
            path: work_dir.to_path_buf(),
            source,
        })?;

    let size = match fill(&mut tmp, source) {
        Ok(size) => size,
        Err(err) => return Err(discard(tmp, err)),
    };

    if policy == CollisionPolicy::Overwrite && fs::symlink_metadata(&dest).is_ok() {
        log::warn!("Replacing existing file {}", dest.display());
    }

    let persisted = match policy {
        CollisionPolicy::Overwrite => tmp.persist(&dest),
        CollisionPolicy::Reject => tmp.persist_noclobber(&dest),
    };
    if let Err(e) = persisted {
        let err = if e.error.kind() == io::ErrorKind::AlreadyExists {
            LandingError::AlreadyExists { path: dest }
        } else {
            LandingError::Rename {
                path: dest,
                source: e.error,
            }
        };
        return Err(discard(e.file, err));
    }

    // The file is visible from here on, so the landing counts as done even
    // if the directory entry could not be flushed.
    if let Err(source) = sync_work_dir(work_dir) {
        log::error!(
            "{}",
            LandingError::SyncDir {
                path: work_dir.to_path_buf(),
                source,
            }
        );
    }

    log::debug!("Landed {} ({} bytes)", dest.display(), size);
    Ok(LandedFile { path: dest, size })
}

/// Copy, sync and chmod, everything before the rename.
fn fill<R: Read + ?Sized>(tmp: &mut NamedTempFile, source: &mut R) -> Result<u64, LandingError> {
    let path = tmp.path().to_path_buf();

    let size = io::copy(source, tmp.as_file_mut()).map_err(|source| LandingError::Copy {
        path: path.clone(),
        source,
    })?;

    tmp.as_file()
        .sync_all()
        .map_err(|source| LandingError::Sync {
            path: path.clone(),
            source,
        })?;

    set_file_mode(tmp.as_file()).map_err(|source| LandingError::Permissions { path, source })?;

    Ok(size)
}

#[cfg(unix)]
fn set_file_mode(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(FILE_MODE))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

/// Flushes the entries of `dir` so files renamed or directories created in
/// it survive a crash.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Reader that fails with `UnexpectedEof` when the stream ends before the
/// announced length, e.g. a `Content-Length` body cut short by a client
/// hanging up. Without a length it passes everything through.
pub struct ExactLength<R> {
    inner: R,
    remaining: Option<u64>,
}

impl<R: Read> ExactLength<R> {
    pub fn new(inner: R, len: Option<u64>) -> Self {
        ExactLength {
            inner,
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactLength<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(remaining) = self.remaining.as_mut() {
            if n == 0 && *remaining > 0 && !buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended {} bytes short", remaining),
                ));
            }
            *remaining = remaining.saturating_sub(n as u64);
        }
        Ok(n)
    }
}

/// Removes the temporary file and hands back the error to report.
fn discard(tmp: NamedTempFile, err: LandingError) -> LandingError {
    let path = tmp.path().to_path_buf();
    match tmp.close() {
        Ok(()) => err,
        Err(e) if e.kind() == io::ErrorKind::NotFound => err,
        Err(source) => {
            log::error!("{}", err);
            LandingError::Cleanup { path, source }
        }
    }
}
