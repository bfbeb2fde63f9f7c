//! Create-exclusive lock files and atomic replacement writes.

use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::{
    error::{ProcessError, io_err},
    paths::sibling,
};

/// Create `path` only if it does not exist, writing `contents` into it.
///
/// Returns false when the file already exists.
pub(crate) fn create_exclusive(path: &Path, contents: &str) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Contents of `path`, or `None` if it does not exist.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Time since `path` was last modified, or `None` if it does not exist.
pub(crate) fn file_age(path: &Path) -> io::Result<Option<Duration>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified()?;
            Ok(Some(
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO),
            ))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove `path`; a missing file is not an error.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replace `path` by writing a sibling `.tmp` file and renaming it over.
///
/// With `mode` set the file is created with those unix permission bits.
pub(crate) fn write_atomic(
    path: &Path,
    bytes: &[u8],
    mode: Option<u32>,
) -> Result<(), ProcessError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = sibling(path, ".tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }

    let mut file = options.open(&tmp).map_err(|e| io_err(&tmp, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // a leftover tmp file keeps its old bits despite OpenOptions::mode
        if let Some(mode) = mode {
            fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
                .map_err(|e| io_err(&tmp, e))?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    file.write_all(bytes).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

/// A held lock file, removed on release or drop.
///
/// Release only removes the file while it still carries this holder's
/// token, so a lock reclaimed by someone else is left alone.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    token: String,
    held: bool,
}

impl LockFile {
    /// Try to take the lock once.
    pub(crate) fn try_acquire(path: &Path, token: String) -> Result<Option<Self>, ProcessError> {
        if create_exclusive(path, &token).map_err(|e| io_err(path, e))? {
            Ok(Some(Self {
                path: path.to_path_buf(),
                token,
                held: true,
            }))
        } else {
            Ok(None)
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now.
    ///
    /// # Errors
    /// Returns error if the lock file cannot be read or removed.
    pub fn release(mut self) -> Result<(), ProcessError> {
        self.release_inner().map_err(|e| io_err(&self.path, e))
    }

    fn release_inner(&mut self) -> io::Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match read_optional(&self.path)? {
            Some(contents) if contents.trim() == self.token => {
                remove_if_exists(&self.path)?;
            }
            Some(_) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "lock was taken over; leaving it in place"
                );
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
