//! Exclusive advisory locks on a single file, via `flock(2)`.
//!
//! `flock` locks belong to the open file description, so a second handle to
//! the same path conflicts even inside one process, and closing the last
//! descriptor releases the lock.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context as _;

/// Try to take an exclusive lock without blocking.
///
/// Returns `Ok(false)` when another open file description holds a
/// conflicting lock.
pub fn try_lock<F: AsRawFd>(file: &F) -> io::Result<bool> {
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(true),
        _ => {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EWOULDBLOCK) => Ok(false),
                _ => Err(error),
            }
        }
    }
}

pub fn unlock<F: AsRawFd>(file: &F) -> io::Result<()> {
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Check whether some other process holds a lock on `path`.
///
/// Opens the file read-only, so it must already exist and is never modified.
/// A lock taken by the probe itself is dropped before returning.
pub fn is_locked(path: &Path) -> anyhow::Result<bool> {
    let file = File::open(path).with_context(|| anyhow!("Failed to open {}", path.display()))?;

    if try_lock(&file).with_context(|| anyhow!("Failed to probe lock on {}", path.display()))? {
        unlock(&file)?;
        Ok(false)
    } else {
        Ok(true)
    }
}

/// An open, exclusively locked, truncated file.
///
/// The lock is released by [`LockedFile::release`], or on drop for every
/// other path out of the owner's scope.
pub struct LockedFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockedFile {
    /// Open `path` read-write (creating it if needed), lock it and truncate it.
    ///
    /// Truncation happens only after the lock is held, so a file locked by
    /// someone else keeps its content.
    pub fn acquire(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| anyhow!("Failed to open {}", path.display()))?;

        log::debug!("opened {} fd={}", path.display(), file.as_raw_fd());

        if !try_lock(&file).with_context(|| anyhow!("Failed to lock {}", path.display()))? {
            return Err(anyhow!(
                "{} is already locked by another process",
                path.display()
            ));
        }

        file.set_len(0)
            .with_context(|| anyhow!("Failed to truncate {}", path.display()))?;

        log::info!("holding exclusive lock on {}", path.display());

        Ok(LockedFile {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and close the file.
    pub fn release(mut self) -> anyhow::Result<()> {
        match self.file.take() {
            Some(file) => {
                unlock(&file).with_context(|| anyhow!("Failed to unlock {}", self.path.display()))?;
                log::info!("released lock on {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            log::debug!("dropping lock on {}", self.path.display());
            let _ = unlock(&file);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn acquire_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockme.txt");

        let lock = LockedFile::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        lock.release().unwrap();
    }

    #[test]
    fn acquire_truncates_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"previous content").unwrap();

        let _lock = LockedFile::acquire(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn second_acquire_fails_and_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared");

        let lock = LockedFile::acquire(&path).unwrap();
        fs::write(&path, b"written while held").unwrap();

        let error = LockedFile::acquire(&path).err().expect("second lock must fail");
        assert!(error.to_string().contains("already locked"));
        assert_eq!(fs::read(&path).unwrap(), b"written while held");

        lock.release().unwrap();
        LockedFile::acquire(&path).unwrap();
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped");

        {
            let _lock = LockedFile::acquire(&path).unwrap();
            assert!(is_locked(&path).unwrap());
        }

        assert!(!is_locked(&path).unwrap());
    }

    #[test]
    fn is_locked_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");

        assert!(is_locked(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn acquire_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LockedFile::acquire(dir.path()).is_err());
    }
}
