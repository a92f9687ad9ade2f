//! Advisory lock over a shared storage root.
//!
//! Two simulations pointed at the same root would corrupt each other's node
//! databases, so a run takes an exclusive, non-blocking `flock(2)` on a
//! marker file inside the root before touching anything else. Contention
//! fails immediately; nothing waits.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Marker file created inside the locked root
pub const LOCK_FILE_NAME: &str = ".simulation.lock";

/// Holder information written into the marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub started_at: String,
}

impl LockMeta {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("data root already locked by another simulation ({path:?}, holder pid {holder_pid:?})")]
    AlreadyLocked {
        path: PathBuf,
        holder_pid: Option<u32>,
    },
    #[error("lock file error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive hold on a storage root, released explicitly or on drop
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirectoryLock {
    /// Take the lock on `root`, creating the marker file if needed
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE_NAME);
        let io_error = |source| LockError::Io { path: path.clone(), source };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        if let Err(err) = try_lock_exclusive(&file) {
            if err.kind() == io::ErrorKind::WouldBlock {
                let holder_pid = read_holder(&mut file).map(|meta| meta.pid);
                return Err(LockError::AlreadyLocked { path: path.clone(), holder_pid });
            }
            return Err(io_error(err));
        }

        write_holder(&mut file, &LockMeta::current()).map_err(io_error)?;
        debug!(path = %path.display(), "acquired directory lock");

        Ok(Self { path, file: Some(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = unlock(&file) {
                warn!(path = %self.path.display(), error = %err, "failed to unlock directory lock");
            }
            debug!(path = %self.path.display(), "released directory lock");
        }
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Release a lock slot that may never have been filled
pub fn release_slot(slot: &mut Option<DirectoryLock>) {
    if let Some(lock) = slot.as_mut() {
        lock.release();
    }
    *slot = None;
}

/// Read the holder recorded in an existing marker file, if any
pub fn read_lock_meta(root: &Path) -> Option<LockMeta> {
    let mut file = File::open(root.join(LOCK_FILE_NAME)).ok()?;
    read_holder(&mut file)
}

fn read_holder(file: &mut File) -> Option<LockMeta> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_holder(file: &mut File, meta: &LockMeta) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut *file, meta).map_err(io::Error::other)?;
    file.flush()?;
    Ok(())
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "directory locks require a unix host"))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}
