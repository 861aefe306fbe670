//! Cross-process advisory device locks.
//!
//! Each enabled device is guarded by an exclusive `flock` on `<lock_dir>/DPU_<i>.lock`
//! for as long as the owning registry lives. A process that finds the lock taken
//! blocks until the holder releases it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::{debug, info};

use crate::error::{LockSnafu, Result};

#[derive(Debug)]
pub struct DeviceLock {
    name: String,
    path: PathBuf,
    file: File,
}

impl DeviceLock {
    /// Lock name of device `index`.
    pub fn name_for(index: usize) -> String {
        format!("DPU_{index}")
    }

    /// Acquire the lock of device `index`, blocking while another process holds it.
    pub fn acquire(lock_dir: &Path, index: usize) -> Result<Self> {
        let (name, path, file) = Self::open(lock_dir, index)?;
        if !flock(&file, libc::LOCK_EX | libc::LOCK_NB).context(LockSnafu { name: name.as_str() })? {
            info!(lock = %name, "waiting for process to release the resource: {name}");
            flock(&file, libc::LOCK_EX).context(LockSnafu { name: name.as_str() })?;
        }
        debug!(lock = %name, path = %path.display(), "device lock acquired");
        Ok(Self { name, path, file })
    }

    /// Acquire the lock of device `index` without blocking; `None` when it is held elsewhere.
    pub fn try_acquire(lock_dir: &Path, index: usize) -> Result<Option<Self>> {
        let (name, path, file) = Self::open(lock_dir, index)?;
        if !flock(&file, libc::LOCK_EX | libc::LOCK_NB).context(LockSnafu { name: name.as_str() })? {
            return Ok(None);
        }
        Ok(Some(Self { name, path, file }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(lock_dir: &Path, index: usize) -> Result<(String, PathBuf, File)> {
        let name = Self::name_for(index);
        let path = lock_dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(LockSnafu { name: name.as_str() })?;
        Ok((name, path, file))
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlocking first keeps the release explicit.
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            debug!(lock = %self.name, error = %e, "device unlock failed");
        }
    }
}

/// Apply `operation` to `file`. Returns `Ok(false)` when a non-blocking request would block.
fn flock(file: &File, operation: libc::c_int) -> io::Result<bool> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EWOULDBLOCK => return Ok(false),
            _ => return Err(err),
        }
    }
}
