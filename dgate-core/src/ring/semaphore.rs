//! Named POSIX semaphores coordinating the two processes.
//!
//! The reader creates both semaphores (unlinking stale instances first) and
//! owns their names; the external generator attaches to them. Waits retry
//! on EINTR; every other failure is fatal.

use std::ffi::CString;

use crate::error::{DgateError, Result};

/// A named counting semaphore shared between processes.
#[derive(Debug)]
pub struct NamedSemaphore {
    name: CString,
    sem: *mut libc::sem_t,
    owner: bool,
}

// Safety: POSIX semaphore operations are async-signal-safe and thread-safe;
// the handle holds no thread-local state.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates the semaphore under `name` with the given initial count,
    /// discarding any stale instance of the same name first.
    ///
    /// The returned handle owns the name and unlinks it on drop.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        // A leftover semaphore from a crashed run would carry a stale
        // count; failure to unlink a missing name is expected.
        unsafe { libc::sem_unlink(c_name.as_ptr()) };

        let sem = unsafe {
            libc::sem_open(c_name.as_ptr(), libc::O_CREAT, 0o666 as libc::c_uint, initial)
        };
        if sem == libc::SEM_FAILED {
            return Err(DgateError::last_os_error("sem_open"));
        }

        tracing::debug!(name, initial, "created semaphore");
        Ok(Self {
            name: c_name,
            sem,
            owner: true,
        })
    }

    /// Attaches to an existing semaphore, as the producing side does.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = Self::c_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(DgateError::last_os_error("sem_open"));
        }
        Ok(Self {
            name: c_name,
            sem,
            owner: false,
        })
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(DgateError::Resource {
                    op: "sem_wait",
                    source: err,
                });
            }
        }
    }

    /// Decrements the count if it is positive; returns whether it was.
    pub fn try_wait(&self) -> Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            _ => Err(DgateError::Resource {
                op: "sem_trywait",
                source: err,
            }),
        }
    }

    /// Increments the count, waking one waiter.
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(DgateError::last_os_error("sem_post"));
        }
        Ok(())
    }

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name)
            .map_err(|_| DgateError::InvalidLayout(format!("semaphore name {name:?} contains NUL")))
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
        if self.owner {
            tracing::debug!(name = ?self.name, "unlinking semaphore");
            unsafe { libc::sem_unlink(self.name.as_ptr()) };
        }
    }
}
