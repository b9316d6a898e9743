//! Startup-readiness semaphore keyed by coordination name.
//!
//! A launcher creates the semaphore (count 0) before spawning the worker
//! process and waits on it. The server releases it once, when its control
//! pipe first listens. A missing semaphore on the server side means nobody is
//! waiting, which is not an error.
#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::time::{Duration, Instant};
use tracing::debug;

const WAIT_POLL: Duration = Duration::from_millis(10);

// macOS limits semaphore names to 31 bytes including the leading slash.
const MAX_NAME_BYTES: usize = 30;

/// POSIX named semaphore used to signal server readiness.
pub struct StartupSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
}

// SAFETY: sem_t operations (sem_post, sem_trywait, sem_close) are thread-safe
// by POSIX; the handle is only closed once, in Drop.
unsafe impl Send for StartupSemaphore {}
unsafe impl Sync for StartupSemaphore {}

impl StartupSemaphore {
    /// Create the semaphore for `coordination_name` with a count of zero,
    /// replacing any stale instance.
    pub fn create(coordination_name: &str) -> io::Result<Self> {
        let name = semaphore_name(coordination_name)?;
        // SAFETY:
        // - name is a valid NUL-terminated string that outlives both calls
        // - mode and initial value are passed as c_uint, matching the variadic
        //   promotion sem_open expects
        // - the result is checked against SEM_FAILED below
        let sem = unsafe {
            libc::sem_unlink(name.as_ptr());
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        debug!(name = ?name, "startup semaphore created");
        Ok(Self { sem, name })
    }

    /// Wait up to `timeout` for the server to release the semaphore.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: self.sem is a valid handle from sem_open until Drop.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => return Err(err),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Release the semaphore created by a launcher, if one exists.
    ///
    /// Returns `Ok(false)` when no launcher created it.
    pub fn release_existing(coordination_name: &str) -> io::Result<bool> {
        let name = semaphore_name(coordination_name)?;
        // SAFETY: name is a valid NUL-terminated string; with oflag 0 no
        // variadic arguments are read. The result is checked below.
        let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(false);
            }
            return Err(err);
        }
        // SAFETY: sem is a valid handle returned by sem_open above and is
        // closed exactly once.
        let posted = unsafe { libc::sem_post(sem) };
        let post_err = io::Error::last_os_error();
        // SAFETY: see above.
        unsafe { libc::sem_close(sem) };
        if posted != 0 {
            return Err(post_err);
        }
        Ok(true)
    }
}

impl Drop for StartupSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem came from a successful sem_open and is closed only
        // here; the creator owns the name and unlinks it.
        unsafe {
            libc::sem_close(self.sem);
            libc::sem_unlink(self.name.as_ptr());
        }
    }
}

impl std::fmt::Debug for StartupSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupSemaphore")
            .field("name", &self.name)
            .finish()
    }
}

/// Portable semaphore name for a coordination name.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`. Long names are shortened
/// and suffixed with a hash of the full name to stay unique.
fn semaphore_name(coordination_name: &str) -> io::Result<CString> {
    let cleaned: String = coordination_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let body = if cleaned.len() <= MAX_NAME_BYTES {
        cleaned
    } else {
        let hash = fnv1a(coordination_name.as_bytes());
        format!("{}{:016x}", &cleaned[..MAX_NAME_BYTES - 16], hash)
    };
    CString::new(format!("/{body}")).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_semaphore_name_sanitized() {
        let name = semaphore_name("Lab.Acq/Fake cam").unwrap();
        assert_eq!(name.to_str().unwrap(), "/Lab.Acq_Fake_cam");
    }

    #[test]
    fn test_long_names_stay_short_and_distinct() {
        let a = semaphore_name(&"x".repeat(100)).unwrap();
        let b = semaphore_name(&format!("{}y", "x".repeat(99))).unwrap();
        assert!(a.as_bytes().len() <= MAX_NAME_BYTES + 1);
        assert_ne!(a, b);
    }

    #[test]
    #[serial]
    fn test_release_without_launcher_is_not_an_error() {
        assert!(!StartupSemaphore::release_existing("lab-acq-test-nobody").unwrap());
    }

    #[test]
    #[serial]
    fn test_release_wakes_launcher() {
        let sem = StartupSemaphore::create("lab-acq-test-ready").unwrap();
        assert!(!sem.wait_timeout(Duration::from_millis(20)).unwrap());
        assert!(StartupSemaphore::release_existing("lab-acq-test-ready").unwrap());
        assert!(sem.wait_timeout(Duration::from_secs(1)).unwrap());
    }
}
