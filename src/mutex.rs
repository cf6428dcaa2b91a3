// SPDX-License-Identifier: MIT
//
// Named inter-process mutex: create/open/close lifecycle, single and
// multi-object waits with timeout, release.

use tracing::debug;

use crate::error::{Error, Result};
use crate::platform::{self, PlatformMutex};
use crate::wait::{WaitOutcome, INFINITE, MAX_WAIT_OBJECTS};

/// Whether [`NamedMutex::create`] made a new object or attached to one
/// that already existed under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// The named object did not exist; this call created it.
    Created,
    /// An object of this name already existed; this handle attached to it.
    AlreadyExisted,
}

/// A handle to a system-wide named mutual-exclusion object.
///
/// An instance starts unopened; [`create`](Self::create) or
/// [`open`](Self::open) makes the handle valid, [`close`](Self::close)
/// (or drop) releases it exactly once. Operations on an unopened or
/// closed instance fail with [`Error::InvalidHandle`]. The named OS
/// object may be referenced by any number of instances and processes at
/// once, each through its own handle.
#[derive(Default)]
pub struct NamedMutex {
    inner: Option<PlatformMutex>,
    name: Option<String>,
}

impl NamedMutex {
    /// A new, unopened mutex handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the named mutex in the unowned state.
    ///
    /// If an object of that name already exists the OS hands back the
    /// existing one; the returned [`CreateDisposition`] says which case
    /// occurred, since the two are indistinguishable otherwise.
    pub fn create(&mut self, name: &str) -> Result<CreateDisposition> {
        self.check_unopened(name)?;
        let (inner, already_existed) = PlatformMutex::create(name)?;
        self.inner = Some(inner);
        self.name = Some(name.to_string());
        Ok(if already_existed {
            CreateDisposition::AlreadyExisted
        } else {
            CreateDisposition::Created
        })
    }

    /// Open an existing named mutex with synchronization-only access.
    pub fn open(&mut self, name: &str) -> Result<()> {
        self.check_unopened(name)?;
        self.inner = Some(PlatformMutex::open(name)?);
        self.name = Some(name.to_string());
        Ok(())
    }

    fn check_unopened(&self, name: &str) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::invalid_argument("mutex handle is already open"));
        }
        if name.is_empty() {
            return Err(Error::invalid_argument("mutex name is empty"));
        }
        Ok(())
    }

    /// Release the handle. Idempotent; a no-op on an unopened instance.
    /// Closing does not release ownership acquired through a wait.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            if let Some(name) = self.name.take() {
                debug!(name, "closed mutex handle");
            }
        }
    }

    /// Whether the instance currently holds a valid handle.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// The mutex name, while open.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Block until the mutex is acquired, the timeout elapses, or an
    /// abandoned acquisition occurs. `timeout_ms` of [`INFINITE`] blocks
    /// indefinitely; `0` polls. A timeout is a successful
    /// [`WaitOutcome::Timeout`], never an error.
    pub fn wait(&self, timeout_ms: u32) -> Result<WaitOutcome> {
        self.inner.as_ref().ok_or(Error::InvalidHandle)?.wait(timeout_ms)
    }

    /// [`wait`](Self::wait) with an infinite timeout.
    pub fn wait_infinite(&self) -> Result<WaitOutcome> {
        self.wait(INFINITE)
    }

    /// Wait on an ordered set of mutexes.
    ///
    /// With `wait_all` the call returns [`WaitOutcome::Signaled`] only
    /// once every mutex in the set is held (index 0); on timeout nothing
    /// in the set remains held. Without it the call returns as soon as
    /// any one mutex is acquired, and the outcome carries its index.
    ///
    /// The set must contain between 1 and [`MAX_WAIT_OBJECTS`] open
    /// handles; an empty or oversized set fails with
    /// [`Error::InvalidArgument`], an unopened handle with
    /// [`Error::InvalidHandle`].
    pub fn wait_multiple(
        mutexes: &[&NamedMutex],
        wait_all: bool,
        timeout_ms: u32,
    ) -> Result<WaitOutcome> {
        if mutexes.is_empty() || mutexes.len() > MAX_WAIT_OBJECTS {
            return Err(Error::invalid_argument(format!(
                "wait set must hold 1..={MAX_WAIT_OBJECTS} mutexes, got {}",
                mutexes.len()
            )));
        }
        let handles: Vec<&PlatformMutex> = mutexes
            .iter()
            .map(|m| m.inner.as_ref().ok_or(Error::InvalidHandle))
            .collect::<Result<_>>()?;

        platform::wait_multiple(&handles, wait_all, timeout_ms)
    }

    /// Release ownership acquired by a prior wait. Fails with
    /// [`Error::NotOwned`] when the calling context does not hold the
    /// mutex; that is a caller bug surfaced, not swallowed.
    pub fn release(&self) -> Result<()> {
        self.inner.as_ref().ok_or(Error::InvalidHandle)?.release()
    }

    /// Remove the storage behind a named mutex from the system namespace
    /// without an open handle. Best effort; a no-op where the object dies
    /// with its last handle anyway.
    pub fn remove(name: &str) {
        PlatformMutex::remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn unopened_mutex_reports_invalid_handle() {
        let mtx = NamedMutex::new();
        assert_eq!(mtx.wait(0).unwrap_err().kind(), ErrorKind::InvalidHandle);
        assert_eq!(mtx.release().unwrap_err().kind(), ErrorKind::InvalidHandle);
        assert!(!mtx.is_open());
    }

    #[test]
    fn close_on_unopened_is_a_noop() {
        let mut mtx = NamedMutex::new();
        mtx.close();
        mtx.close();
        assert!(!mtx.is_open());
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut mtx = NamedMutex::new();
        assert_eq!(
            mtx.create("").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(mtx.open("").unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn empty_wait_set_is_rejected() {
        let err = NamedMutex::wait_multiple(&[], false, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn unopened_member_fails_wait_multiple() {
        let mtx = NamedMutex::new();
        let err = NamedMutex::wait_multiple(&[&mtx], false, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }
}
