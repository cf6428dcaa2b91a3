// SPDX-License-Identifier: MIT
//
// Wait-outcome codes for named mutex waits.
//
// The numeric values are the Win32-documented wait results. Both backends
// report through the same constants so host code can hard-wire them.

/// Base code for a satisfied wait; multi-object waits add the index.
pub const WAIT_OBJECT_0: u32 = 0;

/// Base code for acquisition of a mutex whose previous owner died while
/// holding it; multi-object waits add the index.
pub const WAIT_ABANDONED_0: u32 = 0x80;

/// Code for an elapsed timeout.
pub const WAIT_TIMEOUT: u32 = 0x102;

/// Timeout sentinel meaning "block indefinitely".
pub const INFINITE: u32 = 0xFFFF_FFFF;

/// Upper bound on the number of objects in one multi-object wait.
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Result of a successful wait call.
///
/// `Signaled` and `Abandoned` carry the index of the satisfied object
/// within the waited set (always 0 for single-object waits, and for
/// wait-all waits which satisfy the whole set at once). An abandoned
/// acquisition still grants ownership; the caller is warned that state
/// protected by the mutex may be inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The mutex (or, for wait-all, every mutex) was acquired.
    Signaled(u32),
    /// Acquired after the previous owner terminated while holding it.
    Abandoned(u32),
    /// The timeout elapsed before acquisition. Not an error.
    Timeout,
}

impl WaitOutcome {
    /// The platform-documented numeric code for this outcome.
    pub fn code(self) -> u32 {
        match self {
            WaitOutcome::Signaled(i) => WAIT_OBJECT_0 + i,
            WaitOutcome::Abandoned(i) => WAIT_ABANDONED_0 + i,
            WaitOutcome::Timeout => WAIT_TIMEOUT,
        }
    }

    /// Index of the satisfied object; `None` for a timeout.
    pub fn index(self) -> Option<u32> {
        match self {
            WaitOutcome::Signaled(i) | WaitOutcome::Abandoned(i) => Some(i),
            WaitOutcome::Timeout => None,
        }
    }

    /// Whether ownership was acquired (signaled or abandoned).
    pub fn acquired(self) -> bool {
        !matches!(self, WaitOutcome::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_documented_values() {
        assert_eq!(WaitOutcome::Signaled(0).code(), 0);
        assert_eq!(WaitOutcome::Signaled(3).code(), 3);
        assert_eq!(WaitOutcome::Abandoned(0).code(), 0x80);
        assert_eq!(WaitOutcome::Abandoned(2).code(), 0x82);
        assert_eq!(WaitOutcome::Timeout.code(), 0x102);
    }

    #[test]
    fn index_and_acquired() {
        assert_eq!(WaitOutcome::Signaled(5).index(), Some(5));
        assert_eq!(WaitOutcome::Abandoned(1).index(), Some(1));
        assert_eq!(WaitOutcome::Timeout.index(), None);
        assert!(WaitOutcome::Abandoned(0).acquired());
        assert!(!WaitOutcome::Timeout.acquired());
    }
}
