// SPDX-License-Identifier: MIT

#[cfg(unix)]
mod posix;

#[cfg(windows)]
mod windows;

// One backend per target, re-exported under uniform names.

#[cfg(unix)]
pub(crate) use posix::{wait_multiple, PlatformMutex, PlatformSegment};

#[cfg(windows)]
pub(crate) use windows::{wait_multiple, PlatformMutex, PlatformSegment};
