// SPDX-License-Identifier: MIT
//
// Named cross-process shared memory mappings and mutexes.

//! Cross-process shared memory and named mutual exclusion.
//!
//! Two primitives, each a thin owner of one OS facility:
//!
//! - [`SharedMemorySegment`] creates or opens a named, fixed-size memory
//!   region (optionally backed by a file), maps it read/write, and copies
//!   byte ranges in and out with full bounds checking.
//! - [`NamedMutex`] creates or opens a system-wide named mutex and
//!   supports single- and multi-object waits with timeout, plus release.
//!
//! Nothing flows between them internally; a caller composes them, for
//! example guarding segment writes with a mutex:
//!
//! ```no_run
//! use filemap::{NamedMutex, SharedMemorySegment, wait};
//!
//! # fn main() -> filemap::Result<()> {
//! let mut seg = SharedMemorySegment::new();
//! seg.create(None, "sensor_frame", 4096)?;
//!
//! let mut lock = NamedMutex::new();
//! lock.create("sensor_frame_lock")?;
//!
//! lock.wait(wait::INFINITE)?;
//! seg.write(0, b"reading", 0, 7)?;
//! lock.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! Wait results use the platform-documented numeric codes (see the
//! [`wait`] module), so hosts binding these primitives can rely on the
//! well-known constants. Timeouts are successful outcomes, not errors;
//! every error carries its kind and the originating OS error code.

#![warn(missing_docs)]

mod error;
pub use error::{Error, ErrorKind, Result};

pub mod wait;
pub use wait::WaitOutcome;

#[cfg(unix)]
mod name;

mod platform;

mod segment;
pub use segment::SharedMemorySegment;

mod mutex;
pub use mutex::{CreateDisposition, NamedMutex};
