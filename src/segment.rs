// SPDX-License-Identifier: MIT
//
// Named shared-memory segment: create/open/close lifecycle plus
// bounds-checked byte-range copies against the mapped region.

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::platform::PlatformSegment;

/// A named, fixed-size shared memory region mapped into this process.
///
/// An instance starts unopened; [`create`](Self::create) or
/// [`open`](Self::open) transitions it to mapped, and
/// [`close`](Self::close) (or drop) releases every OS handle exactly once.
/// Operations on an unopened or closed instance fail with
/// [`Error::InvalidHandle`].
///
/// The segment itself provides no ordering guarantees between processes;
/// callers serialize access with a [`NamedMutex`](crate::NamedMutex).
#[derive(Default)]
pub struct SharedMemorySegment {
    inner: Option<PlatformSegment>,
    mapping_name: Option<String>,
}

impl SharedMemorySegment {
    /// A new, unopened segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named mapping of `size` bytes and map it read/write.
    ///
    /// With a `file_name` the mapping is backed by that file, opened or
    /// created as needed and grown to `size` if smaller; the file handle
    /// is held until [`close`](Self::close). Without one the region lives
    /// purely in the page cache. If an object of the same name already
    /// exists, this attaches to it, matching the underlying OS semantics.
    pub fn create(
        &mut self,
        file_name: Option<&Path>,
        mapping_name: &str,
        size: u32,
    ) -> Result<()> {
        self.check_unmapped(mapping_name, size)?;
        self.inner = Some(PlatformSegment::create(file_name, mapping_name, size)?);
        self.mapping_name = Some(mapping_name.to_string());
        Ok(())
    }

    /// Map `size` bytes of an existing named mapping, read/write.
    pub fn open(&mut self, mapping_name: &str, size: u32) -> Result<()> {
        self.check_unmapped(mapping_name, size)?;
        self.inner = Some(PlatformSegment::open(mapping_name, size)?);
        self.mapping_name = Some(mapping_name.to_string());
        Ok(())
    }

    fn check_unmapped(&self, mapping_name: &str, size: u32) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::invalid_argument("segment is already mapped"));
        }
        if mapping_name.is_empty() {
            return Err(Error::invalid_argument("mapping name is empty"));
        }
        if size == 0 {
            return Err(Error::invalid_argument("mapping size is 0"));
        }
        Ok(())
    }

    /// Release the mapping and any backing-file handle. Idempotent; a
    /// no-op on an unopened instance.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            if let Some(name) = self.mapping_name.take() {
                debug!(name, "closed segment");
            }
        }
    }

    /// Whether the instance currently holds a live mapping.
    pub fn is_mapped(&self) -> bool {
        self.inner.is_some()
    }

    /// Mapped size in bytes; 0 when unopened or closed.
    pub fn size(&self) -> u32 {
        self.inner.as_ref().map_or(0, |s| s.user_len() as u32)
    }

    /// The mapping name, while mapped.
    pub fn name(&self) -> Option<&str> {
        self.mapping_name.as_deref()
    }

    /// Copy `len` bytes from `source[source_offset..]` into the region at
    /// `dest_offset`. Both ranges are checked before anything is copied;
    /// a violation fails with [`Error::OutOfRange`] and leaves the region
    /// untouched.
    pub fn write(
        &mut self,
        dest_offset: u32,
        source: &[u8],
        source_offset: u32,
        len: u32,
    ) -> Result<()> {
        let segment = self.inner.as_ref().ok_or(Error::InvalidHandle)?;
        checked_range(dest_offset, len, segment.user_len())?;
        checked_range(source_offset, len, source.len())?;

        let start = source_offset as usize;
        segment.copy_in(dest_offset as usize, &source[start..start + len as usize]);
        Ok(())
    }

    /// Copy `len` bytes from the region at `offset` into the start of
    /// `dest`. Same bounds contract as [`write`](Self::write).
    pub fn read(&self, offset: u32, len: u32, dest: &mut [u8]) -> Result<()> {
        let segment = self.inner.as_ref().ok_or(Error::InvalidHandle)?;
        checked_range(offset, len, segment.user_len())?;
        if len as usize > dest.len() {
            return Err(Error::OutOfRange {
                offset: 0,
                len,
                limit: dest.len(),
            });
        }

        segment.copy_out(offset as usize, &mut dest[..len as usize]);
        Ok(())
    }

    /// Remove a named mapping from the system namespace without an open
    /// handle. Best effort; a no-op where objects die with their last
    /// handle anyway.
    pub fn remove(mapping_name: &str) {
        PlatformSegment::remove(mapping_name);
    }
}

/// Reject `offset + len` ranges that overflow or exceed `limit`.
fn checked_range(offset: u32, len: u32, limit: usize) -> Result<()> {
    let end = u64::from(offset) + u64::from(len);
    if end > limit as u64 {
        return Err(Error::OutOfRange { offset, len, limit });
    }
    Ok(())
}
