// SPDX-License-Identifier: MIT
//
// Windows backend: named file mappings via CreateFileMapping/MapViewOfFile,
// named kernel mutexes via CreateMutex/WaitForMultipleObjects.

use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use tracing::debug;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_FAILED,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, OPEN_ALWAYS,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateMutexW, OpenMutexW, ReleaseMutex, WaitForMultipleObjects, WaitForSingleObject,
};

use crate::error::{Error, Result};
use crate::wait::{WaitOutcome, MAX_WAIT_OBJECTS, WAIT_ABANDONED_0, WAIT_OBJECT_0, WAIT_TIMEOUT};

// Not re-exported by the feature set we enable.
const SYNCHRONIZE: u32 = 0x0010_0000;

/// Null-terminated UTF-16 for Win32 name parameters.
fn to_wide(s: &std::ffi::OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

fn wide_name(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Kernel handle released exactly once on drop, on every exit path.
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn get(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSegment
// ---------------------------------------------------------------------------

/// A mapped view of a named file-mapping object, plus its handles.
pub struct PlatformSegment {
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    user_len: usize,
    // Held for the lifetime of the mapping; dropped (closed) on unmap.
    _mapping: OwnedHandle,
    _file: Option<OwnedHandle>,
}

unsafe impl Send for PlatformSegment {}
unsafe impl Sync for PlatformSegment {}

impl PlatformSegment {
    /// Create (or attach to) a named mapping, optionally over a backing file.
    pub fn create(file_name: Option<&Path>, mapping_name: &str, size: u32) -> Result<Self> {
        let file = match file_name {
            Some(path) => {
                let wide = to_wide(path.as_os_str());
                let h = unsafe {
                    CreateFileW(
                        wide.as_ptr(),
                        GENERIC_READ | GENERIC_WRITE,
                        0,
                        ptr::null(),
                        OPEN_ALWAYS,
                        FILE_ATTRIBUTE_NORMAL,
                        ptr::null_mut(),
                    )
                };
                if h == INVALID_HANDLE_VALUE {
                    return Err(Error::CreateFailed {
                        source: io::Error::last_os_error(),
                    });
                }
                Some(OwnedHandle(h))
            }
            None => None,
        };

        let name = wide_name(mapping_name);
        let backing = file.as_ref().map_or(INVALID_HANDLE_VALUE, |f| f.get());
        let mapping = unsafe {
            CreateFileMappingW(backing, ptr::null(), PAGE_READWRITE, 0, size, name.as_ptr())
        };
        if mapping.is_null() {
            return Err(Error::MapCreateFailed {
                source: io::Error::last_os_error(),
            });
        }
        let mapping = OwnedHandle(mapping);

        let view = unsafe { MapViewOfFile(mapping.get(), FILE_MAP_ALL_ACCESS, 0, 0, size as usize) };
        if view.Value.is_null() {
            return Err(Error::MapViewFailed {
                source: io::Error::last_os_error(),
            });
        }

        debug!(name = mapping_name, size, "created file mapping");
        Ok(Self {
            view,
            user_len: size as usize,
            _mapping: mapping,
            _file: file,
        })
    }

    /// Open an existing named mapping and map `size` bytes of it.
    pub fn open(mapping_name: &str, size: u32) -> Result<Self> {
        let name = wide_name(mapping_name);
        let mapping = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, name.as_ptr()) };
        if mapping.is_null() {
            return Err(Error::OpenFailed {
                name: mapping_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let mapping = OwnedHandle(mapping);

        let view = unsafe { MapViewOfFile(mapping.get(), FILE_MAP_ALL_ACCESS, 0, 0, size as usize) };
        if view.Value.is_null() {
            return Err(Error::MapViewFailed {
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            view,
            user_len: size as usize,
            _mapping: mapping,
            _file: None,
        })
    }

    /// Size of the user-visible region in bytes.
    pub fn user_len(&self) -> usize {
        self.user_len
    }

    fn base(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }

    /// Copy `src` into the region at `offset`.
    /// Caller has already checked `offset + src.len() <= user_len`.
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.user_len);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
        }
    }

    /// Copy from the region at `offset` into `dest`.
    /// Caller has already checked `offset + dest.len() <= user_len`.
    pub fn copy_out(&self, offset: usize, dest: &mut [u8]) {
        debug_assert!(offset + dest.len() <= self.user_len);
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(offset), dest.as_mut_ptr(), dest.len());
        }
    }

    /// Mapping objects die with their last handle on Windows; nothing to do.
    pub fn remove(_mapping_name: &str) {}
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        if !self.view.Value.is_null() {
            unsafe { UnmapViewOfFile(self.view) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex
// ---------------------------------------------------------------------------

/// A handle to a named kernel mutex.
pub struct PlatformMutex {
    handle: OwnedHandle,
}

unsafe impl Send for PlatformMutex {}
unsafe impl Sync for PlatformMutex {}

impl PlatformMutex {
    /// Create the named mutex, unowned. Attaches when the name exists;
    /// the second value reports whether it already existed.
    pub fn create(mutex_name: &str) -> Result<(Self, bool)> {
        let name = wide_name(mutex_name);
        let h = unsafe { CreateMutexW(ptr::null(), 0, name.as_ptr()) };
        if h.is_null() {
            return Err(Error::CreateFailed {
                source: io::Error::last_os_error(),
            });
        }
        let already_existed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        debug!(name = mutex_name, already_existed, "created named mutex");
        Ok((
            Self {
                handle: OwnedHandle(h),
            },
            already_existed,
        ))
    }

    /// Open an existing named mutex with synchronization-only access.
    pub fn open(mutex_name: &str) -> Result<Self> {
        let name = wide_name(mutex_name);
        let h = unsafe { OpenMutexW(SYNCHRONIZE, 0, name.as_ptr()) };
        if h.is_null() {
            return Err(Error::OpenFailed {
                name: mutex_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            handle: OwnedHandle(h),
        })
    }

    /// Wait for ownership. `INFINITE` blocks, `0` polls.
    pub fn wait(&self, timeout_ms: u32) -> Result<WaitOutcome> {
        let ret = unsafe { WaitForSingleObject(self.handle.get(), timeout_ms) };
        decode_wait(ret, 1)
    }

    /// Release ownership; `ERROR_NOT_OWNER` comes back as `NotOwned`.
    pub fn release(&self) -> Result<()> {
        if unsafe { ReleaseMutex(self.handle.get()) } == 0 {
            return Err(Error::NotOwned {
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Kernel mutexes die with their last handle; nothing to remove.
    pub fn remove(_mutex_name: &str) {}
}

/// Wait on a set of mutexes; count and handle validity are checked by the
/// caller. The kernel satisfies both wait-all and wait-any natively.
pub fn wait_multiple(
    mutexes: &[&PlatformMutex],
    wait_all: bool,
    timeout_ms: u32,
) -> Result<WaitOutcome> {
    // Bounded scratch array; the surface rejects sets above MAX_WAIT_OBJECTS.
    let mut handles = [ptr::null_mut::<core::ffi::c_void>(); MAX_WAIT_OBJECTS];
    for (slot, mutex) in handles.iter_mut().zip(mutexes) {
        *slot = mutex.handle.get();
    }

    let ret = unsafe {
        WaitForMultipleObjects(
            mutexes.len() as u32,
            handles.as_ptr(),
            i32::from(wait_all),
            timeout_ms,
        )
    };
    decode_wait(ret, mutexes.len() as u32)
}

fn decode_wait(ret: u32, count: u32) -> Result<WaitOutcome> {
    if ret == WAIT_FAILED {
        return Err(Error::WaitFailed {
            source: io::Error::last_os_error(),
        });
    }
    if ret == WAIT_TIMEOUT {
        return Ok(WaitOutcome::Timeout);
    }
    if (WAIT_OBJECT_0..WAIT_OBJECT_0 + count).contains(&ret) {
        return Ok(WaitOutcome::Signaled(ret - WAIT_OBJECT_0));
    }
    if (WAIT_ABANDONED_0..WAIT_ABANDONED_0 + count).contains(&ret) {
        return Ok(WaitOutcome::Abandoned(ret - WAIT_ABANDONED_0));
    }
    Err(Error::WaitFailed {
        source: io::Error::new(
            io::ErrorKind::Other,
            format!("unexpected wait result {ret:#x}"),
        ),
    })
}
