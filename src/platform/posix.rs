// SPDX-License-Identifier: MIT
//
// POSIX backend: named mappings via shm_open/mmap (or a plain file when a
// backing file is requested), named mutexes as robust process-shared
// pthread mutexes stored in a small shm segment derived from the name.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::name;
use crate::wait::{WaitOutcome, INFINITE};

// ---------------------------------------------------------------------------
// Shm-backed region layout
//
// Anonymous (non-file) segments start with a small header holding a
// process-shared AtomicI32 reference counter; the user-visible bytes follow
// at a fixed offset. The offset never depends on any mapping length, so
// handles that attach with a smaller size than the creator's still agree on
// where the counter lives. The last handle to drop unlinks the object,
// giving these segments Windows-like lifetime: the name stops resolving
// once every handle is closed. File-backed segments are the raw file bytes;
// the file persists after close.
// ---------------------------------------------------------------------------

/// Header size; also the alignment the user bytes inherit.
const HEADER_LEN: usize = 16;

fn counted_len(user_len: usize) -> usize {
    HEADER_LEN + user_len
}

/// The reference counter at the head of a counted region.
///
/// # Safety
/// `mem` must point to a live mapping of at least `HEADER_LEN` bytes laid
/// out by `counted_len`.
unsafe fn counter_of(mem: *mut u8) -> &'static AtomicI32 {
    &*(mem as *const AtomicI32)
}

fn mmap_shared(fd: i32, len: usize) -> io::Result<*mut u8> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ShmMode {
    /// Attach only; fail when the name does not resolve.
    Open,
    /// Create when missing, attach otherwise.
    CreateOrAttach,
}

enum Backing {
    /// Named object in the POSIX shm namespace, with trailing counter.
    Shm { posix_name: String },
    /// Regular file kept open for the lifetime of the mapping.
    File { _file: File },
}

/// A mapped region plus the OS resources that keep it alive.
pub struct PlatformSegment {
    mem: *mut u8,
    mapped_len: usize,
    user_len: usize,
    backing: Backing,
    /// Whether our shm_open created the object (exclusive create won).
    created: bool,
    /// Counter value before our own increment; 0 means first mapper.
    prev_ref: i32,
}

// The region is process-shared by design; access through a handle only
// copies bytes.
unsafe impl Send for PlatformSegment {}
unsafe impl Sync for PlatformSegment {}

impl PlatformSegment {
    /// Create-or-attach a named mapping, optionally over a backing file.
    pub fn create(file_name: Option<&Path>, mapping_name: &str, size: u32) -> Result<Self> {
        match file_name {
            Some(path) => Self::create_file_backed(path, size),
            None => Self::acquire_shm(mapping_name, size as usize, ShmMode::CreateOrAttach),
        }
    }

    /// Attach to an existing named mapping in the shm namespace.
    pub fn open(mapping_name: &str, size: u32) -> Result<Self> {
        Self::acquire_shm(mapping_name, size as usize, ShmMode::Open)
    }

    fn create_file_backed(path: &Path, size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| Error::CreateFailed { source })?;

        // Grow the file to the mapping size; larger files are reused as-is.
        let file_len = file
            .metadata()
            .map_err(|source| Error::MapCreateFailed { source })?
            .len();
        if file_len < size as u64 {
            file.set_len(size as u64)
                .map_err(|source| Error::MapCreateFailed { source })?;
        }

        let mem = mmap_shared(file.as_raw_fd(), size as usize)
            .map_err(|source| Error::MapViewFailed { source })?;

        debug!(path = %path.display(), size, "mapped file-backed segment");
        Ok(Self {
            mem,
            mapped_len: size as usize,
            user_len: size as usize,
            backing: Backing::File { _file: file },
            created: file_len == 0,
            prev_ref: 0,
        })
    }

    fn acquire_shm(mapping_name: &str, user_len: usize, mode: ShmMode) -> Result<Self> {
        let posix_name = name::shm_form(mapping_name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|_| Error::invalid_argument("mapping name contains NUL"))?;

        let perms: libc::mode_t = 0o666;
        let mapped_len = counted_len(user_len);

        // Exclusive create first, so ftruncate only ever runs on an object
        // we own; sizing an already-populated object would clobber it.
        let (fd, created) = match mode {
            ShmMode::Open => {
                let fd =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if fd == -1 {
                    return Err(Error::OpenFailed {
                        name: mapping_name.to_string(),
                        source: io::Error::last_os_error(),
                    });
                }
                (fd, false)
            }
            ShmMode::CreateOrAttach => {
                let fd = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if fd != -1 {
                    (fd, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(Error::MapCreateFailed { source: e });
                    }
                    let fd = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if fd == -1 {
                        return Err(Error::MapCreateFailed {
                            source: io::Error::last_os_error(),
                        });
                    }
                    (fd, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if created {
            let ret = unsafe { libc::ftruncate(fd, mapped_len as libc::off_t) };
            if ret != 0 {
                let source = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(Error::MapCreateFailed { source });
            }
        } else {
            // Attaching: the object must already span what we are mapping,
            // otherwise access past its end raises SIGBUS.
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let source = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(Error::MapViewFailed { source });
            }
            if (st.st_size as usize) < mapped_len {
                unsafe { libc::close(fd) };
                return Err(Error::MapViewFailed {
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "existing object is {} bytes, {mapped_len} requested",
                            st.st_size
                        ),
                    ),
                });
            }
        }

        let mapped = mmap_shared(fd, mapped_len);
        unsafe { libc::close(fd) };
        let mem = match mapped {
            Ok(mem) => mem,
            Err(source) => {
                if created {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
                return Err(Error::MapViewFailed { source });
            }
        };

        let prev_ref = unsafe { counter_of(mem).fetch_add(1, Ordering::AcqRel) };

        debug!(name = %posix_name, user_len, created, "mapped shm segment");
        Ok(Self {
            mem,
            mapped_len,
            user_len,
            backing: Backing::Shm { posix_name },
            created,
            prev_ref,
        })
    }

    /// Size of the user-visible region in bytes.
    pub fn user_len(&self) -> usize {
        self.user_len
    }

    fn created(&self) -> bool {
        self.created
    }

    fn first_mapper(&self) -> bool {
        self.prev_ref == 0
    }

    /// Start of the user-visible bytes, past the header where one exists.
    fn base(&self) -> *mut u8 {
        match self.backing {
            Backing::Shm { .. } => unsafe { self.mem.add(HEADER_LEN) },
            Backing::File { .. } => self.mem,
        }
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

    /// Remove a named mapping from the shm namespace. Best effort.
    pub fn remove(mapping_name: &str) {
        let posix_name = name::shm_form(mapping_name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Shm { posix_name } => {
                let prev = unsafe { counter_of(self.mem).fetch_sub(1, Ordering::AcqRel) };
                unsafe { libc::munmap(self.mem as *mut libc::c_void, self.mapped_len) };
                if prev <= 1 {
                    // Last handle anywhere: retire the name.
                    if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
                        unsafe { libc::shm_unlink(c_name.as_ptr()) };
                    }
                }
            }
            Backing::File { .. } => {
                unsafe { libc::munmap(self.mem as *mut libc::c_void, self.mapped_len) };
                // File handle drops with self; the file itself persists.
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Robust mutex support
//
// Linux exposes the robust-mutex calls through libc. macOS has none; there
// the previous-owner-died case cannot be observed, and timed waits are
// emulated by polling because pthread_mutex_timedlock is also missing.
// ---------------------------------------------------------------------------

/// Backoff for polling loops: spin, then yield, then sleep.
fn backoff(step: &mut u32) {
    if *step < 16 {
        std::hint::spin_loop();
        *step += 1;
    } else if *step < 32 {
        std::thread::yield_now();
        *step += 1;
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(not(target_os = "macos"))]
fn abs_timespec(from_now: Duration) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let nanos = ts.tv_nsec as u64 + u64::from(from_now.subsec_nanos());
    ts.tv_sec += from_now.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (nanos % 1_000_000_000) as _;
    ts
}

// ---------------------------------------------------------------------------
// Process-local mutex registry
//
// Every in-process handle to the same named mutex must share one mapping:
// macOS pthreads keep address-relative state inside pthread_mutex_t, so a
// second mapping of the same page at a different address fails to lock.
// ---------------------------------------------------------------------------

struct MutexStorage {
    segment: PlatformSegment,
    local_refs: AtomicUsize,
}

impl MutexStorage {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.segment.base() as *mut libc::pthread_mutex_t
    }
}

type Registry = Mutex<HashMap<String, Arc<MutexStorage>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Initialise the pthread mutex living at the start of `segment`.
fn init_pthread_mutex(segment: &PlatformSegment) -> Result<()> {
    let raw = segment.base() as *mut libc::pthread_mutex_t;
    let check = |eno: libc::c_int| -> Result<()> {
        if eno != 0 {
            return Err(Error::CreateFailed {
                source: io::Error::from_raw_os_error(eno),
            });
        }
        Ok(())
    };

    unsafe {
        ptr::write_bytes(raw, 0, 1);

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut attr))?;

        let attr_result = (|| -> Result<()> {
            check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            // Error-checking type makes a non-owner unlock report EPERM
            // instead of being undefined.
            check(libc::pthread_mutexattr_settype(
                &mut attr,
                libc::PTHREAD_MUTEX_ERRORCHECK,
            ))?;
            #[cfg(not(target_os = "macos"))]
            check(libc::pthread_mutexattr_setrobust(
                &mut attr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            check(libc::pthread_mutex_init(raw, &attr))
        })();
        libc::pthread_mutexattr_destroy(&mut attr);
        attr_result
    }
}

fn registry_acquire(mutex_name: &str, mode: ShmMode) -> Result<(Arc<MutexStorage>, bool)> {
    let mut map = registry().lock().unwrap();
    if let Some(entry) = map.get(mutex_name) {
        entry.local_refs.fetch_add(1, Ordering::Relaxed);
        return Ok((Arc::clone(entry), true));
    }

    let storage_len = std::mem::size_of::<libc::pthread_mutex_t>();
    let segment = match mode {
        ShmMode::Open => PlatformSegment::open(mutex_name, storage_len as u32)?,
        ShmMode::CreateOrAttach => {
            PlatformSegment::acquire_shm(mutex_name, storage_len, ShmMode::CreateOrAttach)?
        }
    };

    let already_existed = !segment.created();
    // First mapper initialises, while the registry lock still blocks any
    // other in-process open of the same name. (A crashed creator can leave
    // the object behind with a zero counter; re-initialising is safe then.)
    if segment.first_mapper() {
        init_pthread_mutex(&segment)?;
    }

    let entry = Arc::new(MutexStorage {
        segment,
        local_refs: AtomicUsize::new(1),
    });
    map.insert(mutex_name.to_string(), Arc::clone(&entry));
    Ok((entry, already_existed))
}

fn registry_release(mutex_name: &str) {
    let mut map = registry().lock().unwrap();
    if let Some(entry) = map.get(mutex_name) {
        if entry.local_refs.fetch_sub(1, Ordering::AcqRel) <= 1 {
            map.remove(mutex_name);
        }
    }
}

fn registry_purge(mutex_name: &str) {
    registry().lock().unwrap().remove(mutex_name);
}

// ---------------------------------------------------------------------------
// PlatformMutex
// ---------------------------------------------------------------------------

enum Grab {
    Locked { abandoned: bool },
    TimedOut,
}

/// A handle to a named inter-process mutex.
pub struct PlatformMutex {
    storage: Arc<MutexStorage>,
    name: String,
}

impl PlatformMutex {
    /// Create the named mutex, attaching if the name already exists.
    /// The second value reports whether it already existed.
    pub fn create(mutex_name: &str) -> Result<(Self, bool)> {
        let (storage, already_existed) = registry_acquire(mutex_name, ShmMode::CreateOrAttach)?;
        debug!(name = mutex_name, already_existed, "created named mutex");
        Ok((
            Self {
                storage,
                name: mutex_name.to_string(),
            },
            already_existed,
        ))
    }

    /// Open an existing named mutex; fails when the name does not resolve.
    pub fn open(mutex_name: &str) -> Result<Self> {
        let (storage, _) = registry_acquire(mutex_name, ShmMode::Open)?;
        Ok(Self {
            storage,
            name: mutex_name.to_string(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.storage.raw()
    }

    /// Non-blocking acquisition attempt.
    fn try_grab(&self) -> Result<Grab> {
        let eno = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        match eno {
            0 => Ok(Grab::Locked { abandoned: false }),
            libc::EBUSY => Ok(Grab::TimedOut),
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => {
                self.mark_consistent()?;
                Ok(Grab::Locked { abandoned: true })
            }
            _ => Err(Error::WaitFailed {
                source: io::Error::from_raw_os_error(eno),
            }),
        }
    }

    /// Acquire with an optional deadline; `None` blocks indefinitely.
    fn grab_until(&self, deadline: Option<Instant>) -> Result<Grab> {
        let Some(deadline) = deadline else {
            return self.grab_blocking();
        };

        #[cfg(not(target_os = "macos"))]
        {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return self.try_grab();
                }
                let ts = abs_timespec(remaining);
                let eno = unsafe { libc::pthread_mutex_timedlock(self.raw(), &ts) };
                match eno {
                    0 => return Ok(Grab::Locked { abandoned: false }),
                    libc::ETIMEDOUT => return Ok(Grab::TimedOut),
                    libc::EOWNERDEAD => {
                        self.mark_consistent()?;
                        return Ok(Grab::Locked { abandoned: true });
                    }
                    libc::EINTR => continue,
                    _ => {
                        return Err(Error::WaitFailed {
                            source: io::Error::from_raw_os_error(eno),
                        })
                    }
                }
            }
        }

        #[cfg(target_os = "macos")]
        {
            let mut step = 0u32;
            loop {
                match self.try_grab()? {
                    Grab::Locked { abandoned } => return Ok(Grab::Locked { abandoned }),
                    Grab::TimedOut => {}
                }
                if Instant::now() >= deadline {
                    return Ok(Grab::TimedOut);
                }
                backoff(&mut step);
            }
        }
    }

    fn grab_blocking(&self) -> Result<Grab> {
        let eno = unsafe { libc::pthread_mutex_lock(self.raw()) };
        match eno {
            0 => Ok(Grab::Locked { abandoned: false }),
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => {
                self.mark_consistent()?;
                Ok(Grab::Locked { abandoned: true })
            }
            _ => Err(Error::WaitFailed {
                source: io::Error::from_raw_os_error(eno),
            }),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn mark_consistent(&self) -> Result<()> {
        warn!(name = %self.name, "recovered mutex abandoned by dead owner");
        let eno = unsafe { libc::pthread_mutex_consistent(self.raw()) };
        if eno != 0 {
            return Err(Error::WaitFailed {
                source: io::Error::from_raw_os_error(eno),
            });
        }
        Ok(())
    }

    /// Wait for ownership. `INFINITE` blocks, `0` polls.
    pub fn wait(&self, timeout_ms: u32) -> Result<WaitOutcome> {
        let grab = if timeout_ms == INFINITE {
            self.grab_until(None)?
        } else if timeout_ms == 0 {
            self.try_grab()?
        } else {
            self.grab_until(Some(Instant::now() + Duration::from_millis(timeout_ms as u64)))?
        };
        Ok(match grab {
            Grab::Locked { abandoned: false } => WaitOutcome::Signaled(0),
            Grab::Locked { abandoned: true } => WaitOutcome::Abandoned(0),
            Grab::TimedOut => WaitOutcome::Timeout,
        })
    }

    /// Release ownership. `EPERM` (not the owner) comes back as `NotOwned`.
    pub fn release(&self) -> Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if eno != 0 {
            return Err(Error::NotOwned {
                source: io::Error::from_raw_os_error(eno),
            });
        }
        Ok(())
    }

    /// Remove the storage behind a named mutex from the system namespace.
    pub fn remove(mutex_name: &str) {
        registry_purge(mutex_name);
        PlatformSegment::remove(mutex_name);
    }
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        // No pthread_mutex_destroy here: other processes may still hold the
        // object, and on macOS the virtual address can already belong to a
        // different mapping by the time the last local handle drops.
        registry_release(&self.name);
    }
}

/// Wait on a set of mutexes; count and handle validity are checked by the
/// caller. Windows satisfies these waits in the kernel; here wait-all is
/// sequential acquisition against a shared deadline with rollback on
/// timeout, and wait-any is a try-lock scan with backoff.
pub fn wait_multiple(
    mutexes: &[&PlatformMutex],
    wait_all: bool,
    timeout_ms: u32,
) -> Result<WaitOutcome> {
    let deadline = match timeout_ms {
        INFINITE => None,
        ms => Some(Instant::now() + Duration::from_millis(ms as u64)),
    };

    if wait_all {
        wait_for_all(mutexes, deadline)
    } else {
        wait_for_any(mutexes, deadline, timeout_ms == 0)
    }
}

fn wait_for_all(mutexes: &[&PlatformMutex], deadline: Option<Instant>) -> Result<WaitOutcome> {
    let mut first_abandoned: Option<u32> = None;

    for (i, mutex) in mutexes.iter().enumerate() {
        match mutex.grab_until(deadline) {
            Ok(Grab::Locked { abandoned }) => {
                if abandoned && first_abandoned.is_none() {
                    first_abandoned = Some(i as u32);
                }
            }
            Ok(Grab::TimedOut) => {
                release_acquired(&mutexes[..i]);
                return Ok(WaitOutcome::Timeout);
            }
            Err(e) => {
                release_acquired(&mutexes[..i]);
                return Err(e);
            }
        }
    }

    Ok(match first_abandoned {
        Some(i) => WaitOutcome::Abandoned(i),
        None => WaitOutcome::Signaled(0),
    })
}

fn release_acquired(acquired: &[&PlatformMutex]) {
    if !acquired.is_empty() {
        warn!(
            count = acquired.len(),
            "rolling back partially acquired wait-all set"
        );
    }
    for mutex in acquired.iter().rev() {
        let _ = mutex.release();
    }
}

fn wait_for_any(
    mutexes: &[&PlatformMutex],
    deadline: Option<Instant>,
    poll_once: bool,
) -> Result<WaitOutcome> {
    let mut step = 0u32;
    loop {
        for (i, mutex) in mutexes.iter().enumerate() {
            match mutex.try_grab()? {
                Grab::Locked { abandoned: false } => return Ok(WaitOutcome::Signaled(i as u32)),
                Grab::Locked { abandoned: true } => return Ok(WaitOutcome::Abandoned(i as u32)),
                Grab::TimedOut => {}
            }
        }
        if poll_once || deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(WaitOutcome::Timeout);
        }
        backoff(&mut step);
    }
}
