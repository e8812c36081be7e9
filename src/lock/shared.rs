//! Named shared-memory record for one instrument address.
//!
//! Several processes talking to the same physical instrument attach to one
//! small memory-mapped file. It carries:
//!
//! - an owner token and depth used by [`SharedMemoryLock`], a cross-process
//!   reentrant [`ExtraLock`];
//! - the last write and read timestamps used to space transport calls
//!   (see [`crate::transport::SpacedTransport`]);
//! - a user counter so the last process to detach removes the file.
//!
//! # Architecture
//!
//! The file holds a single `#[repr(C)]` header made only of atomics. An all-zero
//! header is a valid empty state, so creating and attaching race-free reduces to
//! `set_len` on an empty file followed by a compare-exchange on the magic number.
//!
//! # Lifecycle
//!
//! [`SharedRecord::attach`] creates or opens the file and increments the user
//! count; dropping the record decrements it and deletes the file when it
//! reaches zero.

use crate::error::{AppResult, DaqError};
use crate::lock::ExtraLock;
use memmap2::{MmapMut, MmapOptions};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic number for header validation
const MAGIC: u64 = 0x1A_B0_1A_B0_00_00_00_01;

/// Size of the shared header in bytes (one cache line)
const HEADER_SIZE: usize = 64;

/// Shared header layout (64 bytes):
/// magic, users, owner, depth, last_write_us, last_read_us (6 x 8) + 16 padding.
#[repr(C)]
struct SharedHeader {
    magic: AtomicU64,
    users: AtomicU64,
    /// `pid << 32 | thread index` of the owner, 0 when free
    owner: AtomicU64,
    depth: AtomicU64,
    /// Microseconds since the Unix epoch, 0 when never written
    last_write_us: AtomicU64,
    last_read_us: AtomicU64,
    _padding: [u8; 16],
}

const _: () = assert!(
    std::mem::size_of::<SharedHeader>() == HEADER_SIZE,
    "SharedHeader size must equal HEADER_SIZE (64 bytes)"
);

/// Token identifying the calling thread across processes.
pub(crate) fn owner_token() -> u64 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static INDEX: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    (u64::from(std::process::id()) << 32) | u64::from(INDEX.with(|i| *i))
}

// =============================================================================
// SharedRecord
// =============================================================================

/// Attachment to a named shared-memory record.
pub struct SharedRecord {
    /// Keeps the mapping alive for `header`
    _mmap: MmapMut,
    /// SAFETY: points to the start of `_mmap`, valid as long as `_mmap` exists
    header: *const SharedHeader,
    path: PathBuf,
}

impl std::fmt::Debug for SharedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRecord")
            .field("path", &self.path)
            .field("users", &self.users())
            .finish()
    }
}

// SAFETY: every field reachable through `header` is atomic, so concurrent access
// from several threads (and processes) is synchronized by the atomics themselves.
unsafe impl Send for SharedRecord {}

// SAFETY: see `Send`; no method hands out non-atomic interior references.
unsafe impl Sync for SharedRecord {}

impl SharedRecord {
    /// File name for an instrument `address`, tagged with the driver `kind`.
    ///
    /// The address is hashed so any resource string maps to a valid file name.
    pub fn path_for(dir: &Path, kind: &str, address: &str) -> PathBuf {
        let digest = Sha256::digest(address.as_bytes());
        let tag: String = digest.iter().take(10).map(|b| format!("{b:02x}")).collect();
        dir.join(format!("instrument-core-{kind}-{tag}.shm"))
    }

    /// Create the record at `path` or attach to an existing one.
    pub fn attach(path: &Path) -> AppResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(HEADER_SIZE as u64)?;
        } else if len != HEADER_SIZE as u64 {
            return Err(DaqError::SharedMemory(format!(
                "{} has {len} bytes, expected {HEADER_SIZE}",
                path.display()
            )));
        }

        // SAFETY: the file is at least HEADER_SIZE bytes and only accessed through
        // atomics by every process mapping it.
        let mut mmap = unsafe { MmapOptions::new().len(HEADER_SIZE).map_mut(&file)? };
        let header = mmap.as_mut_ptr() as *const SharedHeader;

        let record = Self {
            _mmap: mmap,
            header,
            path: path.to_path_buf(),
        };
        let h = record.header();
        match h
            .magic
            .compare_exchange(0, MAGIC, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => debug!(path = %path.display(), "Created shared instrument record"),
            Err(MAGIC) => {}
            Err(other) => {
                return Err(DaqError::SharedMemory(format!(
                    "{} has invalid magic {other:#x}",
                    path.display()
                )))
            }
        }
        h.users.fetch_add(1, Ordering::AcqRel);
        Ok(record)
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of attachments across all processes.
    pub fn users(&self) -> u64 {
        self.header().users.load(Ordering::Acquire)
    }

    /// Last recorded write time, microseconds since the Unix epoch.
    pub fn last_write_us(&self) -> Option<u64> {
        non_zero(self.header().last_write_us.load(Ordering::Acquire))
    }

    /// Last recorded read time, microseconds since the Unix epoch.
    pub fn last_read_us(&self) -> Option<u64> {
        non_zero(self.header().last_read_us.load(Ordering::Acquire))
    }

    /// Record a write at `micros`.
    pub fn set_last_write_us(&self, micros: u64) {
        self.header().last_write_us.store(micros, Ordering::Release);
    }

    /// Record a read at `micros`.
    pub fn set_last_read_us(&self, micros: u64) {
        self.header().last_read_us.store(micros, Ordering::Release);
    }

    fn header(&self) -> &SharedHeader {
        // SAFETY: `header` points into the live mapping owned by `self`.
        unsafe { &*self.header }
    }
}

impl Drop for SharedRecord {
    fn drop(&mut self) {
        let previous = self.header().users.fetch_sub(1, Ordering::AcqRel);
        if previous <= 1 {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Removed shared instrument record"),
                Err(err) => debug!(path = %self.path.display(), error = %err, "Shared record already gone"),
            }
        }
    }
}

fn non_zero(v: u64) -> Option<u64> {
    (v != 0).then_some(v)
}

// =============================================================================
// SharedMemoryLock
// =============================================================================

/// Cross-process reentrant lock stored in a [`SharedRecord`].
#[derive(Debug, Clone)]
pub struct SharedMemoryLock {
    record: Arc<SharedRecord>,
    name: String,
}

impl SharedMemoryLock {
    /// Lock backed by `record`.
    pub fn new(record: Arc<SharedRecord>) -> Self {
        let name = record.path().display().to_string();
        Self { record, name }
    }

    /// Attach to (or create) the record at `path` and lock through it.
    pub fn open(path: &Path) -> AppResult<Self> {
        Ok(Self::new(Arc::new(SharedRecord::attach(path)?)))
    }

    /// The underlying record (shared with transport spacing).
    pub fn record(&self) -> &Arc<SharedRecord> {
        &self.record
    }

    /// Whether any thread in any process holds the lock.
    pub fn is_locked(&self) -> bool {
        self.record.header().owner.load(Ordering::Acquire) != 0
    }
}

impl ExtraLock for SharedMemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&self) -> AppResult<bool> {
        let h = self.record.header();
        let me = owner_token();
        if h.owner.load(Ordering::Acquire) == me {
            h.depth.fetch_add(1, Ordering::AcqRel);
            return Ok(true);
        }
        match h
            .owner
            .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                h.depth.store(1, Ordering::Release);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn release(&self) -> AppResult<()> {
        let h = self.record.header();
        if h.owner.load(Ordering::Acquire) != owner_token() {
            return Err(DaqError::LockNotHeld(self.name.clone()));
        }
        let previous = h.depth.fetch_sub(1, Ordering::AcqRel);
        if previous <= 1 {
            h.depth.store(0, Ordering::Release);
            h.owner.store(0, Ordering::Release);
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        let h = self.record.header();
        if h.owner.load(Ordering::Acquire) == owner_token() {
            h.depth.load(Ordering::Acquire) as usize
        } else {
            0
        }
    }

    fn force_release(&self) -> AppResult<usize> {
        let h = self.record.header();
        let owner = h.owner.swap(0, Ordering::AcqRel);
        let depth = h.depth.swap(0, Ordering::AcqRel);
        Ok(if owner == 0 { 0 } else { depth as usize })
    }
}

impl Drop for SharedMemoryLock {
    fn drop(&mut self) {
        // Only the last handle may clean up a level its thread still holds.
        if Arc::strong_count(&self.record) > 1 {
            return;
        }
        let h = self.record.header();
        if h.owner.load(Ordering::Acquire) == owner_token() {
            warn!(lock = %self.name, "Shared lock dropped while held by this thread; releasing");
            h.depth.store(0, Ordering::Release);
            h.owner.store(0, Ordering::Release);
        }
    }
}
