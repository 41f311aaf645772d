//! Cross-process watchdog heartbeat channel.
//!
//! One shared file (normally under `/dev/shm`) mapped by both the main
//! process and the watchdog process. It starts with a 64-byte magic-checked
//! header followed by three single-slot token cells:
//!
//! - `PwmToWd`: the main process drops a token each control iteration
//! - `WdToPwm`: the watchdog acknowledges periodically
//! - `Shutdown`: the main process asks the watchdog to exit
//!
//! Each cell holds at most one token. [`HeartbeatChannel::push`] only
//! succeeds when the cell is observed empty, so a stalled consumer can
//! never accumulate a backlog and a liveness check always measures recent
//! time. The mapping outlives either process, which is what lets the
//! watchdog keep reading after the main process has died.

use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Magic bytes identifying a valid heartbeat file: `"EXCV_WD\0"`.
pub const HEARTBEAT_MAGIC: [u8; 8] = *b"EXCV_WD\0";

/// Total mapped size. One page is plenty for the header and three cells.
pub const HEARTBEAT_FILE_SIZE: usize = 4096;

const CELL_EMPTY: u32 = 0;
const CELL_FULL: u32 = 1;

/// Errors from heartbeat channel operations.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// Underlying filesystem or mmap error.
    #[error("heartbeat I/O error: {source}")]
    Io {
        /// Source I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The mapped file does not carry the expected magic bytes.
    #[error("heartbeat file has invalid magic: {path}")]
    BadMagic {
        /// Offending file path.
        path: PathBuf,
    },

    /// The file is smaller than the required mapping.
    #[error("heartbeat file truncated: {path}")]
    Truncated {
        /// Offending file path.
        path: PathBuf,
    },
}

/// Identifies one of the three token cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CellId {
    /// Main process → watchdog liveness token.
    PwmToWd = 0,
    /// Watchdog → main process acknowledgement token.
    WdToPwm = 1,
    /// Main process → watchdog shutdown request.
    Shutdown = 2,
}

/// File header — 64 bytes, cache-line aligned.
#[repr(C, align(64))]
struct ChannelHeader {
    magic: [u8; 8],
    /// PID of the creating (main) process, for diagnostics.
    creator_pid: AtomicU32,
    _padding: [u8; 52],
}

/// One single-slot token cell — 64 bytes so cells never share a line.
#[repr(C, align(64))]
struct TokenCell {
    /// `CELL_EMPTY` or `CELL_FULL`.
    state: AtomicU32,
    _reserved: u32,
    /// Monotonic timestamp [ns] of the last push.
    stamp_ns: AtomicU64,
    _padding: [u8; 48],
}

const_assert_eq!(core::mem::size_of::<ChannelHeader>(), 64);
const_assert_eq!(core::mem::size_of::<TokenCell>(), 64);

/// Current monotonic clock reading in nanoseconds.
///
/// `CLOCK_MONOTONIC` is shared by every process on the host, so stamps
/// written by one side are directly comparable on the other.
pub fn monotonic_ns() -> u64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .unwrap_or(nix::sys::time::TimeSpec::new(0, 0));
    (ts.tv_sec() as u64).wrapping_mul(1_000_000_000).wrapping_add(ts.tv_nsec() as u64)
}

/// A mapped heartbeat channel endpoint.
pub struct HeartbeatChannel {
    mmap: MmapMut,
    path: PathBuf,
    /// Creator unlinks the file on drop.
    owner: bool,
}

impl HeartbeatChannel {
    /// Create (or re-initialize) the channel file and map it.
    ///
    /// Called once by the main process before spawning the watchdog.
    pub fn create(path: &Path) -> Result<Self, HeartbeatError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(HEARTBEAT_FILE_SIZE as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut channel = Self { mmap, path: path.to_path_buf(), owner: true };

        channel
            .header()
            .creator_pid
            .store(std::process::id(), Ordering::Release);
        // Magic written last: an opener that sees it sees a full layout.
        unsafe {
            let magic_ptr = channel.mmap.as_mut_ptr() as *mut [u8; 8];
            std::ptr::write_volatile(magic_ptr, HEARTBEAT_MAGIC);
        }
        Ok(channel)
    }

    /// Open an existing channel file created by the peer process.
    pub fn open(path: &Path) -> Result<Self, HeartbeatError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEARTBEAT_FILE_SIZE {
            return Err(HeartbeatError::Truncated { path: path.to_path_buf() });
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let channel = Self { mmap, path: path.to_path_buf(), owner: false };
        if channel.header().magic != HEARTBEAT_MAGIC {
            return Err(HeartbeatError::BadMagic { path: path.to_path_buf() });
        }
        Ok(channel)
    }

    fn header(&self) -> &ChannelHeader {
        unsafe { &*(self.mmap.as_ptr() as *const ChannelHeader) }
    }

    fn cell(&self, id: CellId) -> &TokenCell {
        let offset = core::mem::size_of::<ChannelHeader>()
            + (id as usize) * core::mem::size_of::<TokenCell>();
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const TokenCell) }
    }

    /// Push one token into `id`, stamped with the monotonic clock.
    ///
    /// Returns `false` if the cell still holds an unconsumed token; the
    /// producer must not overwrite it.
    pub fn push(&self, id: CellId) -> bool {
        let cell = self.cell(id);
        if cell
            .state
            .compare_exchange(CELL_EMPTY, CELL_FULL, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        cell.stamp_ns.store(monotonic_ns(), Ordering::Release);
        true
    }

    /// Consume at most one token from `id`, returning its stamp [ns].
    pub fn pop(&self, id: CellId) -> Option<u64> {
        let cell = self.cell(id);
        if cell
            .state
            .compare_exchange(CELL_FULL, CELL_EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(cell.stamp_ns.load(Ordering::Acquire))
    }

    /// Non-consuming look at the most recent stamp of `id` [ns].
    /// Present even after the token was popped.
    pub fn last_stamp(&self, id: CellId) -> u64 {
        self.cell(id).stamp_ns.load(Ordering::Acquire)
    }

    /// PID of the process that created the file.
    pub fn creator_pid(&self) -> u32 {
        self.header().creator_pid.load(Ordering::Acquire)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HeartbeatChannel {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
