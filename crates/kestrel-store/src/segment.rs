//! One fixed-size memory-mapped segment file.
//!
//! A segment keeps two monotonically advancing positions: `wrote` (bytes
//! appended) and `committed` (bytes whose pages have been forced to disk),
//! with `0 <= committed <= wrote <= size` always. Appends go through the
//! engine put-lock, so at most one writer touches the mapping at a time;
//! the flusher and readers only observe bytes below `wrote`.

use memmap2::{Advice, MmapMut};
use std::cell::UnsafeCell;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::config::FlushDiskType;
use crate::util::unix_millis;
use crate::{Error, Result};

/// Page granularity used for dirty-page accounting.
pub const OS_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    PutOk,
    EndOfFile,
    UnknownError,
}

/// Outcome of a single segment append.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub status: AppendStatus,
    pub wrote_offset: u64,
    pub wrote_bytes: usize,
    pub msg_id: String,
    pub store_timestamp: u64,
    pub queue_offset: u64,
}

impl AppendResult {
    pub(crate) fn unknown_error() -> Self {
        Self {
            status: AppendStatus::UnknownError,
            wrote_offset: 0,
            wrote_bytes: 0,
            msg_id: String::new(),
            store_timestamp: 0,
            queue_offset: 0,
        }
    }
}

/// A fixed-size mapped file named by the zero-padded decimal of its base
/// physical offset.
pub struct Segment {
    path: PathBuf,
    base_offset: u64,
    size: usize,
    mmap: UnsafeCell<MmapMut>,
    wrote: AtomicUsize,
    committed: AtomicUsize,
    /// Store timestamp of the most recently appended record.
    store_timestamp: AtomicU64,
    /// Starts at one for the owning queue; read views add one each.
    refs: AtomicI64,
    available: AtomicBool,
    cleanup_over: AtomicBool,
    first_shutdown_at: AtomicU64,
    first_create_in_queue: AtomicBool,
}

// The mapping is written only under the engine put-lock (or during
// single-threaded startup); concurrent access never overlaps byte ranges.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Open or create the segment file at `path`, pre-sized to `size`.
    pub fn new(path: impl Into<PathBuf>, size: usize) -> Result<Self> {
        let path = path.into();
        let base_offset = base_offset_of(&path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(size as u64)?;

        // SAFETY: the file stays open for the lifetime of the mapping and
        // the store directory is exclusive to this process.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            path,
            base_offset,
            size,
            mmap: UnsafeCell::new(mmap),
            wrote: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            store_timestamp: AtomicU64::new(0),
            refs: AtomicI64::new(1),
            available: AtomicBool::new(true),
            cleanup_over: AtomicBool::new(false),
            first_shutdown_at: AtomicU64::new(0),
            first_create_in_queue: AtomicBool::new(false),
        })
    }

    fn mapped(&self) -> &MmapMut {
        // SAFETY: shared view; writers never touch bytes a reader can see.
        unsafe { &*self.mmap.get() }
    }

    /// Writer view of the mapping. Callers must hold the engine put-lock or
    /// otherwise be the only thread touching bytes at or above `wrote`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn mapped_mut(&self) -> &mut MmapMut {
        &mut *self.mmap.get()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wrote_position(&self) -> usize {
        self.wrote.load(Ordering::Acquire)
    }

    pub fn committed_position(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn set_wrote_position(&self, pos: usize) {
        self.wrote.store(pos, Ordering::Release);
    }

    pub(crate) fn set_committed_position(&self, pos: usize) {
        self.committed.store(pos, Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.wrote_position() == self.size
    }

    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_first_create_in_queue(&self, first: bool) {
        self.first_create_in_queue.store(first, Ordering::Release);
    }

    pub fn is_first_create_in_queue(&self) -> bool {
        self.first_create_in_queue.load(Ordering::Acquire)
    }

    /// Last-modified time of the backing file, milliseconds since epoch.
    pub fn last_modified(&self) -> u64 {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Append through a callback that fills the mapped bytes at the write
    /// position. The callback receives the absolute offset being reserved,
    /// the writable tail of the mapping, and the remaining byte count; the
    /// segment advances `wrote` by whatever the callback reports.
    pub fn append<F>(&self, cb: F) -> AppendResult
    where
        F: FnOnce(u64, &mut [u8], usize) -> AppendResult,
    {
        let pos = self.wrote_position();
        if pos < self.size {
            let max_blank = self.size - pos;
            // SAFETY: serialized by the put-lock; see mapped_mut.
            let buf = unsafe { &mut self.mapped_mut()[pos..] };
            let result = cb(self.base_offset + pos as u64, buf, max_blank);
            self.wrote.fetch_add(result.wrote_bytes, Ordering::AcqRel);
            self.store_timestamp
                .store(result.store_timestamp, Ordering::Release);
            return result;
        }

        error!(
            wrote = pos,
            size = self.size,
            "append past end of segment, this is a bug in the caller"
        );
        AppendResult::unknown_error()
    }

    /// Append already-framed bytes; used when replaying replicated data.
    pub fn append_raw(&self, data: &[u8]) -> bool {
        let pos = self.wrote_position();
        if pos + data.len() <= self.size {
            // SAFETY: serialized by the caller's engine lock.
            let buf = unsafe { &mut self.mapped_mut()[pos..pos + data.len()] };
            buf.copy_from_slice(data);
            self.wrote.fetch_add(data.len(), Ordering::AcqRel);
            return true;
        }
        false
    }

    fn is_able_to_flush(&self, least_pages: usize) -> bool {
        let flush = self.committed_position();
        let write = self.wrote_position();

        if self.is_full() {
            return true;
        }

        if least_pages > 0 {
            return (write / OS_PAGE_SIZE).saturating_sub(flush / OS_PAGE_SIZE) >= least_pages;
        }

        write > flush
    }

    /// Force dirty pages to disk if the threshold is met; returns the new
    /// committed position.
    pub fn flush(&self, least_pages: usize) -> usize {
        if self.is_able_to_flush(least_pages) {
            if self.hold() {
                let value = self.wrote_position();
                if let Err(e) = self.mapped().flush() {
                    warn!(path = %self.path.display(), error = %e, "mmap flush failed");
                } else {
                    self.committed.store(value, Ordering::Release);
                }
                self.release();
            } else {
                warn!(
                    committed = self.committed_position(),
                    "flush skipped, segment no longer holdable"
                );
                self.committed
                    .store(self.wrote_position(), Ordering::Release);
            }
        }

        self.committed_position()
    }

    /// Shared read view of `[pos, pos + size)`, bounded by `wrote`.
    pub fn select_view(self: &Arc<Self>, pos: usize, size: usize) -> Option<MappedView> {
        if pos + size <= self.wrote_position() {
            if self.hold() {
                return Some(MappedView {
                    segment: Arc::clone(self),
                    start_offset: self.base_offset + pos as u64,
                    pos,
                    size,
                });
            }
            warn!(
                pos,
                base_offset = self.base_offset,
                "view request matched but segment could not be held"
            );
        } else {
            warn!(
                pos,
                size,
                wrote = self.wrote_position(),
                "view request out of written range"
            );
        }
        None
    }

    /// Shared read view from `pos` to the current write position.
    pub fn select_view_from(self: &Arc<Self>, pos: usize) -> Option<MappedView> {
        let wrote = self.wrote_position();
        if pos < wrote {
            return self.select_view(pos, wrote - pos);
        }
        None
    }

    /// Entire mapping, for the startup recovery scan only; concurrent
    /// appends would race with this.
    pub(crate) fn mapped_slice(&self) -> &[u8] {
        &self.mapped()[..]
    }

    /// Touch every page so the kernel materializes the allocation up front.
    /// Runs off the put path (allocator thread or operator action).
    pub fn warm(&self, flush_disk_type: FlushDiskType, pages: usize) {
        let began = Instant::now();
        // SAFETY: freshly allocated segment, not yet visible to appenders.
        let buf = unsafe { self.mapped_mut() };
        let mut flushed = 0usize;
        for (j, i) in (0..self.size).step_by(OS_PAGE_SIZE).enumerate() {
            buf[i] = 0;

            if flush_disk_type == FlushDiskType::Sync
                && (i / OS_PAGE_SIZE).saturating_sub(flushed / OS_PAGE_SIZE) >= pages
            {
                flushed = i;
                if let Err(e) = buf.flush() {
                    warn!(error = %e, "intermediate flush during warm-up failed");
                }
            }

            // Do not starve the runtime while touching a gigabyte of pages.
            if j % 1024 == 0 {
                std::thread::yield_now();
            }
        }

        if flush_disk_type == FlushDiskType::Sync {
            if let Err(e) = buf.flush() {
                warn!(error = %e, "final flush during warm-up failed");
            }
        }

        info!(
            path = %self.path.display(),
            elapsed_ms = began.elapsed().as_millis() as u64,
            "mapped file warm up done"
        );

        if let Err(e) = self.mlock() {
            warn!(path = %self.path.display(), error = %e, "mlock after warm-up failed");
        }
    }

    /// Pin the mapping into RAM and advise the kernel it will be needed.
    pub fn mlock(&self) -> Result<()> {
        let began = Instant::now();
        self.mapped().lock()?;
        self.mapped().advise(Advice::WillNeed)?;
        info!(
            path = %self.path.display(),
            size = self.size,
            elapsed_ms = began.elapsed().as_millis() as u64,
            "mlock"
        );
        Ok(())
    }

    pub fn munlock(&self) -> Result<()> {
        let began = Instant::now();
        self.mapped().unlock()?;
        info!(
            path = %self.path.display(),
            size = self.size,
            elapsed_ms = began.elapsed().as_millis() as u64,
            "munlock"
        );
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_cleanup_over(&self) -> bool {
        self.cleanup_over.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take a reference; fails once the segment is marked unavailable or
    /// the count has already drained.
    pub fn hold(&self) -> bool {
        if self.is_available() {
            if self.refs.fetch_add(1, Ordering::AcqRel) > 0 {
                return true;
            }
            self.refs.fetch_sub(1, Ordering::AcqRel);
        }
        false
    }

    pub fn release(&self) {
        let value = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if value <= 0 {
            self.cleanup_over.store(true, Ordering::Release);
        }
    }

    /// Mark unavailable and drop the owner reference. Called again after
    /// `force_after` has elapsed, outstanding references are revoked.
    pub fn shutdown(&self, force_after: Duration) {
        if self.available.swap(false, Ordering::AcqRel) {
            self.first_shutdown_at.store(unix_millis(), Ordering::Release);
            self.release();
        } else if self.ref_count() > 0 {
            let elapsed = unix_millis().saturating_sub(self.first_shutdown_at.load(Ordering::Acquire));
            if elapsed >= force_after.as_millis() as u64 {
                self.refs
                    .store(-1000 - self.ref_count(), Ordering::Release);
                self.release();
            }
        }
    }

    /// Shut down, and once references have drained delete the backing
    /// file. Returns false while references are still held; callers retry.
    pub fn destroy(&self, force_after: Duration) -> bool {
        self.shutdown(force_after);

        if self.is_cleanup_over() {
            match fs::remove_file(&self.path) {
                Ok(()) => info!(
                    path = %self.path.display(),
                    wrote = self.wrote_position(),
                    committed = self.committed_position(),
                    "segment file deleted"
                ),
                Err(e) => warn!(path = %self.path.display(), error = %e, "segment file delete failed"),
            }
            true
        } else {
            warn!(
                path = %self.path.display(),
                refs = self.ref_count(),
                "destroy deferred, references still held"
            );
            false
        }
    }
}

fn base_offset_of(path: &Path) -> Result<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| {
            Error::Other(format!(
                "segment file name is not a base offset: {}",
                path.display()
            ))
        })
}

/// Shared read-only view into a segment's mapping. Holds a segment
/// reference that blocks unmap until dropped.
pub struct MappedView {
    segment: Arc<Segment>,
    start_offset: u64,
    pos: usize,
    size: usize,
}

impl MappedView {
    /// Absolute physical offset of the first byte of this view.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        &self.segment.mapped()[self.pos..self.pos + self.size]
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        self.segment.release();
    }
}
