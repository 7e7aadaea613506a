//! Ordered collection of commit log segments.
//!
//! Bases are strictly increasing and spaced by exactly the segment size; at
//! most the last segment is partially written. Rotation always opens the
//! new segment at `previous base + size`, so physical offsets stay
//! contiguous modulo end-of-file padding.

use parking_lot::RwLock;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::allocate::AllocateService;
use crate::segment::Segment;
use crate::util::unix_millis;
use crate::{Error, Result};

/// Upper bound on files removed per expiry sweep.
const DELETE_FILES_BATCH_MAX: usize = 10;

pub struct SegmentQueue {
    store_path: PathBuf,
    segment_size: usize,
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Absolute offset below which all pages are known flushed.
    committed_where: AtomicU64,
    /// Store timestamp captured from the segment flushed most recently.
    store_timestamp: AtomicU64,
    allocator: Arc<AllocateService>,
}

impl SegmentQueue {
    pub fn new(
        store_path: PathBuf,
        segment_size: usize,
        allocator: Arc<AllocateService>,
    ) -> Self {
        Self {
            store_path,
            segment_size,
            segments: RwLock::new(Vec::new()),
            committed_where: AtomicU64::new(0),
            store_timestamp: AtomicU64::new(0),
            allocator,
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn committed_where(&self) -> u64 {
        self.committed_where.load(Ordering::Acquire)
    }

    pub fn set_committed_where(&self, offset: u64) {
        self.committed_where.store(offset, Ordering::Release);
    }

    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    /// Map every segment file in the store directory, ordered by base
    /// offset. Positions are set to the end; recovery corrects the tail.
    pub fn load(&self) -> Result<()> {
        fs::create_dir_all(&self.store_path)?;

        let mut paths: Vec<PathBuf> = fs::read_dir(&self.store_path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let actual = fs::metadata(&path)?.len();
            if actual != self.segment_size as u64 {
                return Err(Error::SegmentSizeMismatch {
                    path: path.display().to_string(),
                    actual,
                    expected: self.segment_size as u64,
                });
            }

            let segment = Arc::new(Segment::new(&path, self.segment_size)?);
            segment.set_wrote_position(self.segment_size);
            segment.set_committed_position(self.segment_size);
            info!(path = %path.display(), "loaded commit log segment");
            segments.push(segment);
        }

        *self.segments.write() = segments;
        Ok(())
    }

    pub fn segments_snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// The segment currently accepting appends, rotating or bootstrapping
    /// as needed. `start_offset` seeds the base of the very first segment.
    pub fn tail(&self, start_offset: Option<u64>) -> Option<Arc<Segment>> {
        let mut create_base = None;
        let mut first_create = false;

        {
            let segments = self.segments.read();
            match segments.last() {
                None => {
                    let start = start_offset.unwrap_or(0);
                    create_base = Some(start - start % self.segment_size as u64);
                    first_create = true;
                }
                Some(last) if last.is_full() => {
                    create_base = Some(last.base_offset() + self.segment_size as u64);
                }
                Some(last) => return Some(Arc::clone(last)),
            }
        }

        let base = create_base?;
        match self
            .allocator
            .allocate(&self.store_path, base, self.segment_size)
        {
            Ok(segment) => {
                segment.set_first_create_in_queue(first_create);
                let mut segments = self.segments.write();
                // Another writer may have rotated while the lock was
                // dropped; the put-lock normally prevents this.
                if segments
                    .last()
                    .map(|s| s.base_offset() >= base)
                    .unwrap_or(false)
                {
                    return segments.last().cloned();
                }
                segments.push(Arc::clone(&segment));
                Some(segment)
            }
            Err(e) => {
                error!(base, error = %e, "segment allocation failed");
                None
            }
        }
    }

    pub fn first(&self) -> Option<Arc<Segment>> {
        self.segments.read().first().cloned()
    }

    pub fn last(&self) -> Option<Arc<Segment>> {
        self.segments.read().last().cloned()
    }

    /// Segment whose range `[base, base + size)` contains `offset`.
    pub fn find_by_offset(&self, offset: u64, return_first_on_miss: bool) -> Option<Arc<Segment>> {
        let segments = self.segments.read();
        let first = segments.first()?;
        let last = segments.last()?;

        if offset >= first.base_offset()
            && offset < last.base_offset() + self.segment_size as u64
        {
            let index = ((offset - first.base_offset()) / self.segment_size as u64) as usize;
            if let Some(segment) = segments.get(index) {
                if segment.base_offset() <= offset
                    && offset < segment.base_offset() + self.segment_size as u64
                {
                    return Some(Arc::clone(segment));
                }
            }
            // Expiry may have left the vector sparse relative to the
            // arithmetic guess; fall back to scanning.
            for segment in segments.iter() {
                if segment.base_offset() <= offset
                    && offset < segment.base_offset() + self.segment_size as u64
                {
                    return Some(Arc::clone(segment));
                }
            }
        }

        if return_first_on_miss {
            warn!(offset, "offset not mapped, returning first segment");
            return Some(Arc::clone(first));
        }
        None
    }

    /// Flush the segment containing the committed cursor and advance the
    /// cursor; returns whether any progress was made.
    pub fn flush(&self, least_pages: usize) -> bool {
        let mut progress = false;
        let committed = self.committed_where();
        if let Some(segment) = self.find_by_offset(committed, committed == 0) {
            let timestamp = segment.store_timestamp();
            let offset = segment.flush(least_pages);
            let whereabouts = segment.base_offset() + offset as u64;
            progress = whereabouts != committed;
            self.set_committed_where(whereabouts);
            if least_pages == 0 {
                self.store_timestamp.store(timestamp, Ordering::Release);
            }
        }
        progress
    }

    /// Physical offset of the first byte still stored.
    pub fn min_offset(&self) -> u64 {
        self.segments
            .read()
            .first()
            .map(|s| s.base_offset())
            .unwrap_or(0)
    }

    /// Physical offset one past the last appended byte.
    pub fn max_offset(&self) -> u64 {
        self.segments
            .read()
            .last()
            .map(|s| s.base_offset() + s.wrote_position() as u64)
            .unwrap_or(0)
    }

    pub fn how_much_fall_behind(&self) -> u64 {
        let committed = self.committed_where();
        if committed == 0 {
            return 0;
        }
        self.max_offset().saturating_sub(committed)
    }

    /// Rewind the tail to `offset`: the containing segment's positions are
    /// pulled back and every later segment is destroyed.
    pub fn truncate_dirty(&self, offset: u64) {
        let mut to_destroy = Vec::new();
        {
            let mut segments = self.segments.write();
            segments.retain(|segment| {
                let tail = segment.base_offset() + self.segment_size as u64;
                if tail <= offset {
                    return true;
                }
                if segment.base_offset() <= offset {
                    let pos = (offset - segment.base_offset()) as usize;
                    segment.set_wrote_position(pos);
                    segment.set_committed_position(pos);
                    true
                } else {
                    info!(
                        base = segment.base_offset(),
                        "destroying segment beyond truncation point"
                    );
                    to_destroy.push(Arc::clone(segment));
                    false
                }
            });
        }
        for segment in to_destroy {
            segment.destroy(Duration::from_millis(1000));
        }
    }

    /// Remove segments whose backing file has not been modified within
    /// `expire_ms`. The active tail is never removed. Returns how many
    /// segments were deleted.
    pub fn delete_expired_by_time(
        &self,
        expire_ms: u64,
        delete_interval_ms: u64,
        force_after: Duration,
        immediately: bool,
    ) -> usize {
        let candidates: Vec<Arc<Segment>> = {
            let segments = self.segments.read();
            if segments.len() <= 1 {
                return 0;
            }
            segments[..segments.len() - 1].to_vec()
        };

        let now = unix_millis();
        let mut deleted = Vec::new();
        for segment in candidates {
            let expire_at = segment.last_modified() + expire_ms;
            if !immediately && now < expire_at {
                break;
            }
            if segment.destroy(force_after) {
                deleted.push(segment.base_offset());
                if deleted.len() >= DELETE_FILES_BATCH_MAX {
                    break;
                }
                if delete_interval_ms > 0 {
                    std::thread::sleep(Duration::from_millis(delete_interval_ms));
                }
            } else {
                break;
            }
        }

        if !deleted.is_empty() {
            let mut segments = self.segments.write();
            segments.retain(|s| !deleted.contains(&s.base_offset()));
            info!(count = deleted.len(), "expired commit log segments deleted");
        }
        deleted.len()
    }

    /// Retry deleting the head segment after a failed destroy (readers
    /// were still holding it).
    pub fn retry_delete_first(&self, force_after: Duration) -> bool {
        let first = {
            let segments = self.segments.read();
            match segments.first() {
                Some(first) if !first.is_available() => Arc::clone(first),
                _ => return false,
            }
        };

        if first.destroy(force_after) {
            let mut segments = self.segments.write();
            if segments
                .first()
                .map(|s| s.base_offset() == first.base_offset())
                .unwrap_or(false)
            {
                segments.remove(0);
            }
            true
        } else {
            warn!(
                base = first.base_offset(),
                "retry delete of first segment failed"
            );
            false
        }
    }

    /// Tear down every segment and reset the cursors.
    pub fn destroy(&self) {
        let segments: Vec<Arc<Segment>> = {
            let mut guard = self.segments.write();
            guard.drain(..).collect()
        };
        for segment in segments {
            segment.destroy(Duration::from_millis(1000 * 3));
        }
        self.set_committed_where(0);
        if let Err(e) = fs::remove_dir(&self.store_path) {
            warn!(path = %self.store_path.display(), error = %e, "store directory not removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    const SEG: usize = 4096;

    fn queue_in(dir: &TempDir) -> SegmentQueue {
        let config = Arc::new(StoreConfig::default());
        SegmentQueue::new(
            dir.path().join("commitlog"),
            SEG,
            Arc::new(AllocateService::new(config)),
        )
    }

    #[test]
    fn test_tail_bootstraps_at_zero() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let tail = queue.tail(None).unwrap();
        assert_eq!(tail.base_offset(), 0);
        assert!(tail.is_first_create_in_queue());
    }

    #[test]
    fn test_tail_rotates_with_exact_spacing() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        let first = queue.tail(None).unwrap();
        // Leave the segment partially written; rotation still opens at
        // base + size, not at the write position.
        assert!(first.append_raw(&[1u8; 100]));
        first.set_wrote_position(SEG);

        let second = queue.tail(None).unwrap();
        assert_eq!(second.base_offset(), SEG as u64);
        assert!(!second.is_first_create_in_queue());

        let snapshot = queue.segments_snapshot();
        assert_eq!(snapshot.len(), 2);
        for pair in snapshot.windows(2) {
            assert_eq!(pair[1].base_offset(), pair[0].base_offset() + SEG as u64);
        }
    }

    #[test]
    fn test_tail_aligns_start_offset() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let tail = queue.tail(Some(SEG as u64 * 2 + 17)).unwrap();
        assert_eq!(tail.base_offset(), SEG as u64 * 2);
    }

    #[test]
    fn test_find_by_offset() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let first = queue.tail(None).unwrap();
        first.set_wrote_position(SEG);
        queue.tail(None).unwrap();

        assert_eq!(queue.find_by_offset(0, false).unwrap().base_offset(), 0);
        assert_eq!(
            queue.find_by_offset(SEG as u64 - 1, false).unwrap().base_offset(),
            0
        );
        assert_eq!(
            queue.find_by_offset(SEG as u64, false).unwrap().base_offset(),
            SEG as u64
        );
        assert!(queue.find_by_offset(SEG as u64 * 5, false).is_none());
        assert_eq!(
            queue
                .find_by_offset(SEG as u64 * 5, true)
                .unwrap()
                .base_offset(),
            0
        );
    }

    #[test]
    fn test_flush_advances_cursor() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let tail = queue.tail(None).unwrap();
        assert!(tail.append_raw(&[9u8; 1000]));

        assert!(queue.flush(0));
        assert_eq!(queue.committed_where(), 1000);
        // Nothing new to flush.
        assert!(!queue.flush(0));
    }

    #[test]
    fn test_load_rejects_wrong_size() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("commitlog");
        fs::create_dir_all(&store).unwrap();
        fs::write(store.join(format!("{:020}", 0u64)), b"short").unwrap();

        let queue = queue_in(&dir);
        assert!(matches!(
            queue.load(),
            Err(Error::SegmentSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_orders_and_seals_segments() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("commitlog");
        for base in [0u64, SEG as u64] {
            Segment::new(store.join(format!("{:020}", base)), SEG).unwrap();
        }

        let queue = queue_in(&dir);
        queue.load().unwrap();
        let segments = queue.segments_snapshot();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].base_offset(), 0);
        assert_eq!(segments[1].base_offset(), SEG as u64);
        for segment in &segments {
            assert_eq!(segment.wrote_position(), SEG);
            assert_eq!(segment.committed_position(), SEG);
        }
    }

    #[test]
    fn test_truncate_dirty() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let first = queue.tail(None).unwrap();
        first.set_wrote_position(SEG);
        let second = queue.tail(None).unwrap();
        second.set_wrote_position(SEG);
        let third = queue.tail(None).unwrap();
        third.set_wrote_position(100);

        // Cut back into the second segment.
        queue.truncate_dirty(SEG as u64 + 300);
        let segments = queue.segments_snapshot();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].wrote_position(), 300);
        assert_eq!(segments[1].committed_position(), 300);
        assert_eq!(queue.max_offset(), SEG as u64 + 300);
    }

    #[test]
    fn test_delete_expired_never_touches_tail() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let first = queue.tail(None).unwrap();
        first.set_wrote_position(SEG);
        queue.tail(None).unwrap();

        // immediately = true ignores the age check.
        let removed = queue.delete_expired_by_time(0, 0, Duration::from_secs(1), true);
        assert_eq!(removed, 1);
        let segments = queue.segments_snapshot();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].base_offset(), SEG as u64);
        assert_eq!(queue.min_offset(), SEG as u64);
    }
}
