//! Store checkpoint: the last known-durable timestamps, kept in one mapped
//! page so recovery can pick a starting segment after an unclean shutdown.

use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::Result;

const CHECKPOINT_FILE_SIZE: usize = 4096;

/// Extra slack subtracted from the minimum timestamp so a record written
/// in the same instant as the checkpoint is still re-scanned.
const MIN_TIMESTAMP_SLACK_MS: u64 = 3000;

pub struct StoreCheckpoint {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
    phys_msg_timestamp: AtomicU64,
    logics_msg_timestamp: AtomicU64,
    index_msg_timestamp: AtomicU64,
}

impl StoreCheckpoint {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(CHECKPOINT_FILE_SIZE as u64)?;

        // SAFETY: file stays open for the mapping's lifetime; the store
        // directory is exclusive to this process.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let (phys, logics, index) = if existed {
            (
                u64::from_be_bytes(mmap[0..8].try_into().unwrap_or_default()),
                u64::from_be_bytes(mmap[8..16].try_into().unwrap_or_default()),
                u64::from_be_bytes(mmap[16..24].try_into().unwrap_or_default()),
            )
        } else {
            (0, 0, 0)
        };

        if existed {
            info!(
                phys_msg_timestamp = phys,
                logics_msg_timestamp = logics,
                index_msg_timestamp = index,
                "store checkpoint loaded"
            );
        }

        Ok(Self {
            path,
            mmap: Mutex::new(mmap),
            phys_msg_timestamp: AtomicU64::new(phys),
            logics_msg_timestamp: AtomicU64::new(logics),
            index_msg_timestamp: AtomicU64::new(index),
        })
    }

    pub fn phys_msg_timestamp(&self) -> u64 {
        self.phys_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_phys_msg_timestamp(&self, timestamp: u64) {
        self.phys_msg_timestamp.store(timestamp, Ordering::Release);
    }

    pub fn logics_msg_timestamp(&self) -> u64 {
        self.logics_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_logics_msg_timestamp(&self, timestamp: u64) {
        self.logics_msg_timestamp.store(timestamp, Ordering::Release);
    }

    pub fn index_msg_timestamp(&self) -> u64 {
        self.index_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_index_msg_timestamp(&self, timestamp: u64) {
        self.index_msg_timestamp.store(timestamp, Ordering::Release);
    }

    /// Oldest timestamp any persisted structure is known durable through,
    /// minus a safety slack.
    pub fn min_timestamp(&self) -> u64 {
        self.phys_msg_timestamp()
            .min(self.logics_msg_timestamp())
            .saturating_sub(MIN_TIMESTAMP_SLACK_MS)
    }

    pub fn min_timestamp_index(&self) -> u64 {
        self.min_timestamp().min(self.index_msg_timestamp())
    }

    /// Persist the three timestamps.
    pub fn flush(&self) -> Result<()> {
        let mut mmap = self.mmap.lock();
        mmap[0..8].copy_from_slice(&self.phys_msg_timestamp().to_be_bytes());
        mmap[8..16].copy_from_slice(&self.logics_msg_timestamp().to_be_bytes());
        mmap[16..24].copy_from_slice(&self.index_msg_timestamp().to_be_bytes());
        mmap.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint");

        {
            let checkpoint = StoreCheckpoint::new(path.clone()).unwrap();
            checkpoint.set_phys_msg_timestamp(111);
            checkpoint.set_logics_msg_timestamp(222);
            checkpoint.set_index_msg_timestamp(333);
            checkpoint.flush().unwrap();
        }

        let checkpoint = StoreCheckpoint::new(path).unwrap();
        assert_eq!(checkpoint.phys_msg_timestamp(), 111);
        assert_eq!(checkpoint.logics_msg_timestamp(), 222);
        assert_eq!(checkpoint.index_msg_timestamp(), 333);
    }

    #[test]
    fn test_min_timestamp_has_slack() {
        let dir = TempDir::new().unwrap();
        let checkpoint = StoreCheckpoint::new(dir.path().join("checkpoint")).unwrap();
        checkpoint.set_phys_msg_timestamp(10_000);
        checkpoint.set_logics_msg_timestamp(8_000);
        assert_eq!(checkpoint.min_timestamp(), 5_000);

        checkpoint.set_index_msg_timestamp(4_000);
        assert_eq!(checkpoint.min_timestamp_index(), 4_000);
    }

    #[test]
    fn test_fresh_checkpoint_is_zeroed() {
        let dir = TempDir::new().unwrap();
        let checkpoint = StoreCheckpoint::new(dir.path().join("checkpoint")).unwrap();
        assert_eq!(checkpoint.phys_msg_timestamp(), 0);
        assert_eq!(checkpoint.min_timestamp(), 0);
    }
}
