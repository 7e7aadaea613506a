//! Background segment allocation.
//!
//! Creating and mapping a gigabyte file is too slow for the put critical
//! section, so a dedicated thread does it. Each allocation also queues the
//! next segment ahead of time; by the time the writer rotates again the
//! file usually already exists.

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::segment::Segment;
use crate::{Error, Result};

const ALLOCATE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct AllocateRequest {
    path: PathBuf,
    size: usize,
    /// Present for foreground requests; pre-creations have no waiter.
    done: Option<Sender<Result<Arc<Segment>>>>,
}

/// Pre-creates mapped segment files off the put path.
pub struct AllocateService {
    /// Taken on shutdown so the worker loop drains and exits.
    tx: Mutex<Option<Sender<AllocateRequest>>>,
    ready: Arc<Mutex<HashMap<PathBuf, Arc<Segment>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AllocateService {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        let (tx, rx) = unbounded::<AllocateRequest>();
        let ready = Arc::new(Mutex::new(HashMap::new()));

        let worker_ready = Arc::clone(&ready);
        let handle = std::thread::Builder::new()
            .name("allocate-segment".to_string())
            .spawn(move || {
                info!("allocate service started");
                while let Ok(request) = rx.recv() {
                    // A pre-creation for this path may already have run
                    // while the request sat in the queue; hand that
                    // mapping out instead of mapping the file twice.
                    let existing = worker_ready.lock().remove(&request.path);
                    let result = match existing {
                        Some(segment) => Ok(segment),
                        None => create_segment(&config, &request.path, request.size),
                    };
                    match request.done {
                        Some(done) => {
                            let _ = done.send(result);
                        }
                        None => match result {
                            Ok(segment) => {
                                worker_ready.lock().insert(request.path, segment);
                            }
                            Err(e) => {
                                warn!(
                                    path = %request.path.display(),
                                    error = %e,
                                    "segment pre-creation failed"
                                );
                            }
                        },
                    }
                }
                info!("allocate service end");
            })
            .expect("spawn allocate-segment thread");

        Self {
            tx: Mutex::new(Some(tx)),
            ready,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Fetch the segment for `base`, creating it if pre-creation has not
    /// produced it yet, and queue pre-creation of the one after it.
    pub fn allocate(&self, dir: &Path, base: u64, size: usize) -> Result<Arc<Segment>> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::Allocate("allocate service shut down".to_string()))?;

        let path = segment_path(dir, base);
        let pre_created = self.ready.lock().remove(&path);
        let segment = match pre_created {
            Some(segment) => segment,
            None => {
                let (done_tx, done_rx) = unbounded();
                tx.send(AllocateRequest {
                    path: path.clone(),
                    size,
                    done: Some(done_tx),
                })
                .map_err(|_| Error::Allocate("allocate service not running".to_string()))?;
                done_rx.recv_timeout(ALLOCATE_WAIT_TIMEOUT).map_err(|_| {
                    Error::Allocate(format!("timed out waiting for segment {}", path.display()))
                })??
            }
        };

        // One ahead: the next rotation should find its file already mapped.
        let _ = tx.send(AllocateRequest {
            path: segment_path(dir, base + size as u64),
            size,
            done: None,
        });

        Ok(segment)
    }

    /// Stop the worker and delete pre-created segments that were never
    /// handed out.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }

        let leftovers: Vec<Arc<Segment>> = self.ready.lock().drain().map(|(_, s)| s).collect();
        for segment in leftovers {
            segment.destroy(Duration::from_millis(1000));
        }
    }
}

fn create_segment(config: &StoreConfig, path: &Path, size: usize) -> Result<Arc<Segment>> {
    let segment = Arc::new(Segment::new(path, size)?);
    if config.warm_mapped_file_enable {
        segment.warm(config.flush_disk_type, config.flush_least_pages_when_warm);
    }
    Ok(segment)
}

pub(crate) fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{:020}", base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_creates_and_prefetches() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(StoreConfig::default());
        let service = AllocateService::new(config);

        let base_dir = dir.path().to_path_buf();
        let segment = service.allocate(&base_dir, 0, 4096).unwrap();
        assert_eq!(segment.base_offset(), 0);
        assert!(segment_path(&base_dir, 0).exists());

        // The next segment file appears shortly after without being asked
        // for directly.
        let next = segment_path(&base_dir, 4096);
        for _ in 0..100 {
            if next.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(next.exists());

        // Asking for it consumes the pre-created mapping.
        let second = service.allocate(&base_dir, 4096, 4096).unwrap();
        assert_eq!(second.base_offset(), 4096);

        service.shutdown();
        assert!(service.allocate(&base_dir, 8192, 4096).is_err());
    }

    #[test]
    fn test_segment_path_format() {
        let dir = PathBuf::from("/data/commitlog");
        assert_eq!(
            segment_path(&dir, 1073741824),
            PathBuf::from("/data/commitlog/00000000001073741824")
        );
    }
}
