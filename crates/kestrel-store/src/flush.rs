//! Commit log flushing services.
//!
//! Two variants, selected by `StoreConfig::flush_disk_type`:
//!
//! - [`FlushRealTimeService`] wakes periodically and flushes dirty pages in
//!   the background; producers never wait on it.
//! - [`GroupCommitService`] amortizes fsync across concurrent sync-durable
//!   producers: each put enqueues a request carrying its own completion
//!   latch, and the service swaps the request buffers between flushes.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::checkpoint::StoreCheckpoint;
use crate::config::StoreConfig;
use crate::queue::SegmentQueue;
use crate::service::ServiceState;
use crate::util::unix_millis;

const SHUTDOWN_RETRY_TIMES: usize = 3;

struct LatchState {
    flush_ok: Option<bool>,
}

/// One sync-durable put waiting for its bytes to reach disk. Cloned
/// handles share the latch, so the same request can be handed to both the
/// group-commit flusher and an HA service.
#[derive(Clone)]
pub struct GroupCommitRequest {
    inner: Arc<GroupCommitRequestInner>,
}

struct GroupCommitRequestInner {
    /// Offset one past the last byte of the record being waited on.
    next_offset: u64,
    latch: Mutex<LatchState>,
    cond: Condvar,
}

impl GroupCommitRequest {
    pub fn new(next_offset: u64) -> Self {
        Self {
            inner: Arc::new(GroupCommitRequestInner {
                next_offset,
                latch: Mutex::new(LatchState { flush_ok: None }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.inner.next_offset
    }

    /// Signal the waiting producer with the flush outcome.
    pub fn wakeup_customer(&self, flush_ok: bool) {
        let mut latch = self.inner.latch.lock();
        latch.flush_ok = Some(flush_ok);
        self.inner.cond.notify_all();
    }

    /// Block until signaled or `timeout` elapses; a signal that lands just
    /// as the timeout fires still counts.
    pub fn wait_for_flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut latch = self.inner.latch.lock();
        while latch.flush_ok.is_none() {
            if self.inner.cond.wait_until(&mut latch, deadline).timed_out() {
                break;
            }
        }
        latch.flush_ok.unwrap_or(false)
    }
}

/// Best-effort background flusher for the async durability mode.
pub struct FlushRealTimeService {
    state: Arc<ServiceState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushRealTimeService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServiceState::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn start(
        &self,
        config: Arc<StoreConfig>,
        queue: Arc<SegmentQueue>,
        checkpoint: Arc<StoreCheckpoint>,
    ) {
        let state = Arc::clone(&self.state);
        let handle = std::thread::Builder::new()
            .name("flush-realtime".to_string())
            .spawn(move || run_flush_real_time(state, config, queue, checkpoint))
            .expect("spawn flush-realtime thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn wakeup(&self) {
        self.state.wakeup();
    }

    pub fn shutdown(&self) {
        self.state.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for FlushRealTimeService {
    fn default() -> Self {
        Self::new()
    }
}

fn run_flush_real_time(
    state: Arc<ServiceState>,
    config: Arc<StoreConfig>,
    queue: Arc<SegmentQueue>,
    checkpoint: Arc<StoreCheckpoint>,
) {
    info!("flush realtime service started");
    let mut last_thorough_at: u64 = 0;
    let mut print_times: u64 = 0;

    while !state.is_stopped() {
        let interval = Duration::from_millis(config.flush_interval_commit_log);
        let mut least_pages = config.flush_commit_log_least_pages;

        let now = unix_millis();
        let mut print_progress = false;
        if now >= last_thorough_at + config.flush_commit_log_thorough_interval {
            last_thorough_at = now;
            least_pages = 0;
            print_progress = print_times % 10 == 0;
            print_times += 1;
        }

        if config.flush_commit_log_timed {
            std::thread::sleep(interval);
        } else {
            state.wait_for_running(interval);
        }

        if print_progress {
            info!(
                behind_bytes = queue.how_much_fall_behind(),
                "commit log flush progress"
            );
        }

        queue.flush(least_pages);
        let store_timestamp = queue.store_timestamp();
        if store_timestamp > 0 {
            checkpoint.set_phys_msg_timestamp(store_timestamp);
        }
    }

    // Flush everything that is left before exiting.
    let mut progress = true;
    for i in 0..SHUTDOWN_RETRY_TIMES {
        progress = queue.flush(0);
        info!(
            retry = i + 1,
            outstanding = progress,
            "flush realtime service shutdown flush"
        );
        if !progress {
            break;
        }
    }
    if progress {
        warn!("flush realtime service exiting with unflushed data");
    }
    info!("flush realtime service end");
}

/// Group-commit flusher for the sync durability mode.
///
/// Producers append requests to the write buffer under its own mutex; the
/// service swaps write and read buffers on each wakeup so enqueueing never
/// contends with fsync.
pub struct GroupCommitService {
    state: Arc<ServiceState>,
    requests_write: Arc<Mutex<Vec<GroupCommitRequest>>>,
    requests_read: Arc<Mutex<Vec<GroupCommitRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GroupCommitService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServiceState::new()),
            requests_write: Arc::new(Mutex::new(Vec::new())),
            requests_read: Arc::new(Mutex::new(Vec::new())),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self, queue: Arc<SegmentQueue>, checkpoint: Arc<StoreCheckpoint>) {
        let worker = GroupCommitWorker {
            state: Arc::clone(&self.state),
            requests_write: Arc::clone(&self.requests_write),
            requests_read: Arc::clone(&self.requests_read),
            queue,
            checkpoint,
        };
        let handle = std::thread::Builder::new()
            .name("flush-group-commit".to_string())
            .spawn(move || worker.run())
            .expect("spawn flush-group-commit thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn put_request(&self, request: GroupCommitRequest) {
        self.requests_write.lock().push(request);
        self.state.wakeup();
    }

    pub fn wakeup(&self) {
        self.state.wakeup();
    }

    pub fn shutdown(&self) {
        self.state.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for GroupCommitService {
    fn default() -> Self {
        Self::new()
    }
}

struct GroupCommitWorker {
    state: Arc<ServiceState>,
    requests_write: Arc<Mutex<Vec<GroupCommitRequest>>>,
    requests_read: Arc<Mutex<Vec<GroupCommitRequest>>>,
    queue: Arc<SegmentQueue>,
    checkpoint: Arc<StoreCheckpoint>,
}

impl GroupCommitWorker {
    fn run(&self) {
        info!("group commit service started");

        while !self.state.is_stopped() {
            self.state.wait_for_running(Duration::from_millis(10));
            self.swap_requests();
            self.do_commit();
        }

        // Requests racing with shutdown get one final pass.
        std::thread::sleep(Duration::from_millis(10));
        self.swap_requests();
        self.do_commit();

        info!("group commit service end");
    }

    fn swap_requests(&self) {
        let mut write = self.requests_write.lock();
        let mut read = self.requests_read.lock();
        std::mem::swap(&mut *write, &mut *read);
    }

    fn do_commit(&self) {
        let requests: Vec<GroupCommitRequest> = {
            let mut read = self.requests_read.lock();
            read.drain(..).collect()
        };

        if requests.is_empty() {
            // Puts that opted out of waiting still want their pages
            // flushed eventually.
            self.queue.flush(0);
            return;
        }

        for request in requests {
            // The record may straddle a rotation, so one flush can be
            // insufficient; never more than two are needed.
            let mut flush_ok = false;
            for _ in 0..2 {
                flush_ok = self.queue.committed_where() >= request.next_offset();
                if flush_ok {
                    break;
                }
                self.queue.flush(0);
                flush_ok = self.queue.committed_where() >= request.next_offset();
            }
            if !flush_ok {
                error!(
                    next_offset = request.next_offset(),
                    committed = self.queue.committed_where(),
                    "group commit could not reach requested offset"
                );
            }
            request.wakeup_customer(flush_ok);
        }

        let store_timestamp = self.queue.store_timestamp();
        if store_timestamp > 0 {
            self.checkpoint.set_phys_msg_timestamp(store_timestamp);
        }
    }
}
