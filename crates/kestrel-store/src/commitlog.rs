//! The append-only commit log engine.
//!
//! Producers hand messages to [`CommitLog::put_message`]; the engine
//! serializes appends behind a configurable put-lock, persists each record
//! into the mapped segment queue, hands the record's metadata to the
//! dispatch sink, and then settles durability (group commit, HA ack)
//! outside the lock.

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::allocate::AllocateService;
use crate::checkpoint::StoreCheckpoint;
use crate::codec;
use crate::config::{BrokerRole, FlushDiskType, StoreConfig};
use crate::dispatch::{DispatchRequest, DispatchSink};
use crate::flush::{FlushRealTimeService, GroupCommitRequest, GroupCommitService};
use crate::ha::HaService;
use crate::message::{property, tags_string_to_tags_code, BrokerMessage, TransactionType};
use crate::queue::SegmentQueue;
use crate::schedule;
use crate::segment::{AppendResult, AppendStatus, MappedView, Segment};
use crate::util::unix_millis;
use crate::Result;

thread_local! {
    /// Reusable per-writer staging buffer; encoding happens here before
    /// the critical section copies the frame into the mapping.
    static STAGING: RefCell<BytesMut> = RefCell::new(BytesMut::new());
}

/// Outcome surfaced to the producer-facing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    PutOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    MessageIllegal,
    CreateSegmentFailed,
    UnknownError,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub status: PutStatus,
    pub append: Option<AppendResult>,
}

impl PutResult {
    pub fn is_ok(&self) -> bool {
        self.status == PutStatus::PutOk
    }
}

/// Serializes appends. Either an adaptive spin (uncontended puts stay in
/// user space) or a non-fair mutex, chosen by configuration.
enum PutLock {
    Spin(AtomicBool),
    Mutex(RawMutex),
}

impl PutLock {
    fn new(use_mutex: bool) -> Self {
        if use_mutex {
            PutLock::Mutex(<RawMutex as RawMutexApi>::INIT)
        } else {
            PutLock::Spin(AtomicBool::new(true))
        }
    }

    fn lock(&self) {
        match self {
            PutLock::Spin(free) => {
                while free
                    .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                }
            }
            PutLock::Mutex(mutex) => mutex.lock(),
        }
    }

    fn unlock(&self) {
        match self {
            PutLock::Spin(free) => free.store(true, Ordering::Release),
            // SAFETY: paired with a preceding lock() on this thread.
            PutLock::Mutex(mutex) => unsafe { mutex.unlock() },
        }
    }
}

struct PutLockGuard<'a>(&'a PutLock);

impl Drop for PutLockGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Running counters, snapshotted for operators.
#[derive(Default)]
pub struct StoreStats {
    puts_total: AtomicU64,
    put_bytes_total: AtomicU64,
    topic_sizes: DashMap<String, u64>,
}

impl StoreStats {
    fn record_put(&self, topic: &str, bytes: usize) {
        self.puts_total.fetch_add(1, Ordering::Relaxed);
        self.put_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
        *self.topic_sizes.entry(topic.to_string()).or_insert(0) += bytes as u64;
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            puts_total: self.puts_total.load(Ordering::Relaxed),
            put_bytes_total: self.put_bytes_total.load(Ordering::Relaxed),
            topic_sizes: self
                .topic_sizes
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreStatsSnapshot {
    pub puts_total: u64,
    pub put_bytes_total: u64,
    pub topic_sizes: HashMap<String, u64>,
}

enum Flusher {
    RealTime(FlushRealTimeService),
    GroupCommit(GroupCommitService),
}

pub struct CommitLog {
    config: Arc<StoreConfig>,
    queue: Arc<SegmentQueue>,
    allocator: Arc<AllocateService>,
    checkpoint: Arc<StoreCheckpoint>,
    sink: Arc<dyn DispatchSink>,
    ha: Option<Arc<dyn HaService>>,
    /// Next logical offset per (topic, queue); mutated only inside the
    /// put critical section.
    topic_queue_table: DashMap<(String, u32), u64>,
    put_lock: PutLock,
    flusher: Flusher,
    stats: StoreStats,
}

impl CommitLog {
    pub fn new(
        config: StoreConfig,
        sink: Arc<dyn DispatchSink>,
        ha: Option<Arc<dyn HaService>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let allocator = Arc::new(AllocateService::new(Arc::clone(&config)));
        let queue = Arc::new(SegmentQueue::new(
            config.store_path_commit_log.clone(),
            config.mapped_file_size_commit_log,
            Arc::clone(&allocator),
        ));
        let checkpoint = Arc::new(StoreCheckpoint::new(config.checkpoint_path())?);

        let flusher = match config.flush_disk_type {
            FlushDiskType::Sync => Flusher::GroupCommit(GroupCommitService::new()),
            FlushDiskType::Async => Flusher::RealTime(FlushRealTimeService::new()),
        };

        Ok(Self {
            put_lock: PutLock::new(config.use_reentrant_lock_when_put_message),
            config,
            queue,
            allocator,
            checkpoint,
            sink,
            ha,
            topic_queue_table: DashMap::new(),
            flusher,
            stats: StoreStats::default(),
        })
    }

    /// Map the segment files found on disk.
    pub fn load(&self) -> Result<()> {
        let result = self.queue.load();
        info!(
            ok = result.is_ok(),
            "load commit log {}",
            if result.is_ok() { "OK" } else { "failed" }
        );
        result
    }

    /// Start the flusher service.
    pub fn start(&self) {
        match &self.flusher {
            Flusher::RealTime(service) => service.start(
                Arc::clone(&self.config),
                Arc::clone(&self.queue),
                Arc::clone(&self.checkpoint),
            ),
            Flusher::GroupCommit(service) => {
                service.start(Arc::clone(&self.queue), Arc::clone(&self.checkpoint))
            }
        }
    }

    pub fn shutdown(&self) {
        match &self.flusher {
            Flusher::RealTime(service) => service.shutdown(),
            Flusher::GroupCommit(service) => service.shutdown(),
        }
        self.allocator.shutdown();
        if let Err(e) = self.checkpoint.flush() {
            warn!(error = %e, "checkpoint flush on shutdown failed");
        }
    }

    pub fn destroy(&self) {
        self.queue.destroy();
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &Arc<StoreCheckpoint> {
        &self.checkpoint
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Physical offset of the first byte still stored.
    pub fn min_offset(&self) -> u64 {
        match self.queue.first() {
            Some(first) if first.is_available() => first.base_offset(),
            Some(first) => self.roll_next_file(first.base_offset()),
            None => 0,
        }
    }

    /// Physical offset one past the last appended byte.
    pub fn max_offset(&self) -> u64 {
        self.queue.max_offset()
    }

    /// First offset of the segment following the one containing `offset`.
    pub fn roll_next_file(&self, offset: u64) -> u64 {
        let size = self.config.mapped_file_size_commit_log as u64;
        offset + size - offset % size
    }

    pub fn committed_where(&self) -> u64 {
        self.queue.committed_where()
    }

    /// Force everything appended so far to disk; returns the committed
    /// cursor afterwards.
    pub fn flush(&self) -> u64 {
        while self.queue.flush(0) {}
        self.queue.committed_where()
    }

    /// Persist one message. Durability settling (sync flush, HA ack)
    /// happens after the put-lock is released; only a dispatch failure is
    /// an `Err`.
    pub fn put_message(&self, mut msg: BrokerMessage) -> Result<PutResult> {
        msg.body_crc = crc32fast::hash(&msg.body);
        msg.store_host = self.config.store_host;

        let transaction_type = msg.transaction_type();
        if transaction_type.is_consumable() && msg.delay_level() > 0 {
            self.rewrite_for_schedule(&mut msg);
        }

        let (status, append) = self.append_under_lock(&msg, transaction_type)?;
        let result = match append {
            Some(result) if status == PutStatus::PutOk => result,
            other => return Ok(PutResult { status, append: other }),
        };

        self.stats.record_put(&msg.topic, result.wrote_bytes);

        let next_offset = result.wrote_offset + result.wrote_bytes as u64;
        let mut status = self.handle_disk_flush(&msg, next_offset);
        if let Some(ha_status) = self.handle_ha(&msg, next_offset) {
            status = ha_status;
        }

        Ok(PutResult {
            status,
            append: Some(result),
        })
    }

    /// Delayed delivery parks the record on the schedule topic; the real
    /// destination is stashed in properties for the delay service.
    fn rewrite_for_schedule(&self, msg: &mut BrokerMessage) {
        let level = msg.delay_level().min(schedule::max_delay_level());
        let real_topic = std::mem::replace(&mut msg.topic, schedule::SCHEDULE_TOPIC.to_string());
        let real_queue_id = msg.queue_id;

        msg.properties
            .insert(property::REAL_TOPIC.to_string(), real_topic);
        msg.properties
            .insert(property::REAL_QUEUE_ID.to_string(), real_queue_id.to_string());
        msg.set_delay_level(level);
        msg.queue_id = schedule::delay_level_to_queue_id(level);
    }

    /// Steps 2–7 of the put path: encode, lock, append (with one rotation
    /// retry), dispatch, unlock.
    fn append_under_lock(
        &self,
        msg: &BrokerMessage,
        transaction_type: TransactionType,
    ) -> Result<(PutStatus, Option<AppendResult>)> {
        STAGING.with(|cell| {
            let mut staged = cell.borrow_mut();
            if let Err(e) = codec::encode_record(&mut staged, msg) {
                warn!(topic = %msg.topic, error = %e, "message rejected");
                return Ok((PutStatus::MessageIllegal, None));
            }
            if staged.len() > self.config.max_message_size {
                warn!(
                    topic = %msg.topic,
                    size = staged.len(),
                    max = self.config.max_message_size,
                    "message size exceeded"
                );
                return Ok((PutStatus::MessageIllegal, None));
            }

            self.put_lock.lock();
            let guard = PutLockGuard(&self.put_lock);
            let began = Instant::now();

            let Some(tail) = self.queue.tail(None) else {
                error!(topic = %msg.topic, "create segment failed");
                return Ok((PutStatus::CreateSegmentFailed, None));
            };

            let mut result = self.do_append(&tail, &mut staged, msg, transaction_type);
            if result.status == AppendStatus::EndOfFile {
                // The tail was padded out; rotate and retry exactly once.
                let Some(tail) = self.queue.tail(None) else {
                    error!(topic = %msg.topic, "create segment failed after rotation");
                    return Ok((PutStatus::CreateSegmentFailed, Some(result)));
                };
                result = self.do_append(&tail, &mut staged, msg, transaction_type);
                if result.status == AppendStatus::EndOfFile {
                    error!(
                        topic = %msg.topic,
                        wrote_offset = result.wrote_offset,
                        "[BUG] append hit end of file twice in a row"
                    );
                    return Ok((PutStatus::UnknownError, Some(result)));
                }
            }
            if result.status == AppendStatus::UnknownError {
                return Ok((PutStatus::UnknownError, Some(result)));
            }

            let dispatch = self.build_dispatch_request(msg, &result);
            self.sink.dispatch(&dispatch)?;

            let elapsed = began.elapsed();
            drop(guard);
            if elapsed > Duration::from_millis(1000) {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "put message held the lock unusually long"
                );
            }

            Ok((PutStatus::PutOk, Some(result)))
        })
    }

    /// Reserve the physical offset and fill the mapped bytes. Runs inside
    /// the put-lock so the fields that depend on the assigned offset are
    /// written exactly once.
    fn do_append(
        &self,
        tail: &Segment,
        staged: &mut BytesMut,
        msg: &BrokerMessage,
        transaction_type: TransactionType,
    ) -> AppendResult {
        let key = (msg.topic.clone(), msg.queue_id);
        let table = &self.topic_queue_table;
        let store_host = msg.store_host;

        tail.append(move |wrote_offset, buf, max_blank| {
            let msg_id = codec::create_message_id(&store_host, wrote_offset);
            let store_timestamp = unix_millis();

            let mut entry = table.entry(key).or_insert(0);
            // Prepared and rollback records never enter the consume
            // queue; their logical offset is pinned to zero.
            let queue_offset = match transaction_type {
                TransactionType::Prepared | TransactionType::Rollback => 0,
                _ => *entry,
            };

            let total_size = staged.len();
            if total_size + codec::END_FILE_MIN_BLANK > max_blank {
                codec::write_padding_frame(buf, max_blank);
                return AppendResult {
                    status: AppendStatus::EndOfFile,
                    wrote_offset,
                    wrote_bytes: max_blank,
                    msg_id,
                    store_timestamp,
                    queue_offset,
                };
            }

            codec::patch_reserved_fields(staged, queue_offset, wrote_offset, store_timestamp);
            buf[..total_size].copy_from_slice(staged);

            if transaction_type.is_consumable() {
                *entry += 1;
            }

            AppendResult {
                status: AppendStatus::PutOk,
                wrote_offset,
                wrote_bytes: total_size,
                msg_id,
                store_timestamp,
                queue_offset,
            }
        })
    }

    fn build_dispatch_request(&self, msg: &BrokerMessage, result: &AppendResult) -> DispatchRequest {
        let tags_code = if msg.topic == schedule::SCHEDULE_TOPIC {
            let level = msg.delay_level().min(schedule::max_delay_level());
            if level > 0 {
                schedule::deliver_timestamp(level, result.store_timestamp) as i64
            } else {
                0
            }
        } else {
            msg.tags()
                .filter(|t| !t.is_empty())
                .map(tags_string_to_tags_code)
                .unwrap_or(0)
        };

        DispatchRequest {
            topic: msg.topic.clone(),
            queue_id: msg.queue_id,
            physical_offset: result.wrote_offset,
            size: result.wrote_bytes as u32,
            tags_code,
            store_timestamp: result.store_timestamp,
            queue_offset: result.queue_offset,
            keys: msg.keys(),
            sys_flag: msg.sys_flag,
            prepared_transaction_offset: msg.prepared_transaction_offset,
        }
    }

    fn handle_disk_flush(&self, msg: &BrokerMessage, next_offset: u64) -> PutStatus {
        match &self.flusher {
            Flusher::GroupCommit(service) => {
                if msg.wait_store_msg_ok() {
                    let request = GroupCommitRequest::new(next_offset);
                    service.put_request(request.clone());
                    let flush_ok = request
                        .wait_for_flush(Duration::from_millis(self.config.sync_flush_timeout));
                    if !flush_ok {
                        error!(
                            topic = %msg.topic,
                            next_offset,
                            "group commit wait for flush failed"
                        );
                        return PutStatus::FlushDiskTimeout;
                    }
                } else {
                    service.wakeup();
                }
            }
            Flusher::RealTime(service) => service.wakeup(),
        }
        PutStatus::PutOk
    }

    fn handle_ha(&self, msg: &BrokerMessage, next_offset: u64) -> Option<PutStatus> {
        if self.config.broker_role != BrokerRole::SyncMaster || !msg.wait_store_msg_ok() {
            return None;
        }

        let Some(ha) = &self.ha else {
            return Some(PutStatus::SlaveNotAvailable);
        };

        if !ha.is_slave_ok(next_offset) {
            return Some(PutStatus::SlaveNotAvailable);
        }

        let request = GroupCommitRequest::new(next_offset);
        ha.put_request(request.clone());
        ha.wakeup();
        if !request.wait_for_flush(Duration::from_millis(self.config.sync_flush_timeout)) {
            error!(
                topic = %msg.topic,
                next_offset,
                "sync transfer to slave did not complete in time"
            );
            return Some(PutStatus::FlushSlaveTimeout);
        }
        None
    }

    /// Replay already-framed bytes at `start_offset`; used by slave roles
    /// catching up from a master.
    pub fn append_raw(&self, start_offset: u64, data: &[u8]) -> bool {
        self.put_lock.lock();
        let _guard = PutLockGuard(&self.put_lock);

        let Some(tail) = self.queue.tail(Some(start_offset)) else {
            error!(start_offset, "append_raw could not obtain a tail segment");
            return false;
        };
        tail.append_raw(data)
    }

    /// Shared view from `offset` to the end of written data in its
    /// segment; used for replication reads.
    pub fn get_data(&self, offset: u64) -> Option<MappedView> {
        self.get_data_with(offset, offset == 0)
    }

    pub fn get_data_with(&self, offset: u64, return_first_on_miss: bool) -> Option<MappedView> {
        let segment = self.queue.find_by_offset(offset, return_first_on_miss)?;
        let pos = (offset % self.config.mapped_file_size_commit_log as u64) as usize;
        segment.select_view_from(pos)
    }

    /// Shared view of exactly `size` bytes at `offset`.
    pub fn get_message(&self, offset: u64, size: usize) -> Option<MappedView> {
        let segment = self.queue.find_by_offset(offset, offset == 0)?;
        let pos = (offset % self.config.mapped_file_size_commit_log as u64) as usize;
        segment.select_view(pos, size)
    }

    /// Store timestamp of the record at `offset`, or -1 when unreadable.
    pub fn pickup_store_timestamp(&self, offset: u64, size: usize) -> i64 {
        if offset >= self.min_offset() {
            if let Some(view) = self.get_message(offset, size) {
                if let Some(ts) = codec::store_timestamp_of(view.bytes()) {
                    return ts as i64;
                }
            }
        }
        -1
    }

    /// Recovery after a clean shutdown: every page reached disk, so only
    /// the last three segments need scanning to find the tail.
    pub fn recover_normally(&self) {
        let check_crc = self.config.check_crc_on_recover;
        let segments = self.queue.segments_snapshot();
        if segments.is_empty() {
            self.queue.set_committed_where(0);
            return;
        }

        let index = segments.len().saturating_sub(3);
        let process_offset = self.scan_from(&segments, index, check_crc, None);
        self.queue.set_committed_where(process_offset);
        self.queue.truncate_dirty(process_offset);
    }

    /// Recovery after a crash: find the newest segment whose first record
    /// predates the checkpoint, rescan from there, re-dispatching every
    /// record so downstream indexes can rebuild, then truncate both sides.
    pub fn recover_abnormally(&self) -> Result<()> {
        let check_crc = self.config.check_crc_on_recover;
        let segments = self.queue.segments_snapshot();
        if segments.is_empty() {
            self.queue.set_committed_where(0);
            self.sink.truncate_above(0);
            return Ok(());
        }

        let mut index = segments.len() - 1;
        loop {
            if self.is_segment_matched_recover(&segments[index]) {
                info!(
                    base = segments[index].base_offset(),
                    "abnormal recovery starts from this segment"
                );
                break;
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }

        let mut dispatch_error = None;
        let process_offset = self.scan_from(
            &segments,
            index,
            check_crc,
            Some(&mut |request: &DispatchRequest| {
                if dispatch_error.is_none() {
                    if let Err(e) = self.sink.dispatch(request) {
                        dispatch_error = Some(e);
                    }
                }
            }),
        );
        if let Some(e) = dispatch_error {
            return Err(e);
        }

        self.queue.set_committed_where(process_offset);
        self.queue.truncate_dirty(process_offset);
        self.sink.truncate_above(process_offset);
        Ok(())
    }

    /// Forward-scan segments starting at `index`, classifying each frame,
    /// and return the offset one past the last valid record.
    fn scan_from(
        &self,
        segments: &[Arc<Segment>],
        mut index: usize,
        check_crc: bool,
        mut on_record: Option<&mut dyn FnMut(&DispatchRequest)>,
    ) -> u64 {
        let mut process_offset = segments[index].base_offset();
        let mut mapped_offset = 0usize;

        'segments: loop {
            let segment = &segments[index];
            let slice = segment.mapped_slice();

            while mapped_offset + codec::END_FILE_MIN_BLANK <= segment.size() {
                match codec::check_record(&slice[mapped_offset..], check_crc) {
                    codec::RecordCheck::Data(request) => {
                        mapped_offset += request.size as usize;
                        if let Some(callback) = on_record.as_deref_mut() {
                            callback(&request);
                        }
                    }
                    codec::RecordCheck::Padding => {
                        // End of this segment; resume at the next one.
                        index += 1;
                        if index >= segments.len() {
                            info!(
                                base = segment.base_offset(),
                                "recovery reached the end of the last segment"
                            );
                            break 'segments;
                        }
                        process_offset = segments[index].base_offset();
                        mapped_offset = 0;
                        continue 'segments;
                    }
                    codec::RecordCheck::Corrupt => {
                        info!(
                            base = segment.base_offset(),
                            at = mapped_offset,
                            "recovery found the truncation point"
                        );
                        break 'segments;
                    }
                }
            }
            break;
        }

        process_offset + mapped_offset as u64
    }

    /// A segment is a valid abnormal-recovery start when its first record
    /// is intact and not newer than what the checkpoint knows durable.
    fn is_segment_matched_recover(&self, segment: &Segment) -> bool {
        let slice = segment.mapped_slice();

        match codec::magic_of(slice) {
            Some(codec::DATA_MAGIC) => {}
            _ => return false,
        }

        let store_timestamp = match codec::store_timestamp_of(slice) {
            Some(ts) if ts != 0 => ts,
            _ => return false,
        };

        if store_timestamp <= self.checkpoint.min_timestamp() {
            info!(store_timestamp, "found checkpoint-covered timestamp");
            return true;
        }
        false
    }

    /// Next logical offset for a (topic, queue) pair, if one was assigned.
    pub fn next_queue_offset(&self, topic: &str, queue_id: u32) -> Option<u64> {
        self.topic_queue_table
            .get(&(topic.to_string(), queue_id))
            .map(|v| *v)
    }

    /// Replace the logical-offset table; embedders call this after their
    /// index recovery re-derives the per-queue positions.
    pub fn set_topic_queue_table(&self, entries: HashMap<(String, u32), u64>) {
        self.topic_queue_table.clear();
        for (key, value) in entries {
            self.topic_queue_table.insert(key, value);
        }
    }

    pub fn remove_queue_from_table(&self, topic: &str, queue_id: u32) {
        self.topic_queue_table
            .remove(&(topic.to_string(), queue_id));
        info!(topic, queue_id, "removed queue from topic queue table");
    }

    /// Reclaim segments older than `expire_ms`.
    pub fn delete_expired_file(
        &self,
        expire_ms: u64,
        delete_interval_ms: u64,
        force_after: Duration,
        immediately: bool,
    ) -> usize {
        self.queue
            .delete_expired_by_time(expire_ms, delete_interval_ms, force_after, immediately)
    }

    pub fn retry_delete_first_file(&self, force_after: Duration) -> bool {
        self.queue.retry_delete_first(force_after)
    }
}
