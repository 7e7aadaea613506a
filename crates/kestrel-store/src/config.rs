use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

/// Durability fidelity of the commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushDiskType {
    /// Best-effort background flushing.
    Async,
    /// Group-committed fsync before the producer is acked.
    Sync,
}

/// Role of this broker within a replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerRole {
    AsyncMaster,
    SyncMaster,
    Slave,
}

/// Configuration for the commit log storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the store (checkpoint file lives here).
    pub store_path_root: PathBuf,

    /// Directory holding the commit log segment files.
    pub store_path_commit_log: PathBuf,

    /// Fixed size of every segment file, in bytes.
    pub mapped_file_size_commit_log: usize,

    /// Puts whose encoded frame exceeds this are rejected.
    pub max_message_size: usize,

    /// Flush mode selected at engine construction.
    pub flush_disk_type: FlushDiskType,

    /// Async flusher wakeup interval, milliseconds.
    pub flush_interval_commit_log: u64,

    /// Minimum number of dirty 4 KiB pages before an async flush proceeds.
    pub flush_commit_log_least_pages: usize,

    /// Interval after which the async flusher ignores the page threshold
    /// and flushes everything, milliseconds.
    pub flush_commit_log_thorough_interval: u64,

    /// Async flusher sleeps for the interval instead of waiting on
    /// notification.
    pub flush_commit_log_timed: bool,

    /// How long a sync-durable put waits for its group commit, milliseconds.
    pub sync_flush_timeout: u64,

    /// Put serialization: mutex when true, adaptive spin otherwise.
    pub use_reentrant_lock_when_put_message: bool,

    pub broker_role: BrokerRole,

    /// Verify body checksums while scanning during recovery.
    pub check_crc_on_recover: bool,

    /// Prefault newly allocated segments in the allocator thread.
    pub warm_mapped_file_enable: bool,

    /// Pages between intermediate flushes while prefaulting.
    pub flush_least_pages_when_warm: usize,

    /// Address stamped into every record as the store host.
    pub store_host: SocketAddrV4,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path_root: PathBuf::from("./store"),
            store_path_commit_log: PathBuf::from("./store/commitlog"),
            mapped_file_size_commit_log: 1024 * 1024 * 1024,
            max_message_size: 1024 * 1024 * 4,
            flush_disk_type: FlushDiskType::Async,
            flush_interval_commit_log: 500,
            flush_commit_log_least_pages: 4,
            flush_commit_log_thorough_interval: 10_000,
            flush_commit_log_timed: false,
            sync_flush_timeout: 5000,
            use_reentrant_lock_when_put_message: false,
            broker_role: BrokerRole::AsyncMaster,
            check_crc_on_recover: true,
            warm_mapped_file_enable: false,
            flush_least_pages_when_warm: 4096,
            store_host: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 10911),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store root; the commit log directory moves under it.
    pub fn with_store_path_root(mut self, root: PathBuf) -> Self {
        self.store_path_commit_log = root.join("commitlog");
        self.store_path_root = root;
        self
    }

    pub fn with_mapped_file_size(mut self, size: usize) -> Self {
        self.mapped_file_size_commit_log = size;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_flush_disk_type(mut self, flush_disk_type: FlushDiskType) -> Self {
        self.flush_disk_type = flush_disk_type;
        self
    }

    pub fn with_sync_flush_timeout(mut self, timeout_ms: u64) -> Self {
        self.sync_flush_timeout = timeout_ms;
        self
    }

    pub fn with_broker_role(mut self, role: BrokerRole) -> Self {
        self.broker_role = role;
        self
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.store_path_root.join("checkpoint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.mapped_file_size_commit_log, 1024 * 1024 * 1024);
        assert_eq!(config.max_message_size, 4 * 1024 * 1024);
        assert_eq!(config.flush_disk_type, FlushDiskType::Async);
        assert_eq!(config.flush_interval_commit_log, 500);
        assert_eq!(config.flush_commit_log_least_pages, 4);
        assert_eq!(config.sync_flush_timeout, 5000);
        assert_eq!(config.broker_role, BrokerRole::AsyncMaster);
        assert!(config.check_crc_on_recover);
    }

    #[test]
    fn test_builder_pattern() {
        let config = StoreConfig::new()
            .with_store_path_root(PathBuf::from("/var/lib/kestrel"))
            .with_mapped_file_size(64 * 1024 * 1024)
            .with_flush_disk_type(FlushDiskType::Sync)
            .with_sync_flush_timeout(1000)
            .with_broker_role(BrokerRole::SyncMaster);

        assert_eq!(config.store_path_root, PathBuf::from("/var/lib/kestrel"));
        assert_eq!(
            config.store_path_commit_log,
            PathBuf::from("/var/lib/kestrel/commitlog")
        );
        assert_eq!(config.mapped_file_size_commit_log, 64 * 1024 * 1024);
        assert_eq!(config.flush_disk_type, FlushDiskType::Sync);
        assert_eq!(config.sync_flush_timeout, 1000);
        assert_eq!(config.broker_role, BrokerRole::SyncMaster);
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("/var/lib/kestrel/checkpoint")
        );
    }

    #[test]
    fn test_serialization() {
        let config = StoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: StoreConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.mapped_file_size_commit_log,
            deserialized.mapped_file_size_commit_log
        );
        assert_eq!(config.flush_disk_type, deserialized.flush_disk_type);
        assert_eq!(config.store_host, deserialized.store_host);
    }
}
