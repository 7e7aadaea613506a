//! Hand-off of persisted records to downstream index builders.

use crate::Result;

/// Metadata of one persisted data record, delivered to index builders in
/// physical-offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: u32,
    pub physical_offset: u64,
    pub size: u32,
    pub tags_code: i64,
    pub store_timestamp: u64,
    pub queue_offset: u64,
    pub keys: String,
    pub sys_flag: u32,
    pub prepared_transaction_offset: u64,
}

/// Consumer of persisted-record metadata.
///
/// The engine calls `dispatch` exactly once per persisted data record, in
/// physical-offset order, and treats a failure as fatal: errors propagate
/// out of the put path and the recovery scan rather than being retried.
pub trait DispatchSink: Send + Sync {
    fn dispatch(&self, request: &DispatchRequest) -> Result<()>;

    /// Drop any index data derived from records beyond `physical_offset`.
    /// Invoked after abnormal recovery truncates the log.
    fn truncate_above(&self, physical_offset: u64);
}

/// Sink that drops everything; for embedders that build no indexes.
#[derive(Debug, Default)]
pub struct NullDispatchSink;

impl DispatchSink for NullDispatchSink {
    fn dispatch(&self, _request: &DispatchRequest) -> Result<()> {
        Ok(())
    }

    fn truncate_above(&self, _physical_offset: u64) {}
}
