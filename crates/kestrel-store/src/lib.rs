//! Append-only commit log storage engine for the kestrel message broker.
//!
//! Messages are persisted into a sequence of fixed-size memory-mapped
//! segment files, each append returning a globally monotonic physical
//! offset. The engine owns the single-writer critical section, segment
//! rotation with end-of-file padding, asynchronous and group-committed
//! flushing, crash recovery, and expired-segment reclamation. Downstream
//! index builders receive every persisted record through [`DispatchSink`].
//!
//! # Data Directory Exclusivity
//!
//! The store directory MUST be treated as exclusive to the broker process.
//! External modification of segment files while the broker is running can
//! cause undefined behavior including SIGBUS signals; this is a fundamental
//! property of memory-mapped I/O.

pub mod allocate;
pub mod checkpoint;
pub mod codec;
pub mod commitlog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flush;
pub mod ha;
pub mod message;
pub mod queue;
pub mod schedule;
pub mod segment;

mod service;
mod util;

pub use checkpoint::StoreCheckpoint;
pub use commitlog::{CommitLog, PutResult, PutStatus, StoreStatsSnapshot};
pub use config::{BrokerRole, FlushDiskType, StoreConfig};
pub use dispatch::{DispatchRequest, DispatchSink, NullDispatchSink};
pub use error::{Error, Result};
pub use flush::GroupCommitRequest;
pub use ha::HaService;
pub use message::{BrokerMessage, TransactionType};
pub use queue::SegmentQueue;
pub use segment::{AppendResult, AppendStatus, MappedView, Segment};
