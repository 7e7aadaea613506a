//! Broker-internal message representation and its property/flag encodings.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Property keys recognized by the storage engine.
pub mod property {
    pub const KEYS: &str = "KEYS";
    pub const TAGS: &str = "TAGS";
    pub const DELAY_TIME_LEVEL: &str = "DELAY";
    pub const REAL_TOPIC: &str = "REAL_TOPIC";
    pub const REAL_QUEUE_ID: &str = "REAL_QID";
    pub const WAIT_STORE_MSG_OK: &str = "WAIT";
}

/// Bit assignments within the record sys-flag word.
pub mod sys_flag {
    pub const COMPRESSED: u32 = 1;
    pub const MULTI_TAGS: u32 = 1 << 1;

    pub const TRANSACTION_NOT: u32 = 0;
    pub const TRANSACTION_PREPARED: u32 = 1 << 2;
    pub const TRANSACTION_COMMIT: u32 = 2 << 2;
    pub const TRANSACTION_ROLLBACK: u32 = 3 << 2;
    pub const TRANSACTION_MASK: u32 = 3 << 2;
}

/// Transaction stage encoded in a record's sys-flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Not,
    Prepared,
    Commit,
    Rollback,
}

impl TransactionType {
    pub fn from_sys_flag(flag: u32) -> Self {
        match flag & sys_flag::TRANSACTION_MASK {
            sys_flag::TRANSACTION_PREPARED => TransactionType::Prepared,
            sys_flag::TRANSACTION_COMMIT => TransactionType::Commit,
            sys_flag::TRANSACTION_ROLLBACK => TransactionType::Rollback,
            _ => TransactionType::Not,
        }
    }

    /// Records in these stages enter the consume queue and advance the
    /// per-queue logical offset.
    pub fn is_consumable(self) -> bool {
        matches!(self, TransactionType::Not | TransactionType::Commit)
    }
}

/// Separator between `key=value` pairs in the encoded property string.
pub const PROPERTY_SEPARATOR: char = '\u{1f}';

/// Serialize properties as `key=value` pairs joined by the unit separator.
pub fn properties_to_string(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        if !out.is_empty() {
            out.push(PROPERTY_SEPARATOR);
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

pub fn string_to_properties(raw: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for pair in raw.split(PROPERTY_SEPARATOR) {
        if let Some((key, value)) = pair.split_once('=') {
            properties.insert(key.to_string(), value.to_string());
        }
    }
    properties
}

/// Deterministic code for a tags string, stable across restarts so the
/// dispatch path and recovery agree on the value.
pub fn tags_string_to_tags_code(tags: &str) -> i64 {
    let mut code: i64 = 0;
    for b in tags.bytes() {
        code = code.wrapping_mul(31).wrapping_add(b as i64);
    }
    code
}

/// A message as handed to the storage engine by the broker front-end.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub queue_id: u32,
    /// Opaque to the engine; persisted verbatim.
    pub flag: u32,
    pub body: Bytes,
    pub sys_flag: u32,
    pub born_timestamp: u64,
    pub born_host: SocketAddrV4,
    pub store_host: SocketAddrV4,
    pub reconsume_times: u32,
    pub prepared_transaction_offset: u64,
    pub properties: BTreeMap<String, String>,
    /// CRC-32 of the body, filled in by the engine before the append.
    pub body_crc: u32,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, queue_id: u32, body: Bytes) -> Self {
        let localhost = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body,
            sys_flag: sys_flag::TRANSACTION_NOT,
            born_timestamp: crate::util::unix_millis(),
            born_host: localhost,
            store_host: localhost,
            reconsume_times: 0,
            prepared_transaction_offset: 0,
            properties: BTreeMap::new(),
            body_crc: 0,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_sys_flag(mut self, sys_flag: u32) -> Self {
        self.sys_flag = sys_flag;
        self
    }

    pub fn with_delay_level(mut self, level: u32) -> Self {
        self.properties
            .insert(property::DELAY_TIME_LEVEL.to_string(), level.to_string());
        self
    }

    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_sys_flag(self.sys_flag)
    }

    pub fn delay_level(&self) -> u32 {
        self.properties
            .get(property::DELAY_TIME_LEVEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_delay_level(&mut self, level: u32) {
        self.properties
            .insert(property::DELAY_TIME_LEVEL.to_string(), level.to_string());
    }

    pub fn tags(&self) -> Option<&str> {
        self.properties.get(property::TAGS).map(String::as_str)
    }

    pub fn keys(&self) -> String {
        self.properties
            .get(property::KEYS)
            .cloned()
            .unwrap_or_default()
    }

    /// Producers opt out of durability waits with `WAIT=false`; absence
    /// means waiting is requested.
    pub fn wait_store_msg_ok(&self) -> bool {
        self.properties
            .get(property::WAIT_STORE_MSG_OK)
            .map(|v| v != "false")
            .unwrap_or(true)
    }

    pub fn properties_string(&self) -> String {
        properties_to_string(&self.properties)
    }
}

/// Pack an IPv4 socket address into the 8-byte on-disk host field.
pub fn host_to_bytes(addr: &SocketAddrV4) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&(u32::from(addr.port())).to_be_bytes());
    out
}
