//! Binary record frame: encode, classify, message-id synthesis.
//!
//! Frame layout, big-endian (offsets in bytes):
//!
//! ```text
//!  0  total_size      u32
//!  4  magic           u32   0xDAA320A7 data, 0xCBD43194 padding
//!  8  body_crc        u32
//! 12  queue_id        u32
//! 16  flag            u32
//! 20  queue_offset    u64   patched inside the critical section
//! 28  physical_offset u64   patched inside the critical section
//! 36  sys_flag        u32
//! 40  born_timestamp  u64
//! 48  born_host       8B    ipv4 + port
//! 56  store_timestamp u64   patched inside the critical section
//! 64  store_host      8B
//! 72  reconsume_times u32
//! 76  prepared_txn    u64
//! 84  body_len u32 + body
//!     topic_len u8 + topic
//!     props_len u16 + props
//! ```
//!
//! A padding frame carries only the first two fields; its total_size is the
//! remaining byte count of the segment.

use bytes::{BufMut, BytesMut};
use std::net::SocketAddrV4;

use crate::dispatch::DispatchRequest;
use crate::message::{
    host_to_bytes, string_to_properties, tags_string_to_tags_code, BrokerMessage,
};
use crate::message::property;
use crate::schedule;
use crate::{Error, Result};

pub const DATA_MAGIC: u32 = 0xDAA3_20A7;
pub const BLANK_MAGIC: u32 = 0xCBD4_3194;

/// Byte size of everything except body, topic and properties payloads.
pub const RECORD_FIXED_LEN: usize = 91;

/// A padding frame needs at least total_size + magic, so a data record is
/// only placed when it leaves no tail gap smaller than this.
pub const END_FILE_MIN_BLANK: usize = 8;

pub const MAGIC_POS: usize = 4;
pub const QUEUE_OFFSET_POS: usize = 20;
pub const PHYSICAL_OFFSET_POS: usize = 28;
pub const STORE_TIMESTAMP_POS: usize = 56;

pub const MAX_TOPIC_LEN: usize = 127;
pub const MAX_PROPERTIES_LEN: usize = 32767;

/// Total frame bytes for the given variable-length payloads.
pub fn compute_record_len(body_len: usize, topic_len: usize, properties_len: usize) -> usize {
    RECORD_FIXED_LEN + body_len + topic_len + properties_len
}

/// Encode `msg` into `buf` (cleared first). The queue offset, physical
/// offset and store timestamp are left zero for the appender to patch.
pub fn encode_record(buf: &mut BytesMut, msg: &BrokerMessage) -> Result<usize> {
    let properties = msg.properties_string();
    let topic_len = msg.topic.len();
    let props_len = properties.len();
    let body_len = msg.body.len();

    if topic_len == 0 || topic_len > MAX_TOPIC_LEN {
        return Err(Error::InvalidMessage(format!(
            "topic length {} out of range [1, {}]",
            topic_len, MAX_TOPIC_LEN
        )));
    }
    if props_len > MAX_PROPERTIES_LEN {
        return Err(Error::InvalidMessage(format!(
            "properties length {} exceeds {}",
            props_len, MAX_PROPERTIES_LEN
        )));
    }

    let total_size = compute_record_len(body_len, topic_len, props_len);

    buf.clear();
    buf.reserve(total_size);
    buf.put_u32(total_size as u32);
    buf.put_u32(DATA_MAGIC);
    buf.put_u32(msg.body_crc);
    buf.put_u32(msg.queue_id);
    buf.put_u32(msg.flag);
    buf.put_u64(0); // queue offset
    buf.put_u64(0); // physical offset
    buf.put_u32(msg.sys_flag);
    buf.put_u64(msg.born_timestamp);
    buf.put_slice(&host_to_bytes(&msg.born_host));
    buf.put_u64(0); // store timestamp
    buf.put_slice(&host_to_bytes(&msg.store_host));
    buf.put_u32(msg.reconsume_times);
    buf.put_u64(msg.prepared_transaction_offset);
    buf.put_u32(body_len as u32);
    buf.put_slice(&msg.body);
    buf.put_u8(topic_len as u8);
    buf.put_slice(msg.topic.as_bytes());
    buf.put_u16(props_len as u16);
    buf.put_slice(properties.as_bytes());

    debug_assert_eq!(buf.len(), total_size);
    Ok(total_size)
}

/// Overwrite the three fields reserved at encode time.
pub fn patch_reserved_fields(
    frame: &mut [u8],
    queue_offset: u64,
    physical_offset: u64,
    store_timestamp: u64,
) {
    frame[QUEUE_OFFSET_POS..QUEUE_OFFSET_POS + 8].copy_from_slice(&queue_offset.to_be_bytes());
    frame[PHYSICAL_OFFSET_POS..PHYSICAL_OFFSET_POS + 8]
        .copy_from_slice(&physical_offset.to_be_bytes());
    frame[STORE_TIMESTAMP_POS..STORE_TIMESTAMP_POS + 8]
        .copy_from_slice(&store_timestamp.to_be_bytes());
}

/// Write a padding frame covering `blank` bytes into `buf`.
pub fn write_padding_frame(buf: &mut [u8], blank: usize) {
    buf[0..4].copy_from_slice(&(blank as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&BLANK_MAGIC.to_be_bytes());
}

/// Message id: store host (8 bytes) followed by the physical offset (8
/// bytes), hex-encoded.
pub fn create_message_id(store_host: &SocketAddrV4, physical_offset: u64) -> String {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&host_to_bytes(store_host));
    raw[8..].copy_from_slice(&physical_offset.to_be_bytes());
    let mut id = String::with_capacity(32);
    for b in raw {
        id.push_str(&format!("{:02X}", b));
    }
    id
}

/// Outcome of classifying one frame during a recovery scan.
#[derive(Debug)]
pub enum RecordCheck {
    /// A well-formed data record of `request.size` bytes.
    Data(Box<DispatchRequest>),
    /// End-of-segment padding; the scan hops to the next segment.
    Padding,
    /// Torn or foreign bytes; the scan truncates here.
    Corrupt,
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn get_u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }

    fn get_u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    fn get_u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes(bytes.try_into().ok()?))
    }

    fn get_u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }
}

/// Classify the frame at the start of `buf` (which extends to the end of
/// the segment's written region).
pub fn check_record(buf: &[u8], check_crc: bool) -> RecordCheck {
    match try_parse_record(buf, check_crc) {
        Some(check) => check,
        None => RecordCheck::Corrupt,
    }
}

fn try_parse_record(buf: &[u8], check_crc: bool) -> Option<RecordCheck> {
    let mut reader = FrameReader::new(buf);

    let total_size = reader.get_u32()?;
    let magic = reader.get_u32()?;
    match magic {
        DATA_MAGIC => {}
        BLANK_MAGIC => return Some(RecordCheck::Padding),
        other => {
            tracing::warn!(magic = format_args!("{:#010x}", other), "illegal magic code");
            return Some(RecordCheck::Corrupt);
        }
    }

    if (total_size as usize) < RECORD_FIXED_LEN || total_size as usize > buf.len() {
        return Some(RecordCheck::Corrupt);
    }

    let body_crc = reader.get_u32()?;
    let queue_id = reader.get_u32()?;
    let _flag = reader.get_u32()?;
    let queue_offset = reader.get_u64()?;
    let physical_offset = reader.get_u64()?;
    let sys_flag = reader.get_u32()?;
    let _born_timestamp = reader.get_u64()?;
    let _born_host = reader.take(8)?;
    let store_timestamp = reader.get_u64()?;
    let _store_host = reader.take(8)?;
    let _reconsume_times = reader.get_u32()?;
    let prepared_transaction_offset = reader.get_u64()?;

    let body_len = reader.get_u32()? as usize;
    let body = reader.take(body_len)?;
    if check_crc && body_len > 0 {
        let crc = crc32fast::hash(body);
        if crc != body_crc {
            tracing::warn!(expected = body_crc, actual = crc, "body CRC check failed");
            return Some(RecordCheck::Corrupt);
        }
    }

    let topic_len = reader.get_u8()? as usize;
    let topic = std::str::from_utf8(reader.take(topic_len)?).ok()?;

    let props_len = reader.get_u16()? as usize;
    let mut tags_code = 0i64;
    let mut keys = String::new();
    if props_len > 0 {
        let props_raw = std::str::from_utf8(reader.take(props_len)?).ok()?;
        let properties = string_to_properties(props_raw);

        if let Some(k) = properties.get(property::KEYS) {
            keys = k.clone();
        }
        if let Some(tags) = properties.get(property::TAGS) {
            if !tags.is_empty() {
                tags_code = tags_string_to_tags_code(tags);
            }
        }

        // Scheduled records carry their deliver time as the tags code.
        if topic == schedule::SCHEDULE_TOPIC {
            if let Some(level) = properties
                .get(property::DELAY_TIME_LEVEL)
                .and_then(|v| v.parse::<u32>().ok())
            {
                let level = level.min(schedule::max_delay_level());
                if level > 0 {
                    tags_code = schedule::deliver_timestamp(level, store_timestamp) as i64;
                }
            }
        }
    }

    if reader.pos != total_size as usize {
        return Some(RecordCheck::Corrupt);
    }

    Some(RecordCheck::Data(Box::new(DispatchRequest {
        topic: topic.to_string(),
        queue_id,
        physical_offset,
        size: total_size,
        tags_code,
        store_timestamp,
        queue_offset,
        keys,
        sys_flag,
        prepared_transaction_offset,
    })))
}

/// Read the magic word of the frame at `buf[0..]`.
pub fn magic_of(buf: &[u8]) -> Option<u32> {
    let bytes = buf.get(MAGIC_POS..MAGIC_POS + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Read the store timestamp of the frame at `buf[0..]`.
pub fn store_timestamp_of(buf: &[u8]) -> Option<u64> {
    let bytes = buf.get(STORE_TIMESTAMP_POS..STORE_TIMESTAMP_POS + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::sys_flag;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    fn sample_message() -> BrokerMessage {
        let mut msg = BrokerMessage::new("orders", 3, Bytes::from_static(b"hello commit log"));
        msg.born_host = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 9), 41000);
        msg.store_host = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 10911);
        msg.flag = 7;
        msg.body_crc = crc32fast::hash(&msg.body);
        msg.properties
            .insert("KEYS".to_string(), "k-1".to_string());
        msg.properties
            .insert("TAGS".to_string(), "alpha".to_string());
        msg
    }

    #[test]
    fn test_compute_record_len_matches_encoder() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        let total = encode_record(&mut buf, &msg).unwrap();
        assert_eq!(total, buf.len());
        assert_eq!(
            total,
            compute_record_len(msg.body.len(), msg.topic.len(), msg.properties_string().len())
        );
    }

    #[test]
    fn test_encode_then_check_round_trip() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        encode_record(&mut buf, &msg).unwrap();

        let mut frame = buf.to_vec();
        patch_reserved_fields(&mut frame, 11, 4096, 1_700_000_000_000);

        match check_record(&frame, true) {
            RecordCheck::Data(req) => {
                assert_eq!(req.topic, "orders");
                assert_eq!(req.queue_id, 3);
                assert_eq!(req.queue_offset, 11);
                assert_eq!(req.physical_offset, 4096);
                assert_eq!(req.store_timestamp, 1_700_000_000_000);
                assert_eq!(req.size as usize, frame.len());
                assert_eq!(req.keys, "k-1");
                assert_eq!(req.tags_code, tags_string_to_tags_code("alpha"));
                assert_eq!(req.sys_flag, sys_flag::TRANSACTION_NOT);
            }
            other => panic!("expected data record, got {:?}", other),
        }
    }

    #[test]
    fn test_check_rejects_corrupt_body() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        encode_record(&mut buf, &msg).unwrap();
        let mut frame = buf.to_vec();

        // Flip a body byte; the stored CRC no longer matches.
        frame[90] ^= 0xFF;
        assert!(matches!(check_record(&frame, true), RecordCheck::Corrupt));
        // Without CRC verification the frame still parses.
        assert!(matches!(check_record(&frame, false), RecordCheck::Data(_)));
    }

    #[test]
    fn test_check_classifies_padding() {
        let mut frame = vec![0u8; 64];
        write_padding_frame(&mut frame, 64);
        assert!(matches!(check_record(&frame, true), RecordCheck::Padding));
    }

    #[test]
    fn test_check_rejects_bad_magic() {
        let mut frame = vec![0u8; 64];
        frame[..4].copy_from_slice(&64u32.to_be_bytes());
        frame[4..8].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        assert!(matches!(check_record(&frame, true), RecordCheck::Corrupt));
    }

    #[test]
    fn test_check_rejects_truncated_frame() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        encode_record(&mut buf, &msg).unwrap();
        let frame = buf.to_vec();

        // A frame cut short anywhere inside is a truncation point.
        assert!(matches!(
            check_record(&frame[..frame.len() - 3], true),
            RecordCheck::Corrupt
        ));
        assert!(matches!(check_record(&frame[..6], true), RecordCheck::Corrupt));
    }

    #[test]
    fn test_message_id_layout() {
        let host = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 10911);
        let id = create_message_id(&host, 0x1234);
        assert_eq!(id.len(), 32);
        assert_eq!(&id[..8], "0A000001");
        assert!(id.ends_with("1234"));
    }

    #[test]
    fn test_schedule_topic_tags_code_is_deliver_time() {
        let mut msg = sample_message();
        msg.topic = schedule::SCHEDULE_TOPIC.to_string();
        msg.set_delay_level(3);

        let mut buf = BytesMut::new();
        encode_record(&mut buf, &msg).unwrap();
        let mut frame = buf.to_vec();
        patch_reserved_fields(&mut frame, 0, 0, 1_000_000);

        match check_record(&frame, true) {
            RecordCheck::Data(req) => {
                assert_eq!(
                    req.tags_code,
                    schedule::deliver_timestamp(3, 1_000_000) as i64
                );
            }
            other => panic!("expected data record, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_oversized_topic() {
        let mut msg = sample_message();
        msg.topic = "t".repeat(128);
        let mut buf = BytesMut::new();
        assert!(encode_record(&mut buf, &msg).is_err());
    }
}
