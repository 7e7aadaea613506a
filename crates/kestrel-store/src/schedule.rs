//! Scheduled-delivery rewrite rule.
//!
//! Delayed messages are parked on a dedicated topic until their deliver
//! time; the delay queue itself lives outside the storage engine. The
//! engine only rewrites the destination and computes the deliver timestamp
//! used as the record's tags code.

/// Topic that scheduled messages are rewritten onto.
pub const SCHEDULE_TOPIC: &str = "SCHEDULE_TOPIC_XXXX";

/// Delay durations per level, level 1 first.
const DELAY_LEVEL_MILLIS: &[u64] = &[
    1_000,
    5_000,
    10_000,
    30_000,
    60_000,
    2 * 60_000,
    3 * 60_000,
    4 * 60_000,
    5 * 60_000,
    6 * 60_000,
    7 * 60_000,
    8 * 60_000,
    9 * 60_000,
    10 * 60_000,
    20 * 60_000,
    30 * 60_000,
    60 * 60_000,
    2 * 60 * 60_000,
];

pub fn max_delay_level() -> u32 {
    DELAY_LEVEL_MILLIS.len() as u32
}

/// Each delay level gets its own queue on the schedule topic.
pub fn delay_level_to_queue_id(level: u32) -> u32 {
    level.saturating_sub(1)
}

pub fn queue_id_to_delay_level(queue_id: u32) -> u32 {
    queue_id + 1
}

/// Absolute deliver time for a record stored at `store_timestamp`.
pub fn deliver_timestamp(level: u32, store_timestamp: u64) -> u64 {
    let level = level.clamp(1, max_delay_level()) as usize;
    store_timestamp + DELAY_LEVEL_MILLIS[level - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_queue_mapping() {
        assert_eq!(delay_level_to_queue_id(1), 0);
        assert_eq!(delay_level_to_queue_id(3), 2);
        assert_eq!(queue_id_to_delay_level(2), 3);
    }

    #[test]
    fn test_deliver_timestamp() {
        assert_eq!(deliver_timestamp(1, 1_000_000), 1_001_000);
        assert_eq!(deliver_timestamp(5, 0), 60_000);
        // Out-of-range levels clamp to the table bounds.
        assert_eq!(deliver_timestamp(0, 0), 1_000);
        assert_eq!(deliver_timestamp(99, 0), 2 * 60 * 60_000);
    }
}
