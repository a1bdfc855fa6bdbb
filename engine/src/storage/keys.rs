//! Byte layouts of the sled keys.

use chatsync_messaging::{ConversationId, MessageId};
use chrono::{DateTime, Utc};

const SEPARATOR: u8 = 0;

/// Stable row key of a message.
///
/// Messages composed locally keep their temporary-id row forever so that
/// reconciliation never moves a record; messages first seen from the server
/// are keyed by server id.
pub(crate) fn row_key(id: &MessageId) -> String {
    match id.temp_id() {
        Some(temp_id) => temp_row_key(temp_id),
        None => format!("m:{}", id.lookup_key()),
    }
}

pub(crate) fn temp_row_key(temp_id: &str) -> String {
    format!("t:{temp_id}")
}

pub(crate) const TIMESTAMP_LEN: usize = 12;

/// Order-preserving encoding of a timestamp at full resolution: sign-flipped
/// big-endian seconds followed by big-endian nanoseconds.
pub(crate) fn timestamp_bytes(ts: DateTime<Utc>) -> [u8; TIMESTAMP_LEN] {
    let mut bytes = [0u8; TIMESTAMP_LEN];
    bytes[..8].copy_from_slice(&((ts.timestamp() as u64) ^ (1 << 63)).to_be_bytes());
    bytes[8..].copy_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
    bytes
}

pub(crate) fn decode_timestamp(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let secs: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    let nanos: [u8; 4] = bytes.get(8..TIMESTAMP_LEN)?.try_into().ok()?;
    let secs = (u64::from_be_bytes(secs) ^ (1 << 63)) as i64;
    DateTime::from_timestamp(secs, u32::from_be_bytes(nanos))
}

pub(crate) fn timeline_prefix(conversation_id: &ConversationId) -> Vec<u8> {
    let mut key = conversation_id.as_str().as_bytes().to_vec();
    key.push(SEPARATOR);
    key
}

pub(crate) fn timeline_key(
    conversation_id: &ConversationId,
    ts: DateTime<Utc>,
    row: &str,
) -> Vec<u8> {
    let mut key = timeline_prefix(conversation_id);
    key.extend_from_slice(&timestamp_bytes(ts));
    key.extend_from_slice(row.as_bytes());
    key
}

/// Exclusive upper bound for timeline entries older than `before`.
pub(crate) fn timeline_bound(conversation_id: &ConversationId, before: DateTime<Utc>) -> Vec<u8> {
    let mut key = timeline_prefix(conversation_id);
    key.extend_from_slice(&timestamp_bytes(before));
    key
}

pub(crate) fn global_timestamp_key(ts: DateTime<Utc>, row: &str) -> Vec<u8> {
    let mut key = timestamp_bytes(ts).to_vec();
    key.extend_from_slice(row.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_encoding_preserves_order() {
        let before_epoch = Utc.timestamp_millis_opt(-5_000).unwrap();
        let early = Utc.timestamp_millis_opt(1_000).unwrap();
        let late = Utc.timestamp_millis_opt(2_000).unwrap();
        assert!(timestamp_bytes(before_epoch) < timestamp_bytes(early));
        assert!(timestamp_bytes(early) < timestamp_bytes(late));
        assert_eq!(decode_timestamp(&timestamp_bytes(late)), Some(late));
    }

    #[test]
    fn test_sub_millisecond_order_and_precision() {
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let first = base + chrono::Duration::microseconds(100);
        let second = base + chrono::Duration::microseconds(900);
        let pre_epoch = Utc.timestamp_nanos(-1);
        assert!(timestamp_bytes(pre_epoch) < timestamp_bytes(Utc.timestamp_nanos(0)));
        assert!(timestamp_bytes(first) < timestamp_bytes(second));
        assert_eq!(decode_timestamp(&timestamp_bytes(first)), Some(first));
        assert_eq!(decode_timestamp(&timestamp_bytes(pre_epoch)), Some(pre_epoch));
    }

    #[test]
    fn test_row_key_is_stable_across_confirmation() {
        let mut id = MessageId::Pending {
            temp_id: "t1".into(),
        };
        let before = row_key(&id);
        id.confirm("m42");
        assert_eq!(row_key(&id), before);
        assert_eq!(
            row_key(&MessageId::Confirmed {
                id: "m42".into(),
                temp_id: None
            }),
            "m:m42"
        );
    }

    #[test]
    fn test_timeline_prefix_does_not_overlap() {
        let short = ConversationId::from_raw("a_b");
        let long = ConversationId::from_raw("a_bc");
        let key = timeline_key(&long, Utc::now(), "m:1");
        assert!(!key.starts_with(&timeline_prefix(&short)));
    }
}
