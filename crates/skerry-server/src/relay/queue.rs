//! Per-identity bounded offline queue in the shared Redis KV.
//!
//! Key `queue:{identity}` holds a FIFO list of JSON-encoded
//! [`QueuedItem`]s. Capacity is enforced inside Redis by a small Lua
//! script so two instances pushing concurrently cannot overshoot the
//! bound: overflow rejects the NEWEST item (`dropped`) — old items are
//! never overwritten silently. Each push refreshes the list TTL.
//!
//! Item expiry is per-item and checked at flush time: the list may outlive
//! an individual envelope, so flush filters on `expires_at` before
//! handing envelopes to the transport.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::error::RelayError;
use super::event::Envelope;

/// Bounded push: reject when full, otherwise append and refresh the TTL.
const PUSH_SCRIPT: &str = r#"
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[1]) then
  return 0
end
redis.call('RPUSH', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

fn queue_key(identity: &str) -> String {
    format!("queue:{identity}")
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
}

/// One stored envelope with its expiry instant. The envelope is flattened
/// so the list entry reads as an envelope with an `expires_at` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub expires_at: DateTime<Utc>,
}

/// Shared per-identity offline queue.
#[derive(Clone)]
pub struct MessageQueue {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
    max_len: usize,
    ttl: Duration,
}

impl MessageQueue {
    pub fn new(conn: ConnectionManager, max_len: usize, ttl: Duration) -> Self {
        Self {
            conn,
            script: Arc::new(redis::Script::new(PUSH_SCRIPT)),
            max_len,
            ttl,
        }
    }

    /// Append an envelope for an offline identity.
    ///
    /// Returns [`PushOutcome::Dropped`] when the queue is at capacity —
    /// the only case in which the relay sheds a message.
    pub async fn push(
        &self,
        identity: &str,
        envelope: Envelope,
    ) -> Result<PushOutcome, RelayError> {
        let item = QueuedItem {
            expires_at: Utc::now()
                + ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::zero()),
            envelope,
        };
        let json = serde_json::to_string(&item)?;

        let mut conn = self.conn.clone();
        let accepted: i64 = self
            .script
            .key(queue_key(identity))
            .arg(self.max_len)
            .arg(json)
            .arg(self.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(if accepted == 1 {
            PushOutcome::Queued
        } else {
            PushOutcome::Dropped
        })
    }

    /// Atomically read and delete the identity's queue, returning the
    /// surviving envelopes in enqueue order. Expired items are discarded
    /// here, at read time.
    pub async fn flush(&self, identity: &str) -> Result<Vec<Envelope>, RelayError> {
        let mut conn = self.conn.clone();
        let (raw, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(queue_key(identity), 0, -1)
            .del(queue_key(identity))
            .query_async(&mut conn)
            .await?;

        let mut items = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<QueuedItem>(&entry) {
                Ok(item) => items.push(item),
                Err(e) => {
                    // A corrupt entry loses itself, not the whole flush.
                    warn!(identity, error = %e, "queue: discarding unreadable item");
                }
            }
        }
        Ok(surviving(items, Utc::now()))
    }
}

/// Drop expired items, keeping enqueue order for the rest.
fn surviving(items: Vec<QueuedItem>, now: DateTime<Utc>) -> Vec<Envelope> {
    items
        .into_iter()
        .filter(|item| item.expires_at > now)
        .map(|item| item.envelope)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::event::{EnvelopeKind, Payload};

    fn envelope(msg_id: &str, payload: Payload) -> Envelope {
        Envelope {
            msg_id: msg_id.into(),
            from: "u1".into(),
            to: "u2".into(),
            payload,
            timestamp: Utc::now(),
            kind: EnvelopeKind::Direct,
        }
    }

    fn item(msg_id: &str, expires_at: DateTime<Utc>) -> QueuedItem {
        QueuedItem {
            envelope: envelope(msg_id, Payload::Text("x".into())),
            expires_at,
        }
    }

    #[test]
    fn queue_key_layout_is_stable() {
        assert_eq!(queue_key("u2"), "queue:u2");
    }

    #[test]
    fn surviving_keeps_enqueue_order() {
        let now = Utc::now();
        let later = now + ChronoDuration::minutes(5);
        let items = vec![item("a", later), item("b", later), item("c", later)];
        let out = surviving(items, now);
        let ids: Vec<&str> = out.iter().map(|e| e.msg_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn surviving_discards_expired_items() {
        let now = Utc::now();
        let expired = now - ChronoDuration::seconds(1);
        let fresh = now + ChronoDuration::minutes(5);
        let items = vec![item("old", expired), item("new", fresh)];
        let out = surviving(items, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_id, "new");
    }

    #[test]
    fn item_expiring_exactly_now_is_gone() {
        let now = Utc::now();
        let out = surviving(vec![item("edge", now)], now);
        assert!(out.is_empty());
    }

    #[test]
    fn queued_item_round_trips_binary_payloads() {
        let stored = QueuedItem {
            envelope: envelope("m1", Payload::binary(vec![0, 159, 146, 150])),
            expires_at: Utc::now() + ChronoDuration::minutes(30),
        };
        let json = serde_json::to_string(&stored).unwrap();
        let back: QueuedItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.envelope.payload, stored.envelope.payload);
        assert_eq!(back.envelope.msg_id, "m1");
    }

    #[test]
    fn duplicate_msg_ids_are_stored_independently() {
        let now = Utc::now();
        let later = now + ChronoDuration::minutes(5);
        let items = vec![item("dup", later), item("dup", later)];
        assert_eq!(surviving(items, now).len(), 2);
    }

    #[test]
    fn push_script_shape() {
        // The script must gate on LLEN before pushing and always refresh TTL.
        assert!(PUSH_SCRIPT.contains("LLEN"));
        assert!(PUSH_SCRIPT.contains("RPUSH"));
        assert!(PUSH_SCRIPT.contains("EXPIRE"));
    }
}
