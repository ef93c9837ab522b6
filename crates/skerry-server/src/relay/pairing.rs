//! Invite codes — identity sharing and secondary-device pairing.
//!
//! A code is 6 uppercase hex characters from the OS RNG, stored in the
//! shared KV at `invite:{code}` with a TTL that is the code's only gate:
//! single-use is not required, expiry is. Two kinds share the key space:
//! long-lived `resolvable` codes (share your identity with a contact) and
//! short-lived `pairing` codes (link your own second device).
//!
//! One live code per issuer: `invite_owner:{identity}` tracks the current
//! code so issuing a new one deletes the old entry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::RelayError;
use super::event::InviteKind;

fn invite_key(code: &str) -> String {
    format!("invite:{code}")
}

fn owner_key(identity: &str) -> String {
    format!("invite_owner:{identity}")
}

/// Generate a 6-character uppercase hex code from the OS RNG.
fn generate_code() -> String {
    let mut bytes = [0u8; 3];
    OsRng.fill_bytes(&mut bytes);
    format!("{:02X}{:02X}{:02X}", bytes[0], bytes[1], bytes[2])
}

/// The stored invite entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub identity: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub kind: InviteKind,
    pub issued_at: DateTime<Utc>,
}

/// KV-backed invite store.
#[derive(Clone)]
pub struct InviteStore {
    conn: ConnectionManager,
    resolvable_ttl: Duration,
    pairing_ttl: Duration,
}

impl InviteStore {
    pub fn new(conn: ConnectionManager, resolvable_ttl: Duration, pairing_ttl: Duration) -> Self {
        Self {
            conn,
            resolvable_ttl,
            pairing_ttl,
        }
    }

    fn ttl_for(&self, kind: InviteKind) -> Duration {
        match kind {
            InviteKind::Resolvable => self.resolvable_ttl,
            InviteKind::Pairing => self.pairing_ttl,
        }
    }

    /// Issue a code for `identity`, replacing any code it issued before.
    /// Returns the code and its expiry instant.
    pub async fn create(
        &self,
        identity: &str,
        username: Option<String>,
        kind: InviteKind,
    ) -> Result<(String, DateTime<Utc>), RelayError> {
        let mut conn = self.conn.clone();

        // Replace the issuer's previous code, if any.
        let previous: Option<String> = redis::cmd("GET")
            .arg(owner_key(identity))
            .query_async(&mut conn)
            .await?;
        if let Some(old_code) = previous {
            let _: () = redis::cmd("DEL")
                .arg(invite_key(&old_code))
                .query_async(&mut conn)
                .await?;
        }

        let code = generate_code();
        let ttl = self.ttl_for(kind);
        let record = InviteRecord {
            identity: identity.to_string(),
            username,
            kind,
            issued_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;

        let _: () = redis::pipe()
            .atomic()
            .set_ex(invite_key(&code), json, ttl.as_secs())
            .ignore()
            .set_ex(owner_key(identity), &code, ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;

        let expires_at = record.issued_at
            + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
        Ok((code, expires_at))
    }

    /// Look a code up. `None` means unknown or expired — Redis TTL is the
    /// sole expiry gate, so absence and expiry are indistinguishable.
    pub async fn resolve(&self, code: &str) -> Result<Option<InviteRecord>, RelayError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(invite_key(code))
            .query_async(&mut conn)
            .await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Validate a short-lived pairing code for `link_pc`. Codes of the
    /// wrong kind are rejected the same way as unknown ones.
    pub async fn validate_pairing(&self, code: &str) -> Result<InviteRecord, RelayError> {
        match self.resolve(code).await? {
            Some(record) if record.kind == InviteKind::Pairing => Ok(record),
            _ => Err(RelayError::InvalidOrExpired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_uppercase_hex_chars() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(!code.chars().any(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn codes_vary() {
        let a = generate_code();
        let mut distinct = false;
        // 16^6 codes — a run of 10 equal draws means the RNG is broken.
        for _ in 0..10 {
            if generate_code() != a {
                distinct = true;
                break;
            }
        }
        assert!(distinct);
    }

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(invite_key("A1B2C3"), "invite:A1B2C3");
        assert_eq!(owner_key("u1"), "invite_owner:u1");
    }

    #[test]
    fn record_round_trips() {
        let record = InviteRecord {
            identity: "u1".into(),
            username: Some("wings".into()),
            kind: InviteKind::Resolvable,
            issued_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""identity":"u1""#));
        assert!(json.contains(r#""kind":"resolvable""#));
        let back: InviteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.identity, "u1");
        assert_eq!(back.username.as_deref(), Some("wings"));
        assert_eq!(back.kind, InviteKind::Resolvable);
    }

    #[test]
    fn legacy_record_without_kind_defaults_to_pairing() {
        // Entries written before the kind field existed.
        let json = r#"{"identity":"u1","username":"wings","issued_at":"2026-01-01T00:00:00Z"}"#;
        let back: InviteRecord = serde_json::from_str(json).unwrap();
        assert_eq!(back.kind, InviteKind::Pairing);
    }
}
