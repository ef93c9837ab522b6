//! Cluster-wide presence store, backed by the shared Redis KV.
//!
//! Keys (bit-compatible across instances):
//! - `online_users` — set of online identities
//! - `presence:{identity}` — session ref string, TTL as a safety net so a
//!   crashed instance cannot leave stale entries forever
//!
//! Set membership and the record are written and deleted together in one
//! MULTI pipeline, keeping `identity ∈ online_users ⇔ record exists`.
//! The view is eventually consistent; the dispatcher tolerates stale hits
//! by falling back to the queue when an emit finds no session.

use redis::aio::ConnectionManager;
use tracing::warn;

use super::error::RelayError;
use super::session::SessionRef;

/// Set of currently-online identities.
const ONLINE_SET: &str = "online_users";

fn presence_key(identity: &str) -> String {
    format!("presence:{identity}")
}

/// Shared presence view. Cheap to clone — the connection manager multiplexes.
#[derive(Clone)]
pub struct PresenceStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl PresenceStore {
    pub fn new(conn: ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }

    /// Mark an identity online at `session_ref`, atomically with the set.
    /// A later register overwrites the record — last registration wins.
    pub async fn set_online(
        &self,
        identity: &str,
        session_ref: &SessionRef,
    ) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(ONLINE_SET, identity)
            .ignore()
            .set_ex(presence_key(identity), session_ref.to_string(), self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove the identity from the online view. Idempotent.
    pub async fn set_offline(&self, identity: &str) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .srem(ONLINE_SET, identity)
            .ignore()
            .del(presence_key(identity))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn is_online(&self, identity: &str) -> Result<bool, RelayError> {
        let mut conn = self.conn.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(ONLINE_SET)
            .arg(identity)
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    /// Where the identity currently is, if anywhere.
    ///
    /// An unparseable stored ref is treated as offline (and logged) rather
    /// than failing the caller — the TTL will collect it.
    pub async fn lookup(&self, identity: &str) -> Result<Option<SessionRef>, RelayError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(presence_key(identity))
            .query_async(&mut conn)
            .await?;
        match value {
            Some(raw) => match raw.parse::<SessionRef>() {
                Ok(r) => Ok(Some(r)),
                Err(e) => {
                    warn!(identity, error = %e, "presence: discarding malformed record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_key_layout_is_stable() {
        // Other instances (and the original deployment) read these keys.
        assert_eq!(presence_key("u1"), "presence:u1");
        assert_eq!(ONLINE_SET, "online_users");
    }
}
