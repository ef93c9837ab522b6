//! Per-instance session registry.
//!
//! The single source of truth for "which local session corresponds to which
//! identity on this instance". Sessions are created on transport connect,
//! bound to an identity on register, and removed on disconnect — disconnect
//! always unbinds. The registry never crosses instances; cross-instance
//! lookup goes through the presence store and pub/sub fan-out.
//!
//! The lock is a plain `std::sync::RwLock`: every operation is short and
//! non-suspending, and the guard is never held across an await point.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::event::ServerEvent;
use super::limiter::RateBucket;

/// Per-instance session identifier. Globally unique only when prefixed with
/// the instance id — see [`SessionRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-wide session locator: `"{instance_id}/{session_id}"`.
///
/// This is the opaque value stored in the presence record and carried on
/// the fan-out bus. The instance id may itself contain `/`; the session id
/// is always the part after the last separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub instance_id: String,
    pub session_id: SessionId,
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.session_id)
    }
}

/// Error for an unparseable session ref.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed session ref: {0:?}")]
pub struct SessionRefParseError(String);

impl FromStr for SessionRef {
    type Err = SessionRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (instance, id) = s
            .rsplit_once('/')
            .ok_or_else(|| SessionRefParseError(s.into()))?;
        if instance.is_empty() {
            return Err(SessionRefParseError(s.into()));
        }
        let id: u64 = id.parse().map_err(|_| SessionRefParseError(s.into()))?;
        Ok(Self {
            instance_id: instance.to_string(),
            session_id: SessionId(id),
        })
    }
}

impl Serialize for SessionRef {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionRef {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One live session's registry entry.
struct SessionEntry {
    identity: Option<String>,
    tx: mpsc::UnboundedSender<ServerEvent>,
    bucket: RateBucket,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    by_identity: HashMap<String, HashSet<SessionId>>,
}

/// Process-wide session registry, injected at boot.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
    next_id: Arc<AtomicU64>,
    instance_id: Arc<str>,
    max_tokens: f64,
    refill_rate: f64,
}

impl SessionRegistry {
    pub fn new(instance_id: &str, max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            instance_id: instance_id.into(),
            max_tokens,
            refill_rate,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a freshly-connected transport session. The session starts
    /// unbound with a full rate bucket.
    pub fn connect(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.sessions.insert(
            id,
            SessionEntry {
                identity: None,
                tx,
                bucket: RateBucket::new(self.max_tokens, self.refill_rate),
            },
        );
        debug!(session = %id, "session connected");
        id
    }

    /// Remove a session entirely, returning the identity it was bound to.
    /// The rate bucket dies with the entry. Idempotent.
    pub fn disconnect(&self, session: SessionId) -> Option<String> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner.sessions.remove(&session)?;
        if let Some(identity) = &entry.identity {
            if let Some(set) = inner.by_identity.get_mut(identity) {
                set.remove(&session);
                if set.is_empty() {
                    inner.by_identity.remove(identity);
                }
            }
        }
        debug!(session = %session, "session disconnected");
        entry.identity
    }

    /// Bind a session to an identity. Rebinding moves the session out of its
    /// previous identity group. Returns false when the session is gone.
    pub fn bind(&self, session: SessionId, identity: &str) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(entry) = inner.sessions.get_mut(&session) else {
            return false;
        };
        let previous = entry.identity.replace(identity.to_string());
        if let Some(prev) = previous {
            if let Some(set) = inner.by_identity.get_mut(&prev) {
                set.remove(&session);
                if set.is_empty() {
                    inner.by_identity.remove(&prev);
                }
            }
        }
        inner
            .by_identity
            .entry(identity.to_string())
            .or_default()
            .insert(session);
        true
    }

    /// Unbind a session from its identity without dropping the session.
    pub fn unbind(&self, session: SessionId) -> Option<String> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner.sessions.get_mut(&session)?;
        let identity = entry.identity.take()?;
        if let Some(set) = inner.by_identity.get_mut(&identity) {
            set.remove(&session);
            if set.is_empty() {
                inner.by_identity.remove(&identity);
            }
        }
        Some(identity)
    }

    pub fn identity_of(&self, session: SessionId) -> Option<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.sessions.get(&session)?.identity.clone()
    }

    /// All local sessions bound to an identity, in session-id order.
    pub fn sessions_of(&self, identity: &str) -> Vec<SessionId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut ids: Vec<SessionId> = inner
            .by_identity
            .get(identity)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Spend one token from the session's rate bucket.
    pub fn admit(&self, session: SessionId) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        match inner.sessions.get_mut(&session) {
            Some(entry) => entry.bucket.try_admit(),
            None => false,
        }
    }

    /// Queue an event onto the session's outbound channel. Returns false
    /// when the session is gone or its receiver was dropped.
    pub fn send_to(&self, session: SessionId, event: ServerEvent) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        match inner.sessions.get(&session) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an event to every local session of `identity` except `skip`.
    /// Returns the number of sessions reached.
    pub fn send_to_identity_except(
        &self,
        identity: &str,
        skip: Option<SessionId>,
        event: &ServerEvent,
    ) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(set) = inner.by_identity.get(identity) else {
            return 0;
        };
        let mut reached = 0;
        for id in set {
            if Some(*id) == skip {
                continue;
            }
            if let Some(entry) = inner.sessions.get(id) {
                if entry.tx.send(event.clone()).is_ok() {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Cluster-wide locator for a local session.
    pub fn session_ref(&self, session: SessionId) -> SessionRef {
        SessionRef {
            instance_id: self.instance_id.to_string(),
            session_id: session,
        }
    }

    /// Connected session count (bound or not).
    pub fn session_count(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").sessions.len()
    }

    /// Distinct identities with at least one local session.
    pub fn identity_count(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_identity
            .len()
    }
}
