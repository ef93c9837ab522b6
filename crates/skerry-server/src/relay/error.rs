//! Error taxonomy surfaced to clients as `error_msg {kind, message}`.
//!
//! Every fallible handler returns [`RelayError`]; the transport layer maps
//! it to a wire event at the per-event boundary. Backing-store failures
//! collapse into `kv_unavailable` — transient, the client may retry.

use serde::{Deserialize, Serialize};

/// Machine-readable error kind carried on the wire next to the human text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    InvalidArgument,
    TooLarge,
    RateLimited,
    UsernameTaken,
    InvalidOrExpired,
    KvUnavailable,
}

/// Relay-core error. The `kind()` projection is what goes on the wire.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no identity bound to this session")]
    Unauthenticated,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("username is already registered")]
    UsernameTaken,

    #[error("unknown or expired invite code")]
    InvalidOrExpired,

    #[error("account store is not configured")]
    AccountStoreUnavailable,

    #[error("backing store connect timed out")]
    StoreTimeout,

    #[error("backing store failure: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("account store failure: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl RelayError {
    /// Wire kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::TooLarge { .. } => ErrorKind::TooLarge,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::UsernameTaken => ErrorKind::UsernameTaken,
            Self::InvalidOrExpired => ErrorKind::InvalidOrExpired,
            Self::AccountStoreUnavailable => ErrorKind::KvUnavailable,
            Self::StoreTimeout => ErrorKind::KvUnavailable,
            Self::Kv(_) | Self::Db(_) => ErrorKind::KvUnavailable,
            // A malformed stored value is the store's fault, not the caller's.
            Self::Encoding(_) => ErrorKind::KvUnavailable,
        }
    }
}
