//! Boot-time configuration from the environment.
//!
//! Everything tunable is read once at startup into a [`RelayConfig`] that is
//! shared across all components via `Arc`. No component reads the environment
//! after boot.

use std::time::Duration;

use tracing::info;

/// Default listen port for the HTTP + WebSocket surface.
const DEFAULT_PORT: u16 = 3000;

/// Relay server configuration.
///
/// Built from the environment by [`RelayConfig::from_env`]; every field has
/// a sane default so a bare `skerry-server` starts against a local Redis.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen port (`PORT`).
    pub port: u16,
    /// Redis connection URL — presence, queue, invites, pub/sub.
    pub redis_url: String,
    /// PostgreSQL DSN for the external account store (`DATABASE_URL`).
    /// Absent means account-backed operations report the store unavailable.
    pub database_url: Option<String>,
    /// Stable name of this relay instance, used to prefix session refs.
    pub instance_id: String,
    /// Largest accepted relay payload in bytes (`MAX_PAYLOAD_SIZE`).
    pub max_payload_size: usize,
    /// Transport frame cap in bytes — hard upper bound per WebSocket message.
    pub frame_cap: usize,
    /// Per-item lifetime of queued envelopes (`QUEUE_TTL`).
    pub queue_ttl: Duration,
    /// Per-identity queue capacity (`MAX_QUEUE_LEN`).
    pub max_queue_len: usize,
    /// Lifetime of device-pairing codes (`SYNC_CODE_TTL`).
    pub sync_code_ttl: Duration,
    /// Lifetime of resolvable invite codes (`INVITE_TTL`).
    pub invite_ttl: Duration,
    /// Rate bucket capacity per session (`MAX_TOKENS`).
    pub max_tokens: f64,
    /// Rate bucket refill in tokens per second (`REFILL_RATE`).
    pub refill_rate: f64,
    /// Safety TTL on presence records so a crashed instance cannot leave
    /// stale entries forever (`PRESENCE_TTL`).
    pub presence_ttl: Duration,
    /// Connect timeout for the backing stores.
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            redis_url: "redis://127.0.0.1:6379".into(),
            database_url: None,
            instance_id: default_instance_id(),
            max_payload_size: 5 * 1024 * 1024,
            frame_cap: 10 * 1024 * 1024,
            queue_ttl: Duration::from_secs(1800),
            max_queue_len: 100,
            sync_code_ttl: Duration::from_secs(300),
            invite_ttl: Duration::from_secs(86_400),
            max_tokens: 100.0,
            refill_rate: 10.0,
            presence_ttl: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Build configuration from the environment.
    ///
    /// `REDIS_URL` wins over the `REDIS_HOST`/`REDIS_PORT`/`REDIS_PASSWORD`
    /// triple; the triple exists for deployments that inject discrete vars.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("PORT") {
            config.port = port;
        }

        config.redis_url = match std::env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => redis_url_from_parts(),
        };

        if let Ok(dsn) = std::env::var("DATABASE_URL") {
            let dsn = dsn.trim().to_string();
            if !dsn.is_empty() {
                config.database_url = Some(dsn);
            }
        }

        if let Ok(id) = std::env::var("INSTANCE_ID") {
            let id = id.trim().to_string();
            if !id.is_empty() {
                config.instance_id = id;
            }
        }

        if let Some(v) = env_parse::<usize>("MAX_PAYLOAD_SIZE") {
            config.max_payload_size = v;
        }
        if let Some(v) = env_parse::<usize>("FRAME_CAP") {
            config.frame_cap = v;
        }
        if let Some(v) = env_parse::<u64>("QUEUE_TTL") {
            config.queue_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("MAX_QUEUE_LEN") {
            config.max_queue_len = v;
        }
        if let Some(v) = env_parse::<u64>("SYNC_CODE_TTL") {
            config.sync_code_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("INVITE_TTL") {
            config.invite_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<f64>("MAX_TOKENS") {
            config.max_tokens = v;
        }
        if let Some(v) = env_parse::<f64>("REFILL_RATE") {
            config.refill_rate = v;
        }
        if let Some(v) = env_parse::<u64>("PRESENCE_TTL") {
            config.presence_ttl = Duration::from_secs(v);
        }

        info!(
            port = config.port,
            instance_id = %config.instance_id,
            database = config.database_url.is_some(),
            "relay configuration loaded"
        );

        config
    }
}

/// Parse an env var, ignoring unset or malformed values.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Assemble a redis URL from `REDIS_HOST`/`REDIS_PORT`/`REDIS_PASSWORD`.
fn redis_url_from_parts() -> String {
    let host = std::env::var("REDIS_HOST")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "127.0.0.1".into());
    let port = std::env::var("REDIS_PORT")
        .ok()
        .and_then(|p| p.trim().parse::<u16>().ok())
        .unwrap_or(6379);
    match std::env::var("REDIS_PASSWORD") {
        Ok(pw) if !pw.is_empty() => format!("redis://:{pw}@{host}:{port}"),
        _ => format!("redis://{host}:{port}"),
    }
}

/// Instance identity when `INSTANCE_ID` is not set: `{hostname}-{short uuid}`.
///
/// The uuid suffix keeps two unnamed instances on one host distinguishable —
/// session refs are prefixed by this id, so collisions would cross-deliver.
fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "skerry".into());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_boot_constants() {
        let c = RelayConfig::default();
        assert_eq!(c.port, 3000);
        assert_eq!(c.max_payload_size, 5 * 1024 * 1024);
        assert_eq!(c.frame_cap, 10 * 1024 * 1024);
        assert_eq!(c.queue_ttl, Duration::from_secs(1800));
        assert_eq!(c.max_queue_len, 100);
        assert_eq!(c.sync_code_ttl, Duration::from_secs(300));
        assert_eq!(c.invite_ttl, Duration::from_secs(86_400));
        assert_eq!(c.max_tokens, 100.0);
        assert_eq!(c.refill_rate, 10.0);
        assert_eq!(c.presence_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn instance_id_is_host_qualified() {
        let id = default_instance_id();
        assert!(id.contains('-'));
        assert!(id.len() > 8);
    }

    #[test]
    fn two_default_instance_ids_differ() {
        assert_ne!(default_instance_id(), default_instance_id());
    }
}
