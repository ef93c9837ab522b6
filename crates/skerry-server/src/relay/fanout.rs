//! Cross-instance fan-out over Redis pub/sub.
//!
//! One broadcast channel per target identity, `deliver.{identity}`. Every
//! instance runs a single wildcard subscriber (`PSUBSCRIBE deliver.*`) and
//! filters locally:
//!
//! - `deliver` names the instance the presence lookup pointed at; only that
//!   instance handles it, and it must push to the queue when it finds no
//!   local session — closing the lookup-then-emit race without N instances
//!   re-queueing the same envelope.
//! - `echo` carries the originating session ref; the origin's own instance
//!   skips it (it already delivered locally), every other instance hands it
//!   to its local sessions of the identity. Never queued.
//! - `ack` is delivered best-effort to local sessions. Never queued.
//!
//! Delivery is at-least-once; duplicates across instances are possible and
//! are the client's concern (dedup by `msg_id`).

use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatch;
use super::error::RelayError;
use super::event::Envelope;
use super::metrics;
use super::server::AppState;
use super::session::SessionRef;

/// Wildcard the per-instance subscriber listens on.
pub const CHANNEL_PATTERN: &str = "deliver.*";

/// Delay before the subscriber re-dials a lost pub/sub connection.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub fn channel_for(identity: &str) -> String {
    format!("deliver.{identity}")
}

pub fn identity_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("deliver.").filter(|id| !id.is_empty())
}

/// One message on the fan-out bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutMessage {
    /// A direct envelope for the identity, addressed to one instance.
    Deliver {
        target_instance: String,
        envelope: Envelope,
    },
    /// A device-group echo of a sent message.
    Echo {
        origin: SessionRef,
        envelope: Envelope,
    },
    /// A delivery ACK for the identity.
    Ack { from: String, msg_id: String },
}

/// Publisher half of the bus.
#[derive(Clone)]
pub struct Fanout {
    conn: ConnectionManager,
}

impl Fanout {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Publish onto the identity's channel.
    pub async fn publish(&self, identity: &str, msg: &FanoutMessage) -> Result<(), RelayError> {
        let json = serde_json::to_string(msg)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel_for(identity))
            .arg(json)
            .query_async(&mut conn)
            .await?;
        metrics::fanout_published();
        Ok(())
    }
}

/// Spawn the per-instance subscriber. Runs until shutdown, re-dialing the
/// pub/sub connection forever with a short delay on any failure.
pub fn spawn_subscriber(client: redis::Client, state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listen(&client, &state).await {
                Ok(()) => info!("fanout: pub/sub stream ended, resubscribing"),
                Err(e) => warn!(error = %e, "fanout: subscriber error, resubscribing"),
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}

/// One subscription lifetime: connect, psubscribe, drain messages.
async fn listen(client: &redis::Client, state: &AppState) -> Result<(), RelayError> {
    let mut pubsub = tokio::time::timeout(
        state.config.connect_timeout,
        client.get_async_pubsub(),
    )
    .await
    .map_err(|_| RelayError::StoreTimeout)??;
    pubsub.psubscribe(CHANNEL_PATTERN).await?;
    info!(pattern = CHANNEL_PATTERN, "fanout: subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let Some(identity) = identity_from_channel(&channel) else {
            continue;
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(channel, error = %e, "fanout: unreadable message");
                continue;
            }
        };
        metrics::fanout_received();
        match serde_json::from_str::<FanoutMessage>(&payload) {
            Ok(message) => {
                if let Err(e) = dispatch::handle_fanout(state, identity, message).await {
                    warn!(identity, error = %e, "fanout: handling failed");
                }
            }
            Err(e) => {
                debug!(channel, error = %e, "fanout: skipping malformed message");
            }
        }
    }
    Ok(())
}
