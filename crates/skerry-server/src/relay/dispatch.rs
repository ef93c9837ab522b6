//! Relay dispatcher — routes envelopes to live sessions, the offline
//! queue, or the cross-instance bus, and fans echoes out to the sender's
//! other devices.
//!
//! The lookup-then-emit sequence is not atomic. A presence hit that turns
//! out stale falls back to the queue, and the remote subscriber re-checks
//! and re-queues, so delivery is at-least-once with client-side dedup by
//! `msg_id`. Queue overflow (`dropped`) is the only case where an envelope
//! is shed.

use chrono::Utc;
use tracing::{info, warn};

use super::error::RelayError;
use super::event::{
    DeviceRole, DispatchStatus, Envelope, EnvelopeKind, Payload, ServerEvent,
};
use super::fanout::FanoutMessage;
use super::metrics;
use super::queue::PushOutcome;
use super::server::AppState;
use super::session::{SessionId, SessionRef};

/// Handle a `relay` request from a bound session.
///
/// Returns the status reported back to the sender. Rate limiting happens
/// upstream at event intake; size and authentication are checked here.
pub async fn relay(
    state: &AppState,
    session: SessionId,
    msg_id: String,
    to: String,
    payload: Payload,
) -> Result<DispatchStatus, RelayError> {
    let from = state
        .registry
        .identity_of(session)
        .ok_or(RelayError::Unauthenticated)?;

    if to.is_empty() {
        return Err(RelayError::InvalidArgument("missing recipient".into()));
    }

    let size = payload.size();
    let limit = state.config.max_payload_size;
    if size > limit {
        return Err(RelayError::TooLarge { size, limit });
    }

    let envelope = Envelope {
        msg_id,
        from: from.clone(),
        to: to.clone(),
        payload,
        timestamp: Utc::now(),
        kind: EnvelopeKind::Direct,
    };

    let status = deliver_or_queue(state, &envelope).await?;

    // Echo fan-out to the sender's other devices — best-effort, never
    // queued, never failing the relay itself.
    fan_out_echo(state, session, &from, &envelope).await;

    // Metadata only. Payload bytes are never logged.
    info!(
        sender = %envelope.from,
        recipient = %envelope.to,
        size,
        timestamp = %envelope.timestamp,
        status = ?status,
        "relay dispatched"
    );
    metrics::dispatch_outcome(status);

    Ok(status)
}

/// The local/remote/queue delivery decision for a direct envelope.
async fn deliver_or_queue(
    state: &AppState,
    envelope: &Envelope,
) -> Result<DispatchStatus, RelayError> {
    let to = &envelope.to;

    match state.presence.lookup(to).await? {
        None => push_to_queue(state, to, envelope.clone()).await,
        Some(located) if located.instance_id == state.registry.instance_id() => {
            // Presence points at us: emit if that session is still bound to
            // the recipient, otherwise the record is stale — queue instead.
            let still_bound = state
                .registry
                .identity_of(located.session_id)
                .is_some_and(|id| id == *to);
            let sent = still_bound
                && state.registry.send_to(
                    located.session_id,
                    ServerEvent::RelayPush {
                        envelope: envelope.clone(),
                    },
                );
            if sent {
                Ok(DispatchStatus::Delivered)
            } else {
                push_to_queue(state, to, envelope.clone()).await
            }
        }
        Some(located) => {
            // Remote instance: publish and report delivered optimistically.
            // The subscriber on the other side re-queues on a miss.
            state
                .fanout
                .publish(
                    to,
                    &FanoutMessage::Deliver {
                        target_instance: located.instance_id,
                        envelope: envelope.clone(),
                    },
                )
                .await?;
            Ok(DispatchStatus::Delivered)
        }
    }
}

async fn push_to_queue(
    state: &AppState,
    identity: &str,
    envelope: Envelope,
) -> Result<DispatchStatus, RelayError> {
    match state.queue.push(identity, envelope).await? {
        PushOutcome::Queued => Ok(DispatchStatus::Queued),
        PushOutcome::Dropped => Ok(DispatchStatus::Dropped),
    }
}

/// Deliver an echo copy to the sender's other live sessions, local and
/// remote. The originating session never receives its own echo.
async fn fan_out_echo(state: &AppState, origin: SessionId, sender: &str, envelope: &Envelope) {
    let echo = envelope.as_echo();

    state.registry.send_to_identity_except(
        sender,
        Some(origin),
        &ServerEvent::RelayPush {
            envelope: echo.clone(),
        },
    );

    // Other instances may hold more of the sender's devices. Our own
    // subscriber recognizes the origin instance and skips the message.
    let msg = FanoutMessage::Echo {
        origin: state.registry.session_ref(origin),
        envelope: echo,
    };
    if let Err(e) = state.fanout.publish(sender, &msg).await {
        warn!(sender, error = %e, "echo fan-out publish failed");
    }
}

/// Handle `msg_ack`: notify the original sender that `msg_id` arrived.
/// Best-effort — never queued, absence of the recipient is not an error.
pub async fn ack(
    state: &AppState,
    session: SessionId,
    to: String,
    msg_id: String,
) -> Result<(), RelayError> {
    let from = state
        .registry
        .identity_of(session)
        .ok_or(RelayError::Unauthenticated)?;

    if to.is_empty() {
        return Err(RelayError::InvalidArgument("missing recipient".into()));
    }

    match state.presence.lookup(&to).await? {
        None => {}
        Some(located) if located.instance_id == state.registry.instance_id() => {
            state.registry.send_to(
                located.session_id,
                ServerEvent::MsgAckPush {
                    from: from.clone(),
                    msg_id: msg_id.clone(),
                },
            );
        }
        Some(_) => {
            state
                .fanout
                .publish(&to, &FanoutMessage::Ack { from, msg_id })
                .await?;
        }
    }
    Ok(())
}

/// Complete a registration (master or paired secondary): bind the session,
/// publish presence, confirm, then hand over anything queued while the
/// identity was away.
pub async fn complete_registration(
    state: &AppState,
    session: SessionId,
    identity: &str,
    role: DeviceRole,
) -> Result<(), RelayError> {
    if identity.is_empty() {
        return Err(RelayError::InvalidArgument("missing identity".into()));
    }
    if !state.registry.bind(session, identity) {
        // The transport dropped while we were registering; nothing to do.
        return Ok(());
    }

    let session_ref = state.registry.session_ref(session);
    if let Err(e) = state.presence.set_online(identity, &session_ref).await {
        // Keep the registry consistent with the cluster view.
        state.registry.unbind(session);
        return Err(e);
    }

    state.registry.send_to(
        session,
        ServerEvent::Registered {
            role,
            identity: identity.to_string(),
        },
    );
    metrics::refresh_session_gauges(&state.registry);

    // Flush to the newly-registered session only. A flush failure degrades
    // to queued-items-wait — the TTL still bounds their lifetime.
    match state.queue.flush(identity).await {
        Ok(envelopes) if !envelopes.is_empty() => {
            metrics::queue_flushed(envelopes.len());
            state
                .registry
                .send_to(session, ServerEvent::QueueFlush { envelopes });
        }
        Ok(_) => {}
        Err(e) => warn!(identity, error = %e, "queue flush on register failed"),
    }

    info!(identity, session = %session, role = ?role, "session registered");
    Ok(())
}

/// Tear a session down: unbind it and repair the cluster presence view.
///
/// When the presence record points at the departing session, it is either
/// re-pointed at another local session of the same identity or deleted.
/// Records owned by other sessions (or instances) are left alone.
pub async fn handle_disconnect(state: &AppState, session: SessionId) {
    let Some(identity) = state.registry.disconnect(session) else {
        metrics::refresh_session_gauges(&state.registry);
        return;
    };
    metrics::refresh_session_gauges(&state.registry);

    let our_ref = SessionRef {
        instance_id: state.registry.instance_id().to_string(),
        session_id: session,
    };

    match state.presence.lookup(&identity).await {
        Ok(Some(current)) if current == our_ref => {
            let remaining = state.registry.sessions_of(&identity);
            let result = match remaining.last() {
                Some(&next) => {
                    let next_ref = state.registry.session_ref(next);
                    state.presence.set_online(&identity, &next_ref).await
                }
                None => state.presence.set_offline(&identity).await,
            };
            if let Err(e) = result {
                warn!(identity, error = %e, "presence cleanup failed; TTL will collect");
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(identity, error = %e, "presence lookup on disconnect failed");
        }
    }

    info!(identity, session = %session, "session closed");
}

/// Handle one message from the cross-instance bus for `identity`.
pub async fn handle_fanout(
    state: &AppState,
    identity: &str,
    message: FanoutMessage,
) -> Result<(), RelayError> {
    match message {
        FanoutMessage::Deliver {
            target_instance,
            envelope,
        } => {
            if target_instance != state.registry.instance_id() {
                return Ok(());
            }
            // Most recent local session of the identity, if any. On a miss
            // the envelope MUST go to the queue — this closes the race
            // between the publisher's lookup and the recipient's departure.
            let sessions = state.registry.sessions_of(identity);
            let delivered = sessions.last().copied().is_some_and(|sid| {
                state.registry.send_to(
                    sid,
                    ServerEvent::RelayPush {
                        envelope: envelope.clone(),
                    },
                )
            });
            if !delivered {
                let outcome = state.queue.push(identity, envelope).await?;
                if outcome == PushOutcome::Dropped {
                    warn!(identity, "fanout re-queue dropped on overflow");
                    metrics::dispatch_outcome(DispatchStatus::Dropped);
                }
            }
            Ok(())
        }
        FanoutMessage::Echo { origin, envelope } => {
            // The origin instance already delivered to its local sessions.
            if origin.instance_id == state.registry.instance_id() {
                return Ok(());
            }
            state.registry.send_to_identity_except(
                identity,
                None,
                &ServerEvent::RelayPush { envelope },
            );
            Ok(())
        }
        FanoutMessage::Ack { from, msg_id } => {
            state.registry.send_to_identity_except(
                identity,
                None,
                &ServerEvent::MsgAckPush { from, msg_id },
            );
            Ok(())
        }
    }
}
