//! HTTP + WebSocket front end and the per-session event loop.
//!
//! One axum server carries the whole surface: `GET /ping` for health,
//! `GET /metrics` for Prometheus, `GET /ws` for the persistent client
//! channel. Each WebSocket text frame is one JSON event; responses and
//! pushes from other tasks funnel through the session's mpsc channel so
//! the socket has a single writer and per-session ordering is preserved.
//!
//! Every fallible handler is caught at the event boundary and answered
//! with `error_msg {kind, message}` — a handler failure never takes the
//! process down, and a transport fault tears down only its own session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::accounts::{AccountRecord, AccountStore};
use super::config::RelayConfig;
use super::dispatch;
use super::error::RelayError;
use super::event::{ClientEvent, DeviceRole, PresenceStatus, ServerEvent};
use super::fanout::{self, Fanout};
use super::metrics;
use super::pairing::InviteStore;
use super::presence::PresenceStore;
use super::queue::MessageQueue;
use super::session::{SessionId, SessionRegistry};

/// Process-wide shared state, injected at boot. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: SessionRegistry,
    pub presence: PresenceStore,
    pub queue: MessageQueue,
    pub invites: InviteStore,
    pub fanout: Fanout,
    pub accounts: Option<Arc<AccountStore>>,
    metrics_handle: Option<PrometheusHandle>,
}

/// Connect the backing stores, assemble the state, and serve until killed.
pub async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = tokio::time::timeout(
        config.connect_timeout,
        ConnectionManager::new(client.clone()),
    )
    .await
    .map_err(|_| RelayError::StoreTimeout)??;
    info!("KV store connected");

    let accounts = match &config.database_url {
        Some(dsn) => {
            let store = AccountStore::connect(dsn).await?;
            store.migrate().await?;
            info!("account store ready");
            Some(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set — account-backed operations disabled");
            None
        }
    };

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let registry = SessionRegistry::new(
        &config.instance_id,
        config.max_tokens,
        config.refill_rate,
    );
    let state = AppState {
        presence: PresenceStore::new(conn.clone(), config.presence_ttl.as_secs()),
        queue: MessageQueue::new(conn.clone(), config.max_queue_len, config.queue_ttl),
        invites: InviteStore::new(conn.clone(), config.invite_ttl, config.sync_code_ttl),
        fanout: Fanout::new(conn),
        registry,
        accounts,
        metrics_handle,
        config: Arc::clone(&config),
    };

    fanout::spawn_subscriber(client, state.clone());

    let app = Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(metrics_endpoint))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(instance_id = %config.instance_id, "listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|h| h.render())
        .unwrap_or_default()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let cap = state.config.frame_cap;
    ws.max_message_size(cap)
        .max_frame_size(cap)
        .on_upgrade(move |socket| handle_session(socket, state))
}

/// One connected client: read frames, run handlers sequentially, write
/// everything that lands on the session channel.
async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = state.registry.connect(tx);
    metrics::refresh_session_gauges(&state.registry);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(&state, session, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // Binary payloads ride inside JSON frames as base64;
                        // a bare binary frame has no event envelope.
                        debug!(session = %session, "ignoring bare binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong — answered by the stack
                    Some(Err(e)) => {
                        debug!(session = %session, error = %e, "transport error");
                        break;
                    }
                }
            }

            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(session = %session, error = %e, "unencodable event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    dispatch::handle_disconnect(&state, session).await;
}

/// Rate-limit, parse and run one inbound frame. Returns false when the
/// session asked to disconnect.
async fn handle_frame(state: &AppState, session: SessionId, text: &str) -> bool {
    if !state.registry.admit(session) {
        metrics::rejected("rate_limited");
        state
            .registry
            .send_to(session, ServerEvent::error(&RelayError::RateLimited));
        return true;
    }

    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            metrics::rejected("invalid_argument");
            let err = RelayError::InvalidArgument(e.to_string());
            state.registry.send_to(session, ServerEvent::error(&err));
            return true;
        }
    };

    if matches!(event, ClientEvent::Disconnect) {
        return false;
    }

    if let Err(err) = handle_event(state, session, event).await {
        debug!(session = %session, error = %err, "event handler failed");
        state.registry.send_to(session, ServerEvent::error(&err));
    }
    true
}

/// Dispatch table for client events. Responses go through the session
/// channel, keeping the socket writer single and ordered.
async fn handle_event(
    state: &AppState,
    session: SessionId,
    event: ClientEvent,
) -> Result<(), RelayError> {
    match event {
        ClientEvent::GetSalt { username } => {
            let accounts = state
                .accounts
                .as_deref()
                .ok_or(RelayError::AccountStoreUnavailable)?;
            let reply = match accounts.load_by_username(&username).await? {
                Some(rec) => ServerEvent::SaltFound {
                    identity: rec.identity,
                    salt: rec.salt,
                    kdf_params: rec.kdf_params,
                    public_key: rec.public_key,
                },
                None => ServerEvent::SaltNotFound,
            };
            state.registry.send_to(session, reply);
            Ok(())
        }

        ClientEvent::RegisterMaster {
            identity,
            username,
            salt,
            kdf_params,
            public_key,
        } => {
            if identity.is_empty() {
                return Err(RelayError::InvalidArgument("missing identity".into()));
            }
            if let Some(username) = username {
                let accounts = state
                    .accounts
                    .as_deref()
                    .ok_or(RelayError::AccountStoreUnavailable)?;
                accounts
                    .upsert_registration(&AccountRecord {
                        identity: identity.clone(),
                        username: Some(username),
                        salt,
                        kdf_params,
                        public_key,
                    })
                    .await?;
            }
            dispatch::complete_registration(state, session, &identity, DeviceRole::Master)
                .await
        }

        ClientEvent::CreateInviteCode { kind } => {
            let identity = state
                .registry
                .identity_of(session)
                .ok_or(RelayError::Unauthenticated)?;
            let username = match state.accounts.as_deref() {
                Some(accounts) => accounts
                    .load_by_identity(&identity)
                    .await?
                    .and_then(|rec| rec.username),
                None => None,
            };
            let (code, expires_at) = state.invites.create(&identity, username, kind).await?;
            state
                .registry
                .send_to(session, ServerEvent::InviteCodeCreated { code, expires_at });
            Ok(())
        }

        ClientEvent::ResolveInviteCode { code } => {
            let reply = match state.invites.resolve(&code).await? {
                Some(invite) => {
                    let account = match state.accounts.as_deref() {
                        Some(accounts) => accounts.load_by_identity(&invite.identity).await?,
                        None => None,
                    };
                    ServerEvent::InviteCodeResolved {
                        identity: invite.identity,
                        username: invite
                            .username
                            .or_else(|| account.as_ref().and_then(|a| a.username.clone())),
                        salt: account.as_ref().and_then(|a| a.salt.clone()),
                        kdf_params: account.and_then(|a| a.kdf_params),
                    }
                }
                None => ServerEvent::InviteCodeError {
                    message: "unknown or expired invite code".into(),
                },
            };
            state.registry.send_to(session, reply);
            Ok(())
        }

        ClientEvent::LinkPc { code } => {
            let invite = state.invites.validate_pairing(&code).await?;
            dispatch::complete_registration(state, session, &invite.identity, DeviceRole::Slave)
                .await
        }

        ClientEvent::Relay { msg_id, to, payload } => {
            let status =
                dispatch::relay(state, session, msg_id.clone(), to.clone(), payload).await?;
            state
                .registry
                .send_to(session, ServerEvent::DispatchStatus { to, msg_id, status });
            Ok(())
        }

        ClientEvent::MsgAck { to, msg_id } => dispatch::ack(state, session, to, msg_id).await,

        ClientEvent::GetPresence { identity } => {
            if identity.is_empty() {
                return Err(RelayError::InvalidArgument("missing identity".into()));
            }
            let status = if state.presence.is_online(&identity).await? {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            };
            state
                .registry
                .send_to(session, ServerEvent::PresenceUpdate { identity, status });
            Ok(())
        }

        ClientEvent::BlockUser { identity } => {
            let from = state
                .registry
                .identity_of(session)
                .ok_or(RelayError::Unauthenticated)?;
            let accounts = state
                .accounts
                .as_deref()
                .ok_or(RelayError::AccountStoreUnavailable)?;
            accounts.record_block(&from, &identity).await?;
            state.registry.send_to(session, ServerEvent::Blocked);
            Ok(())
        }

        ClientEvent::ReportUser { identity, reason } => {
            let from = state
                .registry
                .identity_of(session)
                .ok_or(RelayError::Unauthenticated)?;
            let accounts = state
                .accounts
                .as_deref()
                .ok_or(RelayError::AccountStoreUnavailable)?;
            accounts
                .record_report(&from, &identity, reason.as_deref())
                .await?;
            state.registry.send_to(session, ServerEvent::Reported);
            Ok(())
        }

        // Handled at the frame layer; kept for exhaustiveness.
        ClientEvent::Disconnect => Ok(()),
    }
}
