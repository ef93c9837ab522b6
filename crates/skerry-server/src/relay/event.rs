//! Wire protocol — tagged JSON events over the WebSocket transport.
//!
//! Each WebSocket text frame carries exactly one event, tagged by an
//! `"event"` field. Payload bytes are opaque to the relay: the [`Payload`]
//! variant a client submits is preserved bit-for-bit through queueing and
//! fan-out. Binary payloads ride inside the JSON frame as base64 (`{"b64":
//! ...}`) — the relay never re-encodes a blob into a JSON string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, RelayError};

/// Base64 (standard alphabet) for binary payload bytes inside JSON.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A binary payload as it appears on the wire: `{"b64": "<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinaryPayload {
    #[serde(rename = "b64", with = "b64")]
    pub bytes: Vec<u8>,
}

/// Opaque client payload.
///
/// Untagged: a JSON string is `Text`, an object shaped `{"b64": ...}` is
/// `Binary`, anything else JSON is `Structured`. Variant order matters —
/// `Binary` must be tried before `Structured` so a blob never degrades
/// into a generic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Binary(BinaryPayload),
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    /// Byte size used for the `too_large` check. For structured values this
    /// is the serialized length — the same bytes that travel the wire.
    pub fn size(&self) -> usize {
        match self {
            Self::Binary(b) => b.bytes.len(),
            Self::Text(s) => s.len(),
            Self::Structured(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0),
        }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self::Binary(BinaryPayload { bytes })
    }
}

/// Whether an envelope is the message itself or its multi-device echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Direct,
    Echo,
}

/// The unit of relay: everything a recipient needs, nothing the server reads.
///
/// `msg_id` is client-chosen and treated as an opaque ACK-correlation tag;
/// no ordering is promised between distinct ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: String,
    pub from: String,
    pub to: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub kind: EnvelopeKind,
}

impl Envelope {
    /// Copy of this envelope re-marked as a device-group echo.
    pub fn as_echo(&self) -> Self {
        Self {
            kind: EnvelopeKind::Echo,
            ..self.clone()
        }
    }
}

/// Device role reported in the `registered` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Master,
    Slave,
}

/// Outcome of a relay request as reported to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Delivered,
    Queued,
    Dropped,
}

/// Presence as reported by `get_presence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Kind of invite code being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteKind {
    /// Long-lived code another user resolves to find this identity.
    Resolvable,
    /// Short-lived code that links a secondary device to this identity.
    #[default]
    Pairing,
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    GetSalt {
        username: String,
    },
    RegisterMaster {
        identity: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        salt: Option<String>,
        #[serde(default)]
        kdf_params: Option<serde_json::Value>,
        #[serde(default)]
        public_key: Option<String>,
    },
    CreateInviteCode {
        #[serde(default)]
        kind: InviteKind,
    },
    ResolveInviteCode {
        code: String,
    },
    LinkPc {
        code: String,
    },
    Relay {
        msg_id: String,
        to: String,
        payload: Payload,
    },
    MsgAck {
        to: String,
        msg_id: String,
    },
    GetPresence {
        identity: String,
    },
    BlockUser {
        identity: String,
    },
    ReportUser {
        identity: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Disconnect,
}

/// Events the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    SaltFound {
        identity: String,
        salt: Option<String>,
        kdf_params: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    SaltNotFound,
    Registered {
        #[serde(rename = "type")]
        role: DeviceRole,
        identity: String,
    },
    QueueFlush {
        envelopes: Vec<Envelope>,
    },
    InviteCodeCreated {
        code: String,
        expires_at: DateTime<Utc>,
    },
    InviteCodeResolved {
        identity: String,
        username: Option<String>,
        salt: Option<String>,
        kdf_params: Option<serde_json::Value>,
    },
    InviteCodeError {
        message: String,
    },
    DispatchStatus {
        to: String,
        msg_id: String,
        status: DispatchStatus,
    },
    RelayPush {
        #[serde(flatten)]
        envelope: Envelope,
    },
    MsgAckPush {
        from: String,
        msg_id: String,
    },
    PresenceUpdate {
        identity: String,
        status: PresenceStatus,
    },
    Blocked,
    Reported,
    ErrorMsg {
        kind: ErrorKind,
        message: String,
    },
}

impl ServerEvent {
    /// The `error_msg` event for a handler failure.
    pub fn error(err: &RelayError) -> Self {
        Self::ErrorMsg {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientEvent {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: Payload) -> Envelope {
        Envelope {
            msg_id: "m1".into(),
            from: "u1".into(),
            to: "u2".into(),
            payload,
            timestamp: Utc::now(),
            kind: EnvelopeKind::Direct,
        }
    }

    // ── Payload variants ─────────────────────────────────────────

    #[test]
    fn text_payload_is_a_bare_string() {
        let p: Payload = serde_json::from_str(r#""hi""#).unwrap();
        assert_eq!(p, Payload::Text("hi".into()));
        assert_eq!(serde_json::to_string(&p).unwrap(), r#""hi""#);
        assert_eq!(p.size(), 2);
    }

    #[test]
    fn binary_payload_rides_as_b64() {
        let p = Payload::binary(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"b64":"3q2+7w=="}"#);
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.size(), 4);
    }

    #[test]
    fn structured_payload_survives_untouched() {
        let json = r#"{"nested":{"k":[1,2,3]},"flag":true}"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        assert!(matches!(p, Payload::Structured(_)));
        let back: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(back, serde_json::from_str::<serde_json::Value>(json).unwrap());
    }

    #[test]
    fn object_with_extra_keys_is_not_binary() {
        // {"b64": ..., "other": ...} must stay structured, not half-decode.
        let p: Payload =
            serde_json::from_str(r#"{"b64":"3q2+7w==","other":1}"#).unwrap();
        assert!(matches!(p, Payload::Structured(_)));
    }

    #[test]
    fn invalid_base64_falls_back_to_structured() {
        let p: Payload = serde_json::from_str(r#"{"b64":"not base64!!"}"#).unwrap();
        assert!(matches!(p, Payload::Structured(_)));
    }

    #[test]
    fn binary_variant_survives_queue_round_trip() {
        // Envelope → JSON (as stored in the queue) → Envelope keeps the blob.
        let env = envelope(Payload::binary((0u8..=255).collect()));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, env.payload);
        match back.payload {
            Payload::Binary(b) => assert_eq!(b.bytes.len(), 256),
            other => panic!("expected Binary, got {other:?}"),
        }
    }

    // ── Envelope ─────────────────────────────────────────────────

    #[test]
    fn echo_copy_changes_only_the_kind() {
        let env = envelope(Payload::Text("hi".into()));
        let echo = env.as_echo();
        assert_eq!(echo.kind, EnvelopeKind::Echo);
        assert_eq!(echo.msg_id, env.msg_id);
        assert_eq!(echo.from, env.from);
        assert_eq!(echo.to, env.to);
        assert_eq!(echo.payload, env.payload);
    }

    #[test]
    fn envelope_kind_serializes_snake_case() {
        let env = envelope(Payload::Text("x".into()));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""kind":"direct""#));
    }

    // ── Client events ────────────────────────────────────────────

    #[test]
    fn relay_event_with_bare_string_payload() {
        let ev = ClientEvent::from_json(
            r#"{"event":"relay","msg_id":"m1","to":"u2","payload":"hi"}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::Relay { msg_id, to, payload } => {
                assert_eq!(msg_id, "m1");
                assert_eq!(to, "u2");
                assert_eq!(payload, Payload::Text("hi".into()));
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn register_master_minimal_fields() {
        let ev = ClientEvent::from_json(
            r#"{"event":"register_master","identity":"u1"}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::RegisterMaster { identity, username, salt, .. } => {
                assert_eq!(identity, "u1");
                assert!(username.is_none());
                assert!(salt.is_none());
            }
            other => panic!("expected RegisterMaster, got {other:?}"),
        }
    }

    #[test]
    fn create_invite_defaults_to_pairing() {
        let ev = ClientEvent::from_json(r#"{"event":"create_invite_code"}"#).unwrap();
        match ev {
            ClientEvent::CreateInviteCode { kind } => assert_eq!(kind, InviteKind::Pairing),
            other => panic!("expected CreateInviteCode, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_fails() {
        assert!(ClientEvent::from_json(r#"{"event":"bogus"}"#).is_err());
    }

    #[test]
    fn missing_event_tag_fails() {
        assert!(ClientEvent::from_json(r#"{"msg_id":"m1"}"#).is_err());
    }

    // ── Server events ────────────────────────────────────────────

    #[test]
    fn registered_uses_type_field_on_the_wire() {
        let ev = ServerEvent::Registered {
            role: DeviceRole::Master,
            identity: "u1".into(),
        };
        let json = ev.to_json().unwrap();
        assert!(json.contains(r#""event":"registered""#));
        assert!(json.contains(r#""type":"master""#));
    }

    #[test]
    fn relay_push_flattens_the_envelope() {
        let ev = ServerEvent::RelayPush {
            envelope: envelope(Payload::Text("hi".into())),
        };
        let json = ev.to_json().unwrap();
        assert!(json.contains(r#""event":"relay_push""#));
        assert!(json.contains(r#""msg_id":"m1""#));
        assert!(json.contains(r#""from":"u1""#));
        assert!(json.contains(r#""payload":"hi""#));
        assert!(!json.contains("envelope"));
    }

    #[test]
    fn dispatch_status_wire_shape() {
        let ev = ServerEvent::DispatchStatus {
            to: "u2".into(),
            msg_id: "m1".into(),
            status: DispatchStatus::Queued,
        };
        let json = ev.to_json().unwrap();
        assert!(json.contains(r#""status":"queued""#));
    }

    #[test]
    fn error_msg_carries_kind_and_message() {
        let ev = ServerEvent::error(&RelayError::RateLimited);
        let json = ev.to_json().unwrap();
        assert!(json.contains(r#""event":"error_msg""#));
        assert!(json.contains(r#""kind":"rate_limited""#));
        assert!(json.contains("rate limit"));
    }
}
