//! Protocol conformance tests — wire shapes and in-process semantics that
//! clients depend on, exercised through the crate's public surface.

use chrono::Utc;
use tokio::sync::mpsc;

use skerry_server::relay::event::{
    ClientEvent, DeviceRole, DispatchStatus, Envelope, EnvelopeKind, Payload, ServerEvent,
};
use skerry_server::relay::limiter::RateBucket;
use skerry_server::relay::session::{SessionRegistry, SessionRef};

fn envelope(msg_id: &str, from: &str, to: &str, payload: Payload) -> Envelope {
    Envelope {
        msg_id: msg_id.into(),
        from: from.into(),
        to: to.into(),
        payload,
        timestamp: Utc::now(),
        kind: EnvelopeKind::Direct,
    }
}

// ── Wire shapes the client protocol promises ─────────────────────────

#[test]
fn relay_request_parses_from_client_json() {
    let ev = ClientEvent::from_json(
        r#"{"event":"relay","msg_id":"m1","to":"u2","payload":"hi"}"#,
    )
    .unwrap();
    assert!(matches!(ev, ClientEvent::Relay { .. }));
}

#[test]
fn relay_push_matches_the_documented_shape() {
    let push = ServerEvent::RelayPush {
        envelope: envelope("m1", "u1", "u2", Payload::Text("hi".into())),
    };
    let value: serde_json::Value =
        serde_json::from_str(&push.to_json().unwrap()).unwrap();
    assert_eq!(value["event"], "relay_push");
    assert_eq!(value["from"], "u1");
    assert_eq!(value["to"], "u2");
    assert_eq!(value["msg_id"], "m1");
    assert_eq!(value["payload"], "hi");
    assert_eq!(value["kind"], "direct");
}

#[test]
fn dispatch_status_reports_all_three_outcomes() {
    for (status, text) in [
        (DispatchStatus::Delivered, "delivered"),
        (DispatchStatus::Queued, "queued"),
        (DispatchStatus::Dropped, "dropped"),
    ] {
        let ev = ServerEvent::DispatchStatus {
            to: "u2".into(),
            msg_id: "m1".into(),
            status,
        };
        let value: serde_json::Value =
            serde_json::from_str(&ev.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], text);
    }
}

#[test]
fn registered_event_distinguishes_master_and_slave() {
    for (role, text) in [(DeviceRole::Master, "master"), (DeviceRole::Slave, "slave")] {
        let ev = ServerEvent::Registered {
            role,
            identity: "u1".into(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&ev.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "registered");
        assert_eq!(value["type"], text);
        assert_eq!(value["identity"], "u1");
    }
}

#[test]
fn queue_flush_is_a_batch_of_envelopes_in_order() {
    let ev = ServerEvent::QueueFlush {
        envelopes: vec![
            envelope("m1", "u1", "u2", Payload::Text("a".into())),
            envelope("m2", "u1", "u2", Payload::Text("b".into())),
        ],
    };
    let value: serde_json::Value =
        serde_json::from_str(&ev.to_json().unwrap()).unwrap();
    assert_eq!(value["event"], "queue_flush");
    assert_eq!(value["envelopes"][0]["msg_id"], "m1");
    assert_eq!(value["envelopes"][1]["msg_id"], "m2");
}

#[test]
fn binary_payload_round_trips_through_the_wire_encoding() {
    let original = Payload::binary(vec![0x00, 0xff, 0x10, 0x80]);
    let env = envelope("m1", "u1", "u2", original.clone());
    let json = serde_json::to_string(&env).unwrap();
    let back: Envelope = serde_json::from_str(&json).unwrap();
    assert_eq!(back.payload, original);
}

// ── Device groups and echo routing ───────────────────────────────────

#[test]
fn echo_reaches_other_devices_but_not_the_origin() {
    let registry = SessionRegistry::new("inst-a", 100.0, 10.0);

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let (tx3, mut rx3) = mpsc::unbounded_channel();
    let s1 = registry.connect(tx1);
    let s2 = registry.connect(tx2);
    let s3 = registry.connect(tx3);
    registry.bind(s1, "u1");
    registry.bind(s2, "u1");
    registry.bind(s3, "u2");

    let echo = envelope("m1", "u1", "u2", Payload::Text("hi".into())).as_echo();
    let reached = registry.send_to_identity_except(
        "u1",
        Some(s1),
        &ServerEvent::RelayPush { envelope: echo },
    );

    assert_eq!(reached, 1);
    assert!(rx1.try_recv().is_err(), "origin must not receive its echo");
    match rx2.try_recv().unwrap() {
        ServerEvent::RelayPush { envelope } => {
            assert_eq!(envelope.kind, EnvelopeKind::Echo);
            assert_eq!(envelope.from, "u1");
        }
        other => panic!("expected RelayPush, got {other:?}"),
    }
    assert!(rx3.try_recv().is_err(), "other identities are untouched");
}

#[test]
fn disconnect_empties_the_device_group() {
    let registry = SessionRegistry::new("inst-a", 100.0, 10.0);
    let (tx, _rx) = mpsc::unbounded_channel();
    let s = registry.connect(tx);
    registry.bind(s, "u1");
    assert_eq!(registry.disconnect(s).as_deref(), Some("u1"));
    assert!(registry.sessions_of("u1").is_empty());
}

#[test]
fn session_refs_are_instance_scoped() {
    let a = SessionRegistry::new("inst-a", 100.0, 10.0);
    let b = SessionRegistry::new("inst-b", 100.0, 10.0);
    let (tx1, _rx1) = mpsc::unbounded_channel();
    let (tx2, _rx2) = mpsc::unbounded_channel();
    let sa = a.connect(tx1);
    let sb = b.connect(tx2);

    let ref_a: SessionRef = a.session_ref(sa).to_string().parse().unwrap();
    let ref_b: SessionRef = b.session_ref(sb).to_string().parse().unwrap();
    assert_ne!(ref_a, ref_b);
    assert_eq!(ref_a.instance_id, "inst-a");
    assert_eq!(ref_b.instance_id, "inst-b");
}

// ── Admission control ────────────────────────────────────────────────

#[test]
fn a_burst_beyond_capacity_is_rejected_then_recovers() {
    use std::time::{Duration, Instant};

    let mut bucket = RateBucket::new(100.0, 10.0);
    let start = Instant::now();

    let mut rejected = 0;
    for i in 0..101 {
        // 101 requests inside 100 ms.
        let at = start + Duration::from_micros(i * 990);
        if !bucket.try_admit_at(at) {
            rejected += 1;
        }
    }
    assert!(rejected >= 1, "the burst must hit the limit");

    // After a second of idle the session can speak again.
    assert!(bucket.try_admit_at(start + Duration::from_secs(2)));
}
