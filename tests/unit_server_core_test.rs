//! Control-loop state transitions driven directly against `ServerCore`:
//! admission, duplicate logins, codec negotiation, the channel-remove
//! cascade, voice routing, and the snapshot threshold.

use bytes::BytesMut;
use std::sync::Arc;
use tempfile::TempDir;
use timbre::config::Config;
use timbre::connection::session::{ClientSession, SessionPhase};
use timbre::core::channel::{Permissions, ROOT_ID};
use timbre::core::crypt::CryptState;
use timbre::core::events::{AuthOutcome, UdpOut, VoiceEnvelope};
use timbre::core::persistence::Freezer;
use timbre::core::protocol::messages::{
    ChannelRemove, RejectReason, UserState, VoiceTarget, VoiceTargetSpec,
};
use timbre::core::protocol::{ControlMessage, VoiceFrame};
use timbre::core::state::{ServerCore, SharedState};
use tokio::sync::mpsc;

struct Harness {
    core: ServerCore,
    udp_rx: mpsc::Receiver<UdpOut>,
}

struct TestClient {
    session: Arc<ClientSession>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl TestClient {
    fn drain(&mut self) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.control_rx.try_recv() {
            out.push(message);
        }
        out
    }
}

fn harness() -> Harness {
    let shared = Arc::new(SharedState::new(Config::default()));
    let (udp_tx, udp_rx) = mpsc::channel(64);
    Harness {
        core: ServerCore::new(1, shared, udp_tx),
        udp_rx,
    }
}

fn client(port: u16, cert_digest: &str) -> TestClient {
    let crypt = CryptState::with_material([port as u8; 16], [1u8; 16], [2u8; 16]);
    let (session, control_rx, _voice_rx) = ClientSession::new(
        format!("127.0.0.1:{port}").parse().unwrap(),
        cert_digest.to_string(),
        crypt,
    );
    session.set_phase(SessionPhase::Authenticated);
    TestClient {
        session,
        control_rx,
    }
}

async fn admit(
    core: &mut ServerCore,
    client: &TestClient,
    username: &str,
    user_id: Option<u32>,
    celt_versions: Vec<i32>,
) {
    core.finish_authenticate(AuthOutcome {
        session: client.session.clone(),
        username: username.to_string(),
        user_id,
        celt_versions,
        opus: true,
    })
    .await
    .unwrap();
}

/// A 20 ms Opus frame with the given target selector.
fn voice_frame(target: u8) -> VoiceFrame {
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&[(4u8 << 5) | target, 0x01, 0xAB, 0xCD]);
    VoiceFrame::parse(raw.freeze()).unwrap()
}

#[tokio::test]
async fn test_single_client_admission_sequence() {
    let mut h = harness();
    let mut a = client(4000, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;

    assert_eq!(a.session.phase(), SessionPhase::Ready);
    assert_eq!(a.session.channel_id(), ROOT_ID);
    let id = a.session.id();
    assert_ne!(id, 0);

    let messages = a.drain();
    // Channel list: exactly the root.
    let channels: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            ControlMessage::ChannelState(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].channel_id, Some(ROOT_ID));

    // No other users, but our own state comes back.
    let states: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            ControlMessage::UserState(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].session, Some(id));
    assert_eq!(states[0].name.as_deref(), Some("alice"));
    assert_eq!(states[0].channel_id, Some(ROOT_ID));

    let sync = messages
        .iter()
        .find_map(|m| match m {
            ControlMessage::ServerSync(s) => Some(s),
            _ => None,
        })
        .expect("ServerSync missing");
    assert_eq!(sync.session, id);
    assert_eq!(sync.max_bandwidth, Config::default().max_bandwidth);
    assert_eq!(
        sync.permissions & Permissions::ENTER.bits(),
        Permissions::ENTER.bits()
    );

    assert!(
        messages
            .iter()
            .any(|m| matches!(m, ControlMessage::ServerConfig(_)))
    );
}

#[tokio::test]
async fn test_duplicate_login_is_rejected_and_older_session_survives() {
    let mut h = harness();
    h.core
        .shared
        .users
        .write()
        .register("bob", "cert-x")
        .unwrap();

    let mut first = client(4001, "cert-x");
    admit(&mut h.core, &first, "bob", Some(1), vec![]).await;
    assert_eq!(first.session.phase(), SessionPhase::Ready);
    first.drain();

    let mut second = client(4002, "cert-x");
    admit(&mut h.core, &second, "bob", Some(1), vec![]).await;

    let messages = second.drain();
    let reject = messages
        .iter()
        .find_map(|m| match m {
            ControlMessage::Reject(r) => Some(r),
            _ => None,
        })
        .expect("Reject missing");
    assert_eq!(reject.reason, RejectReason::UsernameInUse);
    assert_eq!(second.session.phase(), SessionPhase::Dead);

    // The older session is untouched and saw nothing about the newcomer.
    assert_eq!(first.session.phase(), SessionPhase::Ready);
    assert!(first.drain().is_empty());
}

#[tokio::test]
async fn test_server_full_rejection() {
    let mut h = harness();
    h.core.shared.config.write().max_users = 1;

    let a = client(4003, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;

    let mut b = client(4004, "");
    admit(&mut h.core, &b, "bob", None, vec![]).await;
    let reject = b
        .drain()
        .into_iter()
        .find_map(|m| match m {
            ControlMessage::Reject(r) => Some(r),
            _ => None,
        })
        .expect("Reject missing");
    assert_eq!(reject.reason, RejectReason::ServerFull);
}

#[tokio::test]
async fn test_codec_switch_broadcast_exactly_once() {
    let mut h = harness();

    let mut a = client(4005, "");
    admit(&mut h.core, &a, "alice", None, vec![-2147483637, 8]).await;
    let mut b = client(4006, "");
    admit(&mut h.core, &b, "bob", None, vec![8]).await;

    let codec_msgs: Vec<_> = a
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            ControlMessage::CodecVersion(c) => Some(c),
            _ => None,
        })
        .collect();
    // One switch when alice joined, nothing when bob agreed.
    assert_eq!(codec_msgs.len(), 1);
    assert_eq!(codec_msgs[0].alpha, 0);
    assert_eq!(codec_msgs[0].beta, 8);
    assert!(!codec_msgs[0].prefer_alpha);

    // Bob still learns the current pair directly.
    let bob_codec: Vec<_> = b
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            ControlMessage::CodecVersion(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(bob_codec.len(), 1);
    assert_eq!(bob_codec[0].beta, 8);
    assert_eq!(h.core.codec_beta, 8);
    assert!(!h.core.prefer_alpha);
}

#[tokio::test]
async fn test_channel_remove_cascade_order_and_link_cleanup() {
    let mut h = harness();
    let mut a = client(4007, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;
    a.drain();

    let c1 = h.core.tree.add(ROOT_ID, "c1", false).unwrap();
    let c2 = h.core.tree.add(c1, "c2", false).unwrap();
    let d = h.core.tree.add(ROOT_ID, "d", false).unwrap();
    h.core.tree.link(c1, d).unwrap();

    // Alice sits in the leaf that is about to disappear.
    let alice_id = a.session.id();
    h.core.tree.move_member(alice_id, Some(ROOT_ID), Some(c2));
    a.session.set_channel_id(c2);

    h.core.remove_channel_cascade(c1, None).await.unwrap();

    let messages = a.drain();
    let relevant: Vec<String> = messages
        .iter()
        .filter_map(|m| match m {
            ControlMessage::UserState(UserState {
                session: Some(s),
                channel_id: Some(ch),
                ..
            }) => Some(format!("move:{s}->{ch}")),
            ControlMessage::ChannelRemove(ChannelRemove { channel_id }) => {
                Some(format!("remove:{channel_id}"))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        relevant,
        vec![
            format!("move:{alice_id}->{ROOT_ID}"),
            format!("remove:{c2}"),
            format!("remove:{c1}"),
        ]
    );

    assert_eq!(a.session.channel_id(), ROOT_ID);
    assert!(h.core.tree.get(d).unwrap().links.is_empty());
    assert!(!h.core.tree.contains(c1));
    assert!(!h.core.tree.contains(c2));
}

#[tokio::test]
async fn test_voice_relay_reaches_only_the_other_member() {
    let mut h = harness();
    let a = client(4008, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;
    let b = client(4009, "");
    admit(&mut h.core, &b, "bob", None, vec![]).await;

    h.core.route_voice(VoiceEnvelope {
        session: a.session.clone(),
        frame: voice_frame(0),
    });

    let delivered = h.udp_rx.try_recv().expect("no datagram was queued");
    match delivered {
        UdpOut::Voice { session, payload } => {
            assert_eq!(session.id(), b.session.id());
            // Header byte, then the speaker id varint.
            assert_eq!(payload[0], 4 << 5);
            assert_eq!(payload[1], a.session.id() as u8);
        }
        other => panic!("expected voice, got {other:?}"),
    }
    assert!(h.udp_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_muted_and_deafened_sessions_do_not_relay() {
    let mut h = harness();
    let a = client(4010, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;
    let b = client(4011, "");
    admit(&mut h.core, &b, "bob", None, vec![]).await;

    a.session.flags.lock().self_mute = true;
    h.core.route_voice(VoiceEnvelope {
        session: a.session.clone(),
        frame: voice_frame(0),
    });
    assert!(h.udp_rx.try_recv().is_err());

    a.session.flags.lock().self_mute = false;
    b.session.flags.lock().self_deaf = true;
    h.core.route_voice(VoiceEnvelope {
        session: a.session.clone(),
        frame: voice_frame(0),
    });
    assert!(h.udp_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_whisper_target_routing() {
    let mut h = harness();
    let a = client(4012, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;
    let b = client(4013, "");
    admit(&mut h.core, &b, "bob", None, vec![]).await;
    let c = client(4014, "");
    admit(&mut h.core, &c, "carol", None, vec![]).await;

    h.core.handle_voice_target(
        &a.session,
        VoiceTarget {
            id: 2,
            targets: vec![VoiceTargetSpec {
                sessions: vec![b.session.id()],
                channel_id: None,
                group: None,
                links: false,
                children: false,
            }],
        },
    );

    h.core.route_voice(VoiceEnvelope {
        session: a.session.clone(),
        frame: voice_frame(2),
    });
    match h.udp_rx.try_recv().expect("whisper was not delivered") {
        UdpOut::Voice { session, .. } => assert_eq!(session.id(), b.session.id()),
        other => panic!("expected voice, got {other:?}"),
    }
    // Carol was not addressed.
    assert!(h.udp_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_loopback_target_echoes_to_speaker() {
    let mut h = harness();
    let a = client(4015, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;

    h.core.route_voice(VoiceEnvelope {
        session: a.session.clone(),
        frame: voice_frame(31),
    });
    match h.udp_rx.try_recv().expect("loopback was not delivered") {
        UdpOut::Voice { session, .. } => assert_eq!(session.id(), a.session.id()),
        other => panic!("expected voice, got {other:?}"),
    }
}

#[tokio::test]
async fn test_permission_cache_population_and_invalidation() {
    let mut h = harness();
    let a = client(4016, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;

    let (_, cached) = h.core.query_permissions(&a.session.clone(), ROOT_ID);
    assert!(!cached);
    let (_, cached) = h.core.query_permissions(&a.session.clone(), ROOT_ID);
    assert!(cached);

    h.core.clear_acl_caches();
    let (_, cached) = h.core.query_permissions(&a.session.clone(), ROOT_ID);
    assert!(!cached);
}

#[tokio::test]
async fn test_temporary_channel_reaped_when_emptied() {
    let mut h = harness();
    let mut a = client(4017, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;
    a.drain();

    let temp = h.core.tree.add(ROOT_ID, "temp", true).unwrap();
    h.core.move_user(a.session.clone(), temp, None).await.unwrap();
    assert!(h.core.tree.contains(temp));

    h.core
        .move_user(a.session.clone(), ROOT_ID, None)
        .await
        .unwrap();
    assert!(!h.core.tree.contains(temp));
    let removes: Vec<_> = a
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ControlMessage::ChannelRemove(_)))
        .collect();
    assert_eq!(removes.len(), 1);
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_remove_and_reclaims_id() {
    let mut h = harness();
    let mut a = client(4018, "");
    admit(&mut h.core, &a, "alice", None, vec![]).await;
    let mut b = client(4019, "");
    admit(&mut h.core, &b, "bob", None, vec![]).await;
    a.drain();
    b.drain();

    let bob_id = b.session.id();
    b.session.shutdown();
    h.core.remove_session(&b.session).await.unwrap();

    let removes: Vec<_> = a
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            ControlMessage::UserRemove(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].session, bob_id);
    assert!(!h.core.tree.get(ROOT_ID).unwrap().members.contains(&bob_id));

    // Removal is idempotent.
    h.core.remove_session(&b.session).await.unwrap();

    // The freed id is handed to the next session.
    let c = client(4020, "");
    admit(&mut h.core, &c, "carol", None, vec![]).await;
    assert_eq!(c.session.id(), bob_id);
}

#[tokio::test]
async fn test_snapshot_threshold_writes_once_and_resets() {
    let dir = TempDir::new().unwrap();
    let snapshot_path = dir.path().join("image.snapshot");
    let (freezer, image) = Freezer::open(snapshot_path.clone(), dir.path().join("ops.log"), 3)
        .await
        .unwrap();

    let mut h = harness();
    h.core.freezer = Some(freezer);
    h.core.restore(image).unwrap();

    let c1 = h.core.tree.add(ROOT_ID, "one", false).unwrap();
    h.core.freeze_channel(c1).await.unwrap();
    h.core.maybe_snapshot().await.unwrap();
    let c2 = h.core.tree.add(ROOT_ID, "two", false).unwrap();
    h.core.freeze_channel(c2).await.unwrap();
    h.core.maybe_snapshot().await.unwrap();
    assert!(
        timbre::core::persistence::snapshot::load(&snapshot_path)
            .await
            .unwrap()
            .is_none()
    );

    h.core.tree.link(c1, c2).unwrap();
    h.core.freeze_channel(c1).await.unwrap();
    h.core.maybe_snapshot().await.unwrap();

    let written = timbre::core::persistence::snapshot::load(&snapshot_path)
        .await
        .unwrap()
        .expect("threshold snapshot missing");
    assert_eq!(written.channels.len(), 3);
    assert_eq!(h.core.freezer.as_ref().unwrap().ops_since_snapshot(), 0);
}
