use bytes::{BufMut, Bytes, BytesMut};
use timbre::core::protocol::messages::{
    Authenticate, ChannelState, CodecVersion, CryptSetup, Ping, Reject, RejectReason, TextMessage,
    UserState, VoiceTarget, VoiceTargetSpec, kind,
};
use timbre::core::protocol::{ControlCodec, ControlMessage};
use tokio_util::codec::{Decoder, Encoder};

fn roundtrip(message: ControlMessage) -> ControlMessage {
    let mut codec = ControlCodec;
    let mut buf = BytesMut::new();
    codec.encode(message, &mut buf).unwrap();
    codec.decode(&mut buf).unwrap().unwrap()
}

#[test]
fn test_decode_waits_for_complete_frames() {
    let mut codec = ControlCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(
            ControlMessage::Ping(Ping {
                timestamp: 42,
                ..Ping::default()
            }),
            &mut buf,
        )
        .unwrap();

    // Feed the frame one byte at a time; only the final byte completes it.
    let bytes = buf.split().freeze();
    let mut partial = BytesMut::new();
    for (index, byte) in bytes.iter().enumerate() {
        partial.put_u8(*byte);
        let decoded = codec.decode(&mut partial).unwrap();
        if index + 1 < bytes.len() {
            assert!(decoded.is_none());
        } else {
            match decoded {
                Some(ControlMessage::Ping(ping)) => assert_eq!(ping.timestamp, 42),
                other => panic!("expected a ping, got {other:?}"),
            }
        }
    }
    assert!(partial.is_empty());
}

#[test]
fn test_two_frames_in_one_buffer() {
    let mut codec = ControlCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(ControlMessage::ChannelRemove(Default::default()), &mut buf)
        .unwrap();
    codec
        .encode(
            ControlMessage::Ping(Ping {
                timestamp: 7,
                ..Ping::default()
            }),
            &mut buf,
        )
        .unwrap();

    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(ControlMessage::ChannelRemove(_))
    ));
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(ControlMessage::Ping(_))
    ));
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_oversized_frame_is_refused() {
    let mut codec = ControlCodec;
    let mut buf = BytesMut::new();
    buf.put_u16(kind::PING);
    buf.put_u32(64 * 1024 * 1024);
    assert!(codec.decode(&mut buf).is_err());
}

#[test]
fn test_unknown_kind_decodes_to_unknown() {
    let mut codec = ControlCodec;
    let mut buf = BytesMut::new();
    buf.put_u16(999);
    buf.put_u32(3);
    buf.extend_from_slice(&[1, 2, 3]);
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(ControlMessage::Unknown(999))
    ));
}

#[test]
fn test_authenticate_roundtrip() {
    let original = Authenticate {
        username: "alice".into(),
        password: "s3cret".into(),
        tokens: vec!["a".into(), "b".into()],
        celt_versions: vec![-2147483637, 8],
        opus: true,
    };
    match roundtrip(ControlMessage::Authenticate(original.clone())) {
        ControlMessage::Authenticate(decoded) => assert_eq!(decoded, original),
        other => panic!("wrong kind: {other:?}"),
    }
}

#[test]
fn test_user_state_roundtrip_with_sparse_fields() {
    let original = UserState {
        session: Some(3),
        channel_id: Some(1),
        self_mute: Some(true),
        comment: Some("hello".into()),
        hash: Some("aabbcc".into()),
        ..UserState::default()
    };
    match roundtrip(ControlMessage::UserState(original.clone())) {
        ControlMessage::UserState(decoded) => assert_eq!(decoded, original),
        other => panic!("wrong kind: {other:?}"),
    }
}

#[test]
fn test_channel_state_roundtrip() {
    let original = ChannelState {
        channel_id: None,
        parent: Some(0),
        name: Some("Lobby".into()),
        links: vec![4, 5],
        links_add: vec![6],
        temporary: Some(true),
        position: Some(-3),
        description_hash: Some(Bytes::from_static(b"beef")),
        ..ChannelState::default()
    };
    match roundtrip(ControlMessage::ChannelState(original.clone())) {
        ControlMessage::ChannelState(decoded) => assert_eq!(decoded, original),
        other => panic!("wrong kind: {other:?}"),
    }
}

#[test]
fn test_reject_and_codec_version_roundtrip() {
    match roundtrip(ControlMessage::Reject(Reject {
        reason: RejectReason::UsernameInUse,
        description: "taken".into(),
    })) {
        ControlMessage::Reject(decoded) => {
            assert_eq!(decoded.reason, RejectReason::UsernameInUse);
            assert_eq!(decoded.description, "taken");
        }
        other => panic!("wrong kind: {other:?}"),
    }

    let codec_version = CodecVersion {
        alpha: 0,
        beta: 8,
        prefer_alpha: false,
        opus: true,
    };
    match roundtrip(ControlMessage::CodecVersion(codec_version.clone())) {
        ControlMessage::CodecVersion(decoded) => assert_eq!(decoded, codec_version),
        other => panic!("wrong kind: {other:?}"),
    }
}

#[test]
fn test_crypt_setup_and_voice_target_roundtrip() {
    let crypt = CryptSetup {
        key: Bytes::from_static(&[1; 16]),
        client_nonce: Bytes::new(),
        server_nonce: Bytes::from_static(&[2; 16]),
    };
    match roundtrip(ControlMessage::CryptSetup(crypt.clone())) {
        ControlMessage::CryptSetup(decoded) => assert_eq!(decoded, crypt),
        other => panic!("wrong kind: {other:?}"),
    }

    let target = VoiceTarget {
        id: 4,
        targets: vec![VoiceTargetSpec {
            sessions: vec![1, 2],
            channel_id: Some(3),
            group: None,
            links: true,
            children: false,
        }],
    };
    match roundtrip(ControlMessage::VoiceTarget(target.clone())) {
        ControlMessage::VoiceTarget(decoded) => assert_eq!(decoded, target),
        other => panic!("wrong kind: {other:?}"),
    }
}

#[test]
fn test_truncated_payload_is_an_error() {
    let mut codec = ControlCodec;
    let mut full = BytesMut::new();
    codec
        .encode(
            ControlMessage::TextMessage(TextMessage {
                actor: Some(1),
                message: "hi there".into(),
                ..TextMessage::default()
            }),
            &mut full,
        )
        .unwrap();

    // Rewrite the length header to cut the payload short.
    let body_len = (full.len() - 6) as u32;
    let mut truncated = BytesMut::new();
    truncated.put_u16(kind::TEXT_MESSAGE);
    truncated.put_u32(body_len - 4);
    truncated.extend_from_slice(&full[6..full.len() - 4]);
    assert!(codec.decode(&mut truncated).is_err());
}
