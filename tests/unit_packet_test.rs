use bytes::{Buf, Bytes, BytesMut};
use timbre::core::protocol::packet::{
    self, PROBE_LEN, TARGET_CURRENT_CHANNEL, TARGET_LOOPBACK,
};
use timbre::core::protocol::{VoiceFrame, VoiceKind};

#[test]
fn test_varint_roundtrip_boundaries() {
    let cases = [
        0u64,
        1,
        0x7f,
        0x80,
        0x3fff,
        0x4000,
        0x1f_ffff,
        0x20_0000,
        0xfff_ffff,
        0x1000_0000,
        u64::from(u32::MAX),
        u64::from(u32::MAX) + 1,
        u64::MAX,
    ];
    for value in cases {
        let mut buf = BytesMut::new();
        packet::put_varint(&mut buf, value);
        let mut bytes = buf.freeze();
        assert_eq!(packet::get_varint(&mut bytes).unwrap(), value, "value {value}");
        assert!(bytes.is_empty(), "leftover bytes for {value}");
    }
}

#[test]
fn test_varint_short_form_is_compact() {
    let mut buf = BytesMut::new();
    packet::put_varint(&mut buf, 0x42);
    assert_eq!(buf.len(), 1);

    let mut buf = BytesMut::new();
    packet::put_varint(&mut buf, 0x1234);
    assert_eq!(buf.len(), 2);
}

#[test]
fn test_truncated_varint_errors() {
    let mut bytes = Bytes::from_static(&[0x80]);
    assert!(packet::get_varint(&mut bytes).is_err());
    let mut empty = Bytes::new();
    assert!(packet::get_varint(&mut empty).is_err());
}

#[test]
fn test_voice_frame_parse_and_relay() {
    // Opus (kind 4) to target 0, sequence 5, one payload byte.
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&[(4u8 << 5) | TARGET_CURRENT_CHANNEL, 0x05, 0xAA]);
    let frame = VoiceFrame::parse(raw.freeze()).unwrap();
    assert_eq!(frame.kind, VoiceKind::Opus);
    assert_eq!(frame.target, TARGET_CURRENT_CHANNEL);

    let mut relayed = frame.relay_bytes(3);
    assert_eq!(relayed.get_u8(), 4 << 5);
    assert_eq!(packet::get_varint(&mut relayed).unwrap(), 3);
    assert_eq!(&relayed[..], &[0x05, 0xAA]);
}

#[test]
fn test_voice_frame_echo_is_unchanged() {
    let raw = Bytes::from_static(&[(1u8 << 5) | TARGET_LOOPBACK, 0x01, 0x02]);
    let frame = VoiceFrame::parse(raw.clone()).unwrap();
    assert_eq!(frame.kind, VoiceKind::Ping);
    assert_eq!(frame.echo_bytes(), raw);
}

#[test]
fn test_invalid_voice_frames_are_rejected() {
    assert!(VoiceFrame::parse(Bytes::new()).is_err());
    // Kind 7 is not assigned.
    assert!(VoiceFrame::parse(Bytes::from_static(&[7 << 5])).is_err());
}

#[test]
fn test_probe_parse_and_reply() {
    let mut probe = BytesMut::new();
    probe.extend_from_slice(&0u32.to_be_bytes());
    probe.extend_from_slice(&0xDEADBEEF_CAFEF00Du64.to_be_bytes());
    assert_eq!(probe.len(), PROBE_LEN);
    assert_eq!(packet::parse_probe(&probe), Some(0xDEADBEEF_CAFEF00D));

    // Wrong request code or length is not a probe.
    let mut wrong = probe.clone();
    wrong[0] = 1;
    assert_eq!(packet::parse_probe(&wrong), None);
    assert_eq!(packet::parse_probe(&probe[..11]), None);

    let mut reply = packet::probe_reply(0x10402, 99, 3, 100, 72000);
    assert_eq!(reply.len(), 24);
    assert_eq!(reply.get_u32(), 0x10402);
    assert_eq!(reply.get_u64(), 99);
    assert_eq!(reply.get_u32(), 3);
    assert_eq!(reply.get_u32(), 100);
    assert_eq!(reply.get_u32(), 72000);
}
