use timbre::core::crypt::{CryptState, HEADER_SIZE};

fn pair() -> (CryptState, CryptState) {
    // The client mirrors the server's key with the nonce roles swapped.
    let key = [7u8; 16];
    let server_to_client = [1u8; 16];
    let client_to_server = [2u8; 16];
    let server = CryptState::with_material(key, server_to_client, client_to_server);
    let client = CryptState::with_material(key, client_to_server, server_to_client);
    (server, client)
}

#[test]
fn test_roundtrip_various_lengths() {
    let (mut server, mut client) = pair();
    for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 100, 500] {
        let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut cipher = Vec::new();
        client.encrypt(&plain, &mut cipher);
        assert_eq!(cipher.len(), plain.len() + HEADER_SIZE);

        let mut out = Vec::new();
        server.decrypt(&cipher, &mut out).unwrap();
        assert_eq!(out, plain);
    }
    assert_eq!(server.good, 10);
    assert_eq!(server.lost, 0);
}

#[test]
fn test_wrong_key_fails() {
    let (_, mut client) = pair();
    let mut other = CryptState::with_material([9u8; 16], [1u8; 16], [2u8; 16]);

    let mut cipher = Vec::new();
    client.encrypt(b"frame", &mut cipher);
    let mut out = Vec::new();
    assert!(other.decrypt(&cipher, &mut out).is_err());
}

#[test]
fn test_tampered_tag_fails_and_keeps_nonce_state() {
    let (mut server, mut client) = pair();

    let mut cipher = Vec::new();
    client.encrypt(b"first", &mut cipher);
    let mut tampered = cipher.clone();
    tampered[1] ^= 0xff;
    let mut out = Vec::new();
    assert!(server.decrypt(&tampered, &mut out).is_err());

    // The untampered original must still decrypt.
    server.decrypt(&cipher, &mut out).unwrap();
    assert_eq!(out, b"first");
}

#[test]
fn test_replay_is_rejected() {
    let (mut server, mut client) = pair();

    let mut first = Vec::new();
    client.encrypt(b"one", &mut first);
    let mut second = Vec::new();
    client.encrypt(b"two", &mut second);

    let mut out = Vec::new();
    server.decrypt(&first, &mut out).unwrap();
    server.decrypt(&second, &mut out).unwrap();
    // Replaying an already-seen nonce must fail.
    assert!(server.decrypt(&first, &mut out).is_err());
}

#[test]
fn test_out_of_order_frame_is_late_but_accepted() {
    let (mut server, mut client) = pair();

    let mut first = Vec::new();
    client.encrypt(b"one", &mut first);
    let mut second = Vec::new();
    client.encrypt(b"two", &mut second);
    let mut third = Vec::new();
    client.encrypt(b"three", &mut third);

    let mut out = Vec::new();
    server.decrypt(&first, &mut out).unwrap();
    server.decrypt(&third, &mut out).unwrap();
    assert_eq!(server.lost, 1);

    server.decrypt(&second, &mut out).unwrap();
    assert_eq!(out, b"two");
    assert_eq!(server.late, 1);
    assert_eq!(server.lost, 0);
    assert_eq!(server.good, 3);
}

#[test]
fn test_gap_counts_lost_frames() {
    let (mut server, mut client) = pair();
    let mut out = Vec::new();
    let mut cipher = Vec::new();

    client.encrypt(b"a", &mut cipher);
    server.decrypt(&cipher, &mut out).unwrap();
    for _ in 0..4 {
        client.encrypt(b"skipped", &mut cipher);
    }
    client.encrypt(b"b", &mut cipher);
    server.decrypt(&cipher, &mut out).unwrap();
    assert_eq!(server.lost, 4);
}

#[test]
fn test_nonce_resync_installs_new_decrypt_state() {
    let (mut server, _) = pair();
    assert!(server.set_decrypt_nonce(&[5u8; 16]));
    assert_eq!(server.resync, 1);
    assert_eq!(server.decrypt_nonce(), &[5u8; 16]);

    assert!(!server.set_decrypt_nonce(&[5u8; 8]));
    assert_eq!(server.resync, 1);
}

#[test]
fn test_generated_states_differ() {
    let a = CryptState::generate().unwrap();
    let b = CryptState::generate().unwrap();
    assert_ne!(a.key(), b.key());
}
