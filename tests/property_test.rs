//! Property-based checks for the codec-facing primitives.

use bytes::BytesMut;
use proptest::prelude::*;
use timbre::core::crypt::{CryptState, HEADER_SIZE};
use timbre::core::protocol::packet;

proptest! {
    #[test]
    fn prop_varint_roundtrip(value in any::<u64>()) {
        let mut buf = BytesMut::new();
        packet::put_varint(&mut buf, value);
        let mut bytes = buf.freeze();
        prop_assert_eq!(packet::get_varint(&mut bytes).unwrap(), value);
        prop_assert!(bytes.is_empty());
    }

    #[test]
    fn prop_crypt_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..400)) {
        let key = [3u8; 16];
        let mut sender = CryptState::with_material(key, [1u8; 16], [2u8; 16]);
        let mut receiver = CryptState::with_material(key, [2u8; 16], [1u8; 16]);

        let mut cipher = Vec::new();
        sender.encrypt(&payload, &mut cipher);
        prop_assert_eq!(cipher.len(), payload.len() + HEADER_SIZE);

        let mut plain = Vec::new();
        receiver.decrypt(&cipher, &mut plain).unwrap();
        prop_assert_eq!(plain, payload);
    }

    #[test]
    fn prop_crypt_rejects_bit_flips(
        payload in proptest::collection::vec(any::<u8>(), 1..64),
        flip_index in 0usize..16,
    ) {
        let key = [3u8; 16];
        let mut sender = CryptState::with_material(key, [1u8; 16], [2u8; 16]);
        let mut receiver = CryptState::with_material(key, [2u8; 16], [1u8; 16]);

        let mut cipher = Vec::new();
        sender.encrypt(&payload, &mut cipher);
        // Flip one bit anywhere past the nonce byte.
        let index = 1 + (flip_index % (cipher.len() - 1));
        cipher[index] ^= 0x01;

        let mut plain = Vec::new();
        prop_assert!(receiver.decrypt(&cipher, &mut plain).is_err());
    }
}
