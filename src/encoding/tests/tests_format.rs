//! Wire-format tests: byte layout, option tags, sequences, truncation.

use crate::encoding::*;

#[test]
fn integers_are_little_endian() {
    assert_eq!(encode_to_vec(&0x1122u16).unwrap(), [0x22, 0x11]);
    assert_eq!(encode_to_vec(&0x11223344u32).unwrap(), [0x44, 0x33, 0x22, 0x11]);
    assert_eq!(
        encode_to_vec(&0x1122334455667788u64).unwrap(),
        [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn byte_string_carries_length_prefix() {
    let bytes = encode_to_vec(&b"abc".to_vec()).unwrap();
    assert_eq!(bytes, [3, 0, 0, 0, b'a', b'b', b'c']);

    let (decoded, consumed) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
    assert_eq!(decoded, b"abc");
    assert_eq!(consumed, 7);
}

#[test]
fn empty_byte_string() {
    let bytes = encode_to_vec(&Vec::<u8>::new()).unwrap();
    assert_eq!(bytes, [0, 0, 0, 0]);
    let (decoded, _) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
    assert!(decoded.is_empty());
}

#[test]
fn option_tags() {
    let none: Option<u64> = None;
    assert_eq!(encode_to_vec(&none).unwrap(), [0]);

    let some: Option<u64> = Some(7);
    let bytes = encode_to_vec(&some).unwrap();
    assert_eq!(bytes[0], 1);
    let (decoded, consumed) = decode_from_slice::<Option<u64>>(&bytes).unwrap();
    assert_eq!(decoded, Some(7));
    assert_eq!(consumed, 9);
}

#[test]
fn option_rejects_unknown_tag() {
    let err = decode_from_slice::<Option<u64>>(&[9]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 9, .. }));
}

#[test]
fn bool_rejects_junk_byte() {
    let err = decode_from_slice::<bool>(&[2]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(2)));
}

#[test]
fn vec_of_structs_roundtrip() {
    let items: Vec<u64> = vec![1, 2, 3, u64::MAX];
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();

    let (decoded, consumed) = decode_vec::<u64>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(consumed, buf.len());
}

#[test]
fn truncated_buffer_reports_eof() {
    let bytes = encode_to_vec(&0x11223344u32).unwrap();
    let err = decode_from_slice::<u32>(&bytes[..2]).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::UnexpectedEof {
            needed: 4,
            available: 2
        }
    ));
}

#[test]
fn truncated_byte_string_payload_reports_eof() {
    // Length prefix says 100 bytes, but only 3 follow.
    let mut bytes = encode_to_vec(&100u32).unwrap();
    bytes.extend_from_slice(b"abc");
    let err = decode_from_slice::<Vec<u8>>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

#[test]
fn invalid_utf8_string_rejected() {
    let mut bytes = encode_to_vec(&2u32).unwrap();
    bytes.extend_from_slice(&[0xFF, 0xFE]);
    let err = decode_from_slice::<String>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidUtf8(_)));
}

#[test]
fn decoding_is_positional() {
    // Two values back to back; the consumed counts chain them.
    let mut buf = Vec::new();
    42u64.encode_to(&mut buf).unwrap();
    b"xyz".to_vec().encode_to(&mut buf).unwrap();

    let (first, n) = decode_from_slice::<u64>(&buf).unwrap();
    let (second, m) = decode_from_slice::<Vec<u8>>(&buf[n..]).unwrap();
    assert_eq!(first, 42);
    assert_eq!(second, b"xyz");
    assert_eq!(n + m, buf.len());
}
