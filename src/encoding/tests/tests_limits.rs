//! Safety-limit tests: oversized length fields must be rejected before any
//! allocation is attempted.

use crate::encoding::*;

#[test]
fn byte_length_over_cap_rejected() {
    let bytes = encode_to_vec(&(MAX_BYTE_LEN + 1)).unwrap();
    let err = decode_from_slice::<Vec<u8>>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn byte_length_at_cap_is_only_bounded_by_buffer() {
    // A length exactly at the cap passes the limit check and then fails on
    // the (much shorter) actual buffer — proving the cap is not off by one.
    let bytes = encode_to_vec(&MAX_BYTE_LEN).unwrap();
    let err = decode_from_slice::<Vec<u8>>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

#[test]
fn vec_count_over_cap_rejected() {
    let bytes = encode_to_vec(&(MAX_VEC_ELEMENTS + 1)).unwrap();
    let err = decode_vec::<u64>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn string_length_over_cap_rejected() {
    let bytes = encode_to_vec(&u32::MAX).unwrap();
    let err = decode_from_slice::<String>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}
