use crate::encoding::{Decode, EncodingError, decode_vec};

#[test]
fn test_string_length_limit_rejected() {
    // Length prefix claims 1 MiB; the decoder must refuse before
    // allocating anything.
    let mut buf = Vec::new();
    buf.extend_from_slice(&(1u32 << 20).to_le_bytes());
    assert!(matches!(
        String::decode_from(&buf),
        Err(EncodingError::LengthOverflow(_))
    ));
}

#[test]
fn test_vec_element_limit_rejected() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(
        decode_vec::<u32>(&buf),
        Err(EncodingError::LengthOverflow(_))
    ));
}

#[test]
fn test_declared_length_beyond_buffer_is_eof() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(b"short");
    assert!(matches!(
        String::decode_from(&buf),
        Err(EncodingError::UnexpectedEof { .. })
    ));
}
