use bytes::BytesMut;
use sentra::core::SentraError;
use sentra::core::protocol::cipher::PayloadCipher;
use sentra::core::protocol::frame::{
    COMMAND_LEN, Frame, FrameCodec, HEADER_LEN, MAX_PAYLOAD, build_frame, parse_frame,
};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_frame_round_trip_plaintext() {
    let bytes = build_frame(42, "echo", b"hello cluster", None).unwrap();
    assert_eq!(bytes.len(), HEADER_LEN + 13);

    let (consumed, counter, command, payload) = parse_frame(&bytes, None).unwrap().unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(counter, 42);
    assert_eq!(command, "echo");
    assert_eq!(payload.as_ref(), b"hello cluster");
}

#[test]
fn test_frame_command_is_first_token_of_padded_field() {
    let bytes = build_frame(7, "sync_i_w_m_p", b"", None).unwrap();
    let (_, _, command, _) = parse_frame(&bytes, None).unwrap().unwrap();
    assert_eq!(command, "sync_i_w_m_p");

    let bytes = build_frame(7, "ok", b"x", None).unwrap();
    let (_, _, command, _) = parse_frame(&bytes, None).unwrap().unwrap();
    assert_eq!(command, "ok");
}

#[test]
fn test_frame_short_buffer_yields_none_without_consuming() {
    let bytes = build_frame(1, "echo", b"payload", None).unwrap();
    // Header incomplete.
    assert!(parse_frame(&bytes[..HEADER_LEN - 1], None).unwrap().is_none());
    // Header complete, payload truncated.
    assert!(parse_frame(&bytes[..HEADER_LEN + 3], None).unwrap().is_none());
    // The buffer itself is never mutated; re-parsing the full slice works.
    assert!(parse_frame(&bytes, None).unwrap().is_some());
}

#[test]
fn test_frame_command_too_long_rejected() {
    let err = build_frame(0, "a_very_long_command", b"", None).unwrap_err();
    assert!(matches!(err, SentraError::CommandTooLong(19, n) if n == COMMAND_LEN));
}

#[test]
fn test_frame_oversize_payload_rejected_on_encode() {
    let payload = vec![0u8; MAX_PAYLOAD + 1];
    let err = build_frame(0, "echo", &payload, None).unwrap_err();
    assert!(matches!(err, SentraError::Oversize { .. }));
}

#[test]
fn test_frame_oversize_length_rejected_on_decode() {
    let mut bytes = build_frame(0, "echo", b"x", None).unwrap();
    // Forge an oversized declared length.
    bytes[4..8].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
    let err = parse_frame(&bytes, None).unwrap_err();
    assert!(matches!(err, SentraError::Oversize { .. }));
}

#[test]
fn test_frame_round_trip_with_cipher() {
    let cipher = PayloadCipher::from_key("01234567890123456789012345678901").unwrap();
    let bytes = build_frame(99, "dapi", b"secret payload", Some(&cipher)).unwrap();

    // Sealed payload differs from the plaintext on the wire.
    assert_ne!(&bytes[HEADER_LEN..], b"secret payload");

    let (consumed, counter, command, payload) =
        parse_frame(&bytes, Some(&cipher)).unwrap().unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(counter, 99);
    assert_eq!(command, "dapi");
    assert_eq!(payload.as_ref(), b"secret payload");
}

#[test]
fn test_frame_wrong_key_yields_bad_auth() {
    let good = PayloadCipher::from_key("01234567890123456789012345678901").unwrap();
    let bad = PayloadCipher::from_key("99999999999999999999999999999999").unwrap();
    let bytes = build_frame(1, "echo", b"payload", Some(&good)).unwrap();
    let err = parse_frame(&bytes, Some(&bad)).unwrap_err();
    assert!(matches!(err, SentraError::BadAuth));
}

#[test]
fn test_frame_empty_payload_stays_plaintext_under_cipher() {
    let cipher = PayloadCipher::from_key("01234567890123456789012345678901").unwrap();
    let bytes = build_frame(5, "sync_i_w_m", b"", Some(&cipher)).unwrap();
    assert_eq!(bytes.len(), HEADER_LEN);
    let (_, _, command, payload) = parse_frame(&bytes, Some(&cipher)).unwrap().unwrap();
    assert_eq!(command, "sync_i_w_m");
    assert!(payload.is_empty());
}

#[test]
fn test_cipher_rejects_bad_key_length() {
    assert!(matches!(
        PayloadCipher::from_key("short"),
        Err(SentraError::InvalidKey(_))
    ));
}

#[test]
fn test_codec_decodes_two_back_to_back_frames() {
    let mut codec = FrameCodec::new(None);
    let mut buf = BytesMut::new();
    codec
        .encode(Frame::new(1, "echo", &b"first"[..]), &mut buf)
        .unwrap();
    codec
        .encode(Frame::new(2, "echo", &b"second"[..]), &mut buf)
        .unwrap();

    let first = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!((first.counter, first.payload.as_ref()), (1, &b"first"[..]));
    let second = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!((second.counter, second.payload.as_ref()), (2, &b"second"[..]));
    assert!(codec.decode(&mut buf).unwrap().is_none());
    assert!(buf.is_empty());
}
