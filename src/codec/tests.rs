//! Codec Tests
//!
//! Encoding and decoding of all ten commands, streaming behaviour over
//! partial input, and rejection of malformed frames.

use bytes::{BufMut, Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Direction, Encoder, FRAME_OVERHEAD};
use crate::protocol::{
    Auth, Connect, DecodeError, EncodeError, ErrorCode, ErrorFrame, Frame, HeaderBlock, Info, Msg,
    Publish, Subscribe, Unsubscribe, PROTOCOL_VERSION,
};

// ============================================================================
// Helper functions
// ============================================================================

fn encode(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(frame, &mut buf).unwrap();
    buf
}

fn decode_with(decoder: &mut Decoder, bytes: &[u8]) -> Result<Option<Frame>, DecodeError> {
    let mut buf = BytesMut::from(bytes);
    decoder.decode(&mut buf)
}

fn decode_server(bytes: &[u8]) -> Result<Option<Frame>, DecodeError> {
    decode_with(&mut Decoder::server(), bytes)
}

fn decode_client(bytes: &[u8]) -> Result<Option<Frame>, DecodeError> {
    decode_with(&mut Decoder::client(), bytes)
}

fn roundtrip(frame: Frame) {
    let encoded = encode(&frame);
    let mut decoder = if frame.command().is_client_command() {
        Decoder::server()
    } else {
        Decoder::client()
    };
    let mut buf = encoded.clone();
    let decoded = decoder.decode(&mut buf).unwrap().unwrap();
    assert_eq!(frame, decoded);
    assert!(buf.is_empty(), "decoder left {} bytes", buf.len());
}

fn sample_header() -> HeaderBlock {
    HeaderBlock::from_entries([("trace-id", "42"), ("content-type", "text/plain")]).unwrap()
}

fn publish(topic: &'static str, payload: &'static [u8]) -> Frame {
    Frame::Pub(Publish {
        topic: Bytes::from_static(topic.as_bytes()),
        reply_to: None,
        header: None,
        payload: Bytes::from_static(payload),
    })
}

// ============================================================================
// Wire layout
// ============================================================================

#[test]
fn test_ping_pong_ok_wire_bytes() {
    assert_eq!(&encode(&Frame::Ping)[..], &[0x70, 0x00]);
    assert_eq!(&encode(&Frame::Pong)[..], &[0x80, 0x00]);
    assert_eq!(&encode(&Frame::Ok)[..], &[0x90, 0x00]);
}

#[test]
fn test_publish_wire_bytes() {
    let encoded = encode(&publish("a/b", b"hi"));
    assert_eq!(
        &encoded[..],
        &[
            0x30, // PUB, no flags
            0x08, // remaining length
            0x00, 0x03, b'a', b'/', b'b', // topic
            0x02, b'h', b'i', // payload
        ]
    );
}

#[test]
fn test_publish_flags_reflect_optional_sections() {
    let frame = Frame::Pub(Publish {
        topic: Bytes::from_static(b"a"),
        reply_to: Some(Bytes::from_static(b"r")),
        header: Some(sample_header()),
        payload: Bytes::new(),
    });
    assert_eq!(encode(&frame)[0], 0x33);
}

#[test]
fn test_connect_password_wire_bytes() {
    let frame = Frame::Connect(Connect {
        version: PROTOCOL_VERSION,
        verbose: true,
        auth: Some(Auth::Password {
            username: Bytes::from_static(b"u"),
            password: Bytes::from_static(b"pw"),
        }),
    });
    assert_eq!(
        &encode(&frame)[..],
        &[
            0x23, // CONNECT, verbose + has_auth
            0x08, // remaining length
            0x01, // version
            0x01, // password auth
            0x05, // auth payload length
            0x01, b'u', 0x02, b'p', b'w',
        ]
    );
}

// ============================================================================
// Round trips, every command and optional-section combination
// ============================================================================

#[test]
fn test_info_roundtrip() {
    for (auth_required, headers_supported) in [(false, false), (true, false), (false, true), (true, true)] {
        roundtrip(Frame::Info(Info {
            version: PROTOCOL_VERSION,
            max_payload: 1024 * 1024,
            server_id: Bytes::from_static(b"srv-1"),
            server_name: Bytes::from_static(b"ocypode"),
            auth_required,
            headers_supported,
        }));
    }
}

#[test]
fn test_connect_roundtrip() {
    let auths = [
        None,
        Some(Auth::Password {
            username: Bytes::from_static(b"alice"),
            password: Bytes::from_static(b"secret"),
        }),
        Some(Auth::Jwt {
            token: Bytes::from_static(b"eyJhbGciOiJIUzI1NiJ9.e30.sig"),
        }),
    ];
    for auth in auths {
        for verbose in [false, true] {
            roundtrip(Frame::Connect(Connect {
                version: PROTOCOL_VERSION,
                verbose,
                auth: auth.clone(),
            }));
        }
    }
}

#[test]
fn test_publish_roundtrip() {
    for reply_to in [None, Some(Bytes::from_static(b"_inbox/1"))] {
        for header in [None, Some(sample_header())] {
            roundtrip(Frame::Pub(Publish {
                topic: Bytes::from_static(b"sensor/data"),
                reply_to: reply_to.clone(),
                header,
                payload: Bytes::from_static(b"21.5"),
            }));
        }
    }
}

#[test]
fn test_subscribe_roundtrip() {
    for queue_group in [None, Some(Bytes::from_static(b"workers"))] {
        roundtrip(Frame::Sub(Subscribe {
            topic: Bytes::from_static(b"sensor/+/data"),
            subscription_id: Bytes::from_static(b"s1"),
            queue_group,
        }));
    }
}

#[test]
fn test_unsubscribe_roundtrip() {
    roundtrip(Frame::Unsub(Unsubscribe {
        subscription_id: Bytes::from_static(b"s1"),
    }));
}

#[test]
fn test_msg_roundtrip() {
    for reply_to in [None, Some(Bytes::from_static(b"_inbox/1"))] {
        for header in [None, Some(sample_header())] {
            roundtrip(Frame::Msg(Msg {
                topic: Bytes::from_static(b"sensor/data"),
                subscription_id: Bytes::from_static(b"s1"),
                reply_to: reply_to.clone(),
                header,
                payload: Bytes::from(vec![0xAB; 300]),
            }));
        }
    }
}

#[test]
fn test_control_frames_roundtrip() {
    roundtrip(Frame::Ping);
    roundtrip(Frame::Pong);
    roundtrip(Frame::Ok);
    roundtrip(Frame::Err(ErrorFrame {
        code: ErrorCode::UnknownSubscriptionId,
        message: Bytes::from_static(b"unknown subscription id"),
    }));
}

// ============================================================================
// Streaming
// ============================================================================

#[test]
fn test_partial_reads_byte_by_byte() {
    let encoded = encode(&publish("sensor/data", b"payload"));
    let mut decoder = Decoder::server();
    let mut buf = BytesMut::new();

    for (i, byte) in encoded.iter().enumerate() {
        buf.put_u8(*byte);
        let result = decoder.decode(&mut buf).unwrap();
        if i + 1 < encoded.len() {
            assert!(result.is_none(), "frame produced early at byte {}", i);
        } else {
            assert_eq!(result, Some(publish("sensor/data", b"payload")));
        }
    }
    assert!(!decoder.has_pending_header());
}

#[test]
fn test_header_kept_across_partial_body() {
    let encoded = encode(&publish("a", b"0123456789"));
    let mut decoder = Decoder::server();
    let mut buf = BytesMut::from(&encoded[..4]);

    assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    assert!(decoder.has_pending_header());
    // Header bytes were consumed, the partial body stays buffered
    assert_eq!(buf.len(), 2);

    buf.extend_from_slice(&encoded[4..]);
    assert_eq!(
        decoder.decode(&mut buf).unwrap(),
        Some(publish("a", b"0123456789"))
    );
}

#[test]
fn test_multiple_frames_in_one_buffer() {
    let mut buf = encode(&Frame::Ping);
    buf.extend_from_slice(&encode(&publish("a", b"x")));
    buf.extend_from_slice(&encode(&Frame::Pong));

    let mut decoder = Decoder::server();
    assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Frame::Ping));
    assert_eq!(decoder.decode(&mut buf).unwrap(), Some(publish("a", b"x")));
    assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Frame::Pong));
    assert_eq!(decoder.decode(&mut buf).unwrap(), None);
}

#[test]
fn test_decode_frame_reports_consumed_length() {
    let mut buf = encode(&publish("a", b"x"));
    let first_len = buf.len();
    buf.extend_from_slice(&encode(&Frame::Ping));
    let src = buf.freeze();

    let decoder = Decoder::server();
    let (frame, consumed) = decoder.decode_frame(&src).unwrap().unwrap();
    assert_eq!(frame, publish("a", b"x"));
    assert_eq!(consumed, first_len);

    let (frame, _) = decoder.decode_frame(&src.slice(consumed..)).unwrap().unwrap();
    assert_eq!(frame, Frame::Ping);

    assert_eq!(decoder.decode_frame(&src.slice(..first_len - 1)).unwrap(), None);
}

#[test]
fn test_payload_is_a_view_of_the_input_buffer() {
    let encoded = encode(&publish("a", b"zero-copy payload")).freeze();
    let range = encoded.as_ptr() as usize..encoded.as_ptr() as usize + encoded.len();

    let (frame, _) = Decoder::server().decode_frame(&encoded).unwrap().unwrap();
    let Frame::Pub(p) = frame else {
        panic!("expected PUB");
    };
    assert!(range.contains(&(p.payload.as_ptr() as usize)));
    assert!(range.contains(&(p.topic.as_ptr() as usize)));
}

// ============================================================================
// Malformed input
// ============================================================================

#[test]
fn test_reserved_flag_rejected() {
    // PING with a flag bit set
    assert_eq!(decode_server(&[0x71, 0x00]), Err(DecodeError::ReservedFlagSet));
    // SUB only defines bit0
    assert_eq!(decode_server(&[0x42, 0x00]), Err(DecodeError::ReservedFlagSet));
    // CONNECT bit2
    assert_eq!(decode_server(&[0x24, 0x01, 0x01]), Err(DecodeError::ReservedFlagSet));
}

#[test]
fn test_unknown_command_rejected() {
    assert_eq!(decode_server(&[0x00, 0x00]), Err(DecodeError::UnknownCommand(0x0)));
    assert_eq!(decode_server(&[0xB0, 0x00]), Err(DecodeError::UnknownCommand(0xB)));
    assert_eq!(decode_client(&[0xF0, 0x00]), Err(DecodeError::UnknownCommand(0xF)));
}

#[test]
fn test_direction_enforced() {
    let msg = encode(&Frame::Ok);
    assert!(matches!(
        decode_server(&msg),
        Err(DecodeError::UnexpectedCommand(_))
    ));
    let sub = encode(&Frame::Unsub(Unsubscribe {
        subscription_id: Bytes::from_static(b"s"),
    }));
    assert!(matches!(
        decode_client(&sub),
        Err(DecodeError::UnexpectedCommand(_))
    ));
    // PING and PONG flow both ways
    assert_eq!(decode_client(&[0x70, 0x00]), Ok(Some(Frame::Ping)));
    assert_eq!(decode_server(&[0x80, 0x00]), Ok(Some(Frame::Pong)));
}

#[test]
fn test_non_empty_ping_is_length_mismatch() {
    assert_eq!(
        decode_server(&[0x70, 0x01, 0x00]),
        Err(DecodeError::FrameLengthMismatch)
    );
}

#[test]
fn test_topic_length_past_frame_end() {
    // UNSUB declaring a 5-byte id inside a 3-byte body
    assert_eq!(
        decode_server(&[0x50, 0x03, 0x00, 0x05, b'a']),
        Err(DecodeError::FrameLengthMismatch)
    );
}

#[test]
fn test_trailing_bytes_are_length_mismatch() {
    // UNSUB "a" followed by one stray byte still inside remaining_length
    assert_eq!(
        decode_server(&[0x50, 0x04, 0x00, 0x01, b'a', 0xFF]),
        Err(DecodeError::FrameLengthMismatch)
    );
}

#[test]
fn test_auth_length_must_match_auth_payload() {
    // auth_len says 6 but the password section only covers 5 bytes
    let bytes = [
        0x22, 0x09, 0x01, 0x01, 0x06, 0x01, b'u', 0x02, b'p', b'w', 0x00,
    ];
    assert_eq!(decode_server(&bytes), Err(DecodeError::FrameLengthMismatch));
}

#[test]
fn test_unknown_auth_type() {
    let bytes = [0x22, 0x04, 0x01, 0x07, 0x01, 0x00];
    assert_eq!(decode_server(&bytes), Err(DecodeError::UnknownAuthType(7)));
}

#[test]
fn test_unknown_error_code() {
    let bytes = [0xA0, 0x03, 0x42, 0x00, 0x00];
    assert_eq!(decode_client(&bytes), Err(DecodeError::UnknownErrorCode(0x42)));
}

#[test]
fn test_malformed_header_block() {
    // PUB with header flag, header block holds a key with no value length
    let bytes = [
        0x32, 0x09, 0x00, 0x01, b'a', 0x00, 0x02, 0x01, b'k', 0x00, 0x00,
    ];
    assert_eq!(decode_server(&bytes), Err(DecodeError::FrameLengthMismatch));
}

#[test]
fn test_payload_over_limit_rejected() {
    let frame = Frame::Pub(Publish {
        topic: Bytes::from_static(b"a"),
        reply_to: None,
        header: None,
        payload: Bytes::from(vec![0u8; 101]),
    });
    let mut decoder = Decoder::server().with_max_payload(100);
    assert_eq!(
        decode_with(&mut decoder, &encode(&frame)),
        Err(DecodeError::PayloadTooLarge)
    );
}

#[test]
fn test_remaining_length_over_limit_rejected_before_body_arrives() {
    let mut decoder = Decoder::server().with_max_payload(16);
    let too_long = 16 + FRAME_OVERHEAD as u32 + 1;
    let mut buf = BytesMut::new();
    buf.put_u8(0x30);
    crate::codec::write_variable_int(&mut buf, too_long).unwrap();
    assert_eq!(decoder.decode(&mut buf), Err(DecodeError::PayloadTooLarge));
}

#[test]
fn test_encoder_refuses_oversized_payload() {
    let encoder = Encoder::new().with_max_payload(4);
    let mut buf = BytesMut::new();
    assert_eq!(
        encoder.encode(&publish("a", b"12345"), &mut buf),
        Err(EncodeError::PayloadTooLarge)
    );
    assert!(buf.is_empty());
}

#[test]
fn test_encoder_refuses_oversized_field_without_partial_output() {
    let frame = Frame::Sub(Subscribe {
        topic: Bytes::from_static(b"a"),
        subscription_id: Bytes::from_static(b"s"),
        queue_group: Some(Bytes::from(vec![b'q'; 256])),
    });
    let mut buf = BytesMut::from(&b"prefix"[..]);
    assert_eq!(
        Encoder::new().encode(&frame, &mut buf),
        Err(EncodeError::FieldTooLong("queue group"))
    );
    assert_eq!(&buf[..], b"prefix");
}

#[test]
fn test_decoder_direction_accessor() {
    assert_eq!(Decoder::server().direction(), Direction::Server);
    assert_eq!(Decoder::client().direction(), Direction::Client);
}

// ============================================================================
// Varint
// ============================================================================

mod varint_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::codec::{read_variable_int, variable_int_len, write_variable_int, MAX_VARINT};
    use test_case::test_case;

    #[test_case(0, &[0x00] ; "zero")]
    #[test_case(127, &[0x7F] ; "one byte max")]
    #[test_case(128, &[0x80, 0x01] ; "two byte min")]
    #[test_case(16_383, &[0xFF, 0x7F] ; "two byte max")]
    #[test_case(16_384, &[0x80, 0x80, 0x01] ; "three byte min")]
    #[test_case(2_097_151, &[0xFF, 0xFF, 0x7F] ; "three byte max")]
    #[test_case(2_097_152, &[0x80, 0x80, 0x80, 0x01] ; "four byte min")]
    #[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F] ; "four byte max")]
    fn test_boundaries(value: u32, expected: &[u8]) {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        assert_eq!(&buf[..], expected);
        assert_eq!(read_variable_int(expected), Ok((value, expected.len())));
    }

    #[test_case(&[0x80, 0x00] ; "zero in two bytes")]
    #[test_case(&[0xFF, 0x00] ; "127 in two bytes")]
    #[test_case(&[0x80, 0x80, 0x00] ; "zero in three bytes")]
    #[test_case(&[0x80, 0x80, 0x80, 0x00] ; "zero in four bytes")]
    fn test_overlong_rejected(bytes: &[u8]) {
        assert_eq!(read_variable_int(bytes), Err(DecodeError::MalformedVarint));
    }

    #[test]
    fn test_fifth_byte_rejected() {
        assert_eq!(
            read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(DecodeError::MalformedVarint)
        );
        // Rejected as soon as the fourth byte shows a continuation bit
        assert_eq!(
            read_variable_int(&[0x80, 0x80, 0x80, 0x80]),
            Err(DecodeError::MalformedVarint)
        );
    }

    #[test]
    fn test_incomplete_is_not_an_error() {
        assert_eq!(read_variable_int(&[]), Err(DecodeError::InsufficientData));
        assert_eq!(read_variable_int(&[0x80]), Err(DecodeError::InsufficientData));
        assert_eq!(
            read_variable_int(&[0x80, 0x80, 0x80]),
            Err(DecodeError::InsufficientData)
        );
    }

    #[test]
    fn test_write_over_max_rejected() {
        let mut buf = BytesMut::new();
        assert_eq!(
            write_variable_int(&mut buf, MAX_VARINT + 1),
            Err(EncodeError::VarintOverflow(MAX_VARINT as u64 + 1))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_remaining_length_in_stream() {
        assert_eq!(
            decode_server(&[0x30, 0x80, 0x00]),
            Err(DecodeError::MalformedVarint)
        );
        // Incomplete length is need-more-data
        assert_eq!(decode_server(&[0x30, 0x80]), Ok(None));
    }

    #[test]
    fn test_len_matches_written() {
        for value in [0, 1, 127, 128, 300, 16_383, 16_384, 2_097_152, MAX_VARINT] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            assert_eq!(written, variable_int_len(value));
        }
    }
}

// ============================================================================
// Property-Based Tests (using proptest)
// ============================================================================

mod proptest_tests {
    use super::*;
    use crate::codec::{read_variable_int, write_variable_int, MAX_VARINT};
    use proptest::prelude::*;

    fn topic_strategy() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,10}(/[a-z0-9]{1,10}){0,6}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_varint_roundtrip_is_minimal(value in 0u32..=MAX_VARINT) {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            prop_assert_eq!(value, decoded);
            prop_assert_eq!(written, consumed);
            let expected_len = if value < 128 { 1 }
                else if value < 16_384 { 2 }
                else if value < 2_097_152 { 3 }
                else { 4 };
            prop_assert_eq!(written, expected_len);
        }

        #[test]
        fn prop_publish_roundtrip(
            topic in topic_strategy(),
            reply_to in proptest::option::of(topic_strategy()),
            with_header in any::<bool>(),
            payload in prop::collection::vec(any::<u8>(), 0..2000),
        ) {
            let frame = Frame::Pub(Publish {
                topic: Bytes::from(topic),
                reply_to: reply_to.map(Bytes::from),
                header: with_header.then(sample_header),
                payload: Bytes::from(payload),
            });
            let mut buf = encode(&frame);
            let decoded = Decoder::server().decode(&mut buf).unwrap();
            prop_assert_eq!(Some(frame), decoded);
        }

        #[test]
        fn prop_split_point_does_not_matter(
            payload in prop::collection::vec(any::<u8>(), 0..500),
            split in 0usize..600,
        ) {
            let frame = Frame::Msg(Msg {
                topic: Bytes::from_static(b"a/b/c"),
                subscription_id: Bytes::from_static(b"sid"),
                reply_to: None,
                header: None,
                payload: Bytes::from(payload),
            });
            let encoded = encode(&frame);
            let split = split.min(encoded.len());

            let mut decoder = Decoder::client();
            let mut buf = BytesMut::from(&encoded[..split]);
            let first = decoder.decode(&mut buf).unwrap();
            let decoded = match first {
                Some(frame) => frame,
                None => {
                    buf.extend_from_slice(&encoded[split..]);
                    decoder.decode(&mut buf).unwrap().unwrap()
                }
            };
            prop_assert_eq!(frame, decoded);
        }

        #[test]
        fn prop_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let mut decoder = Decoder::server();
            let mut buf = BytesMut::from(&bytes[..]);
            while let Ok(Some(_)) = decoder.decode(&mut buf) {}
        }
    }
}
