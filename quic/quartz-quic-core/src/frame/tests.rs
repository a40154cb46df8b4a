// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{stream::StreamType, varint::VarInt};
use quartz_codec::{DecoderBuffer, EncoderBuffer};

fn round_trip(frame: Frame) {
    let mut storage = [0u8; 1500];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode(&frame);
        encoder.len()
    };

    let buffer = DecoderBuffer::new(&storage[..len]);
    let (decoded, remaining) = Frame::decode(buffer).unwrap();
    assert!(remaining.is_empty());
    assert_eq!(decoded, frame);
    assert_eq!(decoded.tag(), frame.tag());
}

#[test]
fn simple_frames_round_trip() {
    round_trip(Ping.into());
    round_trip(HandshakeDone.into());
    round_trip(
        ResetStream {
            stream_id: VarInt::from_u8(4),
            application_error_code: VarInt::from_u16(0x100),
            final_size: VarInt::from_u32(123_456),
        }
        .into(),
    );
    round_trip(
        StopSending {
            stream_id: VarInt::from_u8(4),
            application_error_code: VarInt::from_u8(7),
        }
        .into(),
    );
    round_trip(
        MaxData {
            maximum_data: VarInt::from_u32(1 << 20),
        }
        .into(),
    );
    round_trip(
        MaxStreamData {
            stream_id: VarInt::from_u8(8),
            maximum_stream_data: VarInt::from_u32(65_536),
        }
        .into(),
    );
    round_trip(
        DataBlocked {
            data_limit: VarInt::from_u32(4096),
        }
        .into(),
    );
    round_trip(
        StreamDataBlocked {
            stream_id: VarInt::from_u8(12),
            stream_data_limit: VarInt::from_u32(2048),
        }
        .into(),
    );
    round_trip(
        RetireConnectionId {
            sequence_number: VarInt::from_u8(3),
        }
        .into(),
    );
}

#[test]
fn stream_limit_frames_round_trip() {
    for stream_type in [StreamType::Bidirectional, StreamType::Unidirectional] {
        round_trip(
            MaxStreams {
                stream_type,
                maximum_streams: VarInt::from_u16(100),
            }
            .into(),
        );
        round_trip(
            StreamsBlocked {
                stream_type,
                stream_limit: VarInt::from_u16(100),
            }
            .into(),
        );
    }
}

#[test]
fn padding_aggregates_consecutive_bytes() {
    let bytes = [0u8; 37];
    let buffer = DecoderBuffer::new(&bytes);
    let (frame, remaining) = Frame::decode(buffer).unwrap();
    assert!(remaining.is_empty());
    assert_eq!(frame, Frame::Padding(Padding { length: 37 }));
    round_trip(frame);
}

#[test]
fn path_frames_round_trip() {
    let data = [1, 2, 3, 4, 5, 6, 7, 8];
    round_trip(PathChallenge { data }.into());
    round_trip(PathResponse { data }.into());
}

#[test]
fn crypto_round_trip() {
    round_trip(
        Crypto {
            offset: VarInt::from_u16(1200),
            data: b"client hello fragment",
        }
        .into(),
    );
}

#[test]
fn stream_round_trip() {
    for (offset, is_fin, is_last_frame) in [
        (VarInt::ZERO, false, false),
        (VarInt::from_u16(512), true, false),
        (VarInt::from_u16(512), false, true),
    ] {
        round_trip(
            Stream {
                stream_id: VarInt::from_u8(0),
                offset,
                is_last_frame,
                is_fin,
                data: b"the quick brown fox",
            }
            .into(),
        );
    }
}

#[test]
fn new_token_round_trip() {
    round_trip(NewToken { token: &[42; 40] }.into());

    // empty tokens are a FRAME_ENCODING_ERROR
    let bytes = [0x07u8, 0x00];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
}

#[test]
fn new_connection_id_round_trip() {
    round_trip(
        NewConnectionId {
            sequence_number: VarInt::from_u8(7),
            retire_prior_to: VarInt::from_u8(3),
            connection_id: &[0xab; 8],
            stateless_reset_token: &[0xcd; 16],
        }
        .into(),
    );

    // retire_prior_to > sequence_number is a FRAME_ENCODING_ERROR
    let mut storage = [0u8; 64];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode(&0x18u8);
        encoder.encode(&VarInt::from_u8(1));
        encoder.encode(&VarInt::from_u8(2));
        encoder.encode_with_len_prefix::<u8, _>(&&[0u8; 8][..]);
        encoder.write_repeated(16, 0);
        encoder.len()
    };
    assert!(Frame::decode(DecoderBuffer::new(&storage[..len])).is_err());
}

#[test]
fn connection_close_round_trip() {
    round_trip(
        ConnectionClose {
            error_code: VarInt::from_u8(0x0a),
            frame_type: Some(VarInt::from_u8(0x06)),
            reason: Some(b"tls alert"),
        }
        .into(),
    );
    round_trip(
        ConnectionClose {
            error_code: VarInt::from_u16(0x101),
            frame_type: None,
            reason: None,
        }
        .into(),
    );
}

#[test]
fn unknown_frame_types_are_rejected() {
    for tag in [0x1fu8, 0x21, 0x40, 0xff] {
        let bytes = [tag, 0, 0, 0];
        assert!(
            Frame::decode(DecoderBuffer::new(&bytes)).is_err(),
            "tag {tag:#x} should be rejected"
        );
    }
}

#[test]
fn truncated_frames_are_rejected() {
    // RESET_STREAM missing its final size
    let bytes = [0x04u8, 4, 7];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
}

#[test]
fn elicitation_classification() {
    assert!(!Frame::from(Padding { length: 1 }).ack_elicitation().is_ack_eliciting());
    assert!(Frame::from(Ping).ack_elicitation().is_ack_eliciting());
    assert!(Frame::from(Ping).is_allowed_in(crate::crypto::Level::Initial));
    assert!(!Frame::from(HandshakeDone).is_allowed_in(crate::crypto::Level::Initial));

    let probing = Frame::from(PathChallenge { data: [0; 8] });
    assert!(probing.is_probing());
    assert!(!Frame::from(Ping).is_probing());
}
