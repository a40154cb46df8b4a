// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use bolero::check;
use quartz_codec::{DecoderBuffer, EncoderBuffer};

fn round_trip(value: VarInt) {
    let mut storage = [0u8; 8];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode(&value);
        encoder.len()
    };
    assert_eq!(len, value.encoding_size());

    let buffer = DecoderBuffer::new(&storage[..len]);
    let (decoded, remaining) = buffer.decode::<VarInt>().unwrap();
    assert!(remaining.is_empty());
    assert_eq!(decoded, value);
}

#[test]
fn round_trip_test() {
    check!().with_type::<u64>().for_each(|value| {
        if let Ok(value) = VarInt::new(*value) {
            round_trip(value);
        } else {
            assert!(*value > MAX_VARINT_VALUE);
        }
    });
}

#[test]
fn encoding_size_boundaries() {
    for (value, size) in [
        (0u64, 1),
        (63, 1),
        (64, 2),
        (16_383, 2),
        (16_384, 4),
        (1_073_741_823, 4),
        (1_073_741_824, 8),
        (MAX_VARINT_VALUE, 8),
    ] {
        assert_eq!(VarInt::new(value).unwrap().encoding_size(), size, "{value}");
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.1
//# For example, the eight-byte sequence 0xc2197c5eff14e88c decodes to
//# the decimal value 151,288,809,941,952,652; the four-byte sequence
//# 0x9d7f3e7d decodes to 494,878,333; the two-byte sequence 0x7bbd
//# decodes to 15,293; and the single byte 0x25 decodes to 37.
#[test]
fn rfc_examples() {
    for (bytes, expected) in [
        (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..], 151_288_809_941_952_652u64),
        (&[0x9d, 0x7f, 0x3e, 0x7d][..], 494_878_333),
        (&[0x7b, 0xbd][..], 15_293),
        (&[0x25][..], 37),
    ] {
        let (value, remaining) = DecoderBuffer::new(bytes).decode::<VarInt>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(value.as_u64(), expected);
        round_trip(value);
    }
}

#[test]
fn rejects_out_of_range() {
    assert!(VarInt::new(MAX_VARINT_VALUE).is_ok());
    assert!(VarInt::new(MAX_VARINT_VALUE + 1).is_err());
}

#[test]
fn checked_arithmetic() {
    let max = VarInt::MAX;
    assert_eq!(max.checked_add(VarInt::from_u8(1)), None);
    assert_eq!(max.saturating_add(VarInt::from_u8(1)), VarInt::MAX);
    assert_eq!(VarInt::ZERO.checked_sub(VarInt::from_u8(1)), None);
    assert_eq!(VarInt::ZERO.saturating_sub(VarInt::from_u8(1)), VarInt::ZERO);
}
