// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{encoder::*, *};
use crate::{
    crypto::testing,
    packet::{number::PacketNumberSpace, version::QUIC_VERSION_1},
    varint::VarInt,
};
use quartz_codec::{Encoder, EncoderBuffer};

fn pn(space: PacketNumberSpace, value: u32) -> PacketNumber {
    space.new_packet_number(VarInt::from_u32(value))
}

fn seal_initial(encoder: &mut EncoderBuffer, payload: &[u8], pad_to: Option<usize>) -> usize {
    let mut key = testing::Key::default();
    seal_long_packet(
        encoder,
        LongHeader {
            kind: PacketKind::Initial,
            version: QUIC_VERSION_1,
            destination_connection_id: &[1, 2, 3, 4, 5, 6, 7, 8],
            source_connection_id: &[9, 10],
            token: &[0xaa; 24],
        },
        pn(PacketNumberSpace::Initial, 7),
        None,
        payload,
        pad_to,
        &mut key,
        &testing::HeaderKey,
    )
    .unwrap()
}

#[test]
fn long_packet_round_trip() {
    let payload = b"\x01\x01\x01\x01 frame bytes \x01\x01\x01\x01";
    let mut storage = [0u8; 1500];
    let mut encoder = EncoderBuffer::new(&mut storage);
    let packet_len = seal_initial(&mut encoder, payload, None);
    let datagram_len = encoder.len();
    assert_eq!(packet_len, datagram_len);

    let buffer = quartz_codec::DecoderBufferMut::new(&mut storage[..datagram_len]);
    let (packet, remaining) = Packet::decode(buffer, 0).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::Protected(packet) => packet,
        _ => panic!("expected a protected packet"),
    };

    assert_eq!(packet.kind(), PacketKind::Initial);
    assert_eq!(packet.version(), QUIC_VERSION_1);
    assert_eq!(packet.destination_connection_id(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(packet.source_connection_id(), &[9, 10]);
    assert_eq!(packet.token(), &[0xaa; 24]);

    let encrypted = packet.unprotect(&testing::HeaderKey, None).unwrap();
    assert_eq!(encrypted.packet_number(), pn(PacketNumberSpace::Initial, 7));

    let cleartext = encrypted.decrypt(&testing::Key::default()).unwrap();
    assert!(cleartext.payload().starts_with(payload));
    // anything past the payload is padding for the header protection sample
    assert!(cleartext.payload()[payload.len()..].iter().all(|&b| b == 0));
}

#[test]
fn coalesced_packets_split() {
    let mut storage = [0u8; 1500];
    let mut encoder = EncoderBuffer::new(&mut storage);

    let first_len = seal_initial(&mut encoder, b"initial payload bytes here", None);

    let mut key = testing::Key::default();
    let second_len = seal_long_packet(
        &mut encoder,
        LongHeader {
            kind: PacketKind::Handshake,
            version: QUIC_VERSION_1,
            destination_connection_id: &[1, 2, 3, 4, 5, 6, 7, 8],
            source_connection_id: &[9, 10],
            token: &[],
        },
        pn(PacketNumberSpace::Handshake, 0),
        None,
        b"handshake payload bytes here",
        None,
        &mut key,
        &testing::HeaderKey,
    )
    .unwrap();

    let datagram_len = encoder.len();
    assert_eq!(datagram_len, first_len + second_len);

    let buffer = quartz_codec::DecoderBufferMut::new(&mut storage[..datagram_len]);
    let (first, remaining) = Packet::decode(buffer, 0).unwrap();
    match first {
        Packet::Protected(packet) => assert_eq!(packet.kind(), PacketKind::Initial),
        _ => panic!("expected initial"),
    }

    let (second, remaining) = Packet::decode(remaining, 0).unwrap();
    assert!(remaining.is_empty());
    match second {
        Packet::Protected(packet) => assert_eq!(packet.kind(), PacketKind::Handshake),
        _ => panic!("expected handshake"),
    }
}

#[test]
fn short_packet_round_trip() {
    let dcid = [7u8; 8];
    let payload = b"one rtt application data";
    let mut storage = [0u8; 1500];

    let datagram_len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        let mut key = testing::Key::default();
        seal_short_packet(
            &mut encoder,
            ShortHeader {
                destination_connection_id: &dcid,
                spin_bit: false,
                key_phase: KeyPhase::One,
            },
            pn(PacketNumberSpace::ApplicationData, 42),
            None,
            payload,
            &mut key,
            &testing::HeaderKey,
        )
        .unwrap()
    };

    let buffer = quartz_codec::DecoderBufferMut::new(&mut storage[..datagram_len]);
    let (packet, remaining) = Packet::decode(buffer, dcid.len()).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::Protected(packet) => packet,
        _ => panic!("expected a protected packet"),
    };
    assert_eq!(packet.kind(), PacketKind::OneRtt);
    assert_eq!(packet.destination_connection_id(), &dcid);

    let encrypted = packet.unprotect(&testing::HeaderKey, None).unwrap();
    assert_eq!(
        encrypted.packet_number(),
        pn(PacketNumberSpace::ApplicationData, 42)
    );
    assert_eq!(encrypted.key_phase(), KeyPhase::One);

    let cleartext = encrypted.decrypt(&testing::Key::default()).unwrap();
    assert!(cleartext.payload().starts_with(payload));
}

#[test]
fn client_initial_padding_reaches_1200() {
    let mut storage = [0u8; 1500];
    let mut encoder = EncoderBuffer::new(&mut storage);
    let packet_len = seal_initial(&mut encoder, b"tiny", Some(1200));
    assert_eq!(packet_len, 1200);
}

#[test]
fn version_negotiation_round_trip() {
    let mut storage = [0u8; 128];
    let datagram_len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encode_version_negotiation(&mut encoder, &[1, 2, 3], &[4, 5, 6, 7], &[QUIC_VERSION_1]);
        encoder.len()
    };

    let buffer = quartz_codec::DecoderBufferMut::new(&mut storage[..datagram_len]);
    let (packet, remaining) = Packet::decode(buffer, 0).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::VersionNegotiation(packet) => packet,
        _ => panic!("expected version negotiation"),
    };
    assert_eq!(packet.destination_connection_id(), &[1, 2, 3]);
    assert_eq!(packet.source_connection_id(), &[4, 5, 6, 7]);
    assert_eq!(
        packet.supported_versions().collect::<Vec<_>>(),
        [QUIC_VERSION_1]
    );
}

#[test]
fn retry_round_trip() {
    let mut storage = [0u8; 256];
    let datagram_len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encode_retry::<testing::RetryKey>(
            &mut encoder,
            QUIC_VERSION_1,
            &[1, 2, 3, 4],
            &[5, 6, 7, 8],
            &[9, 10, 11, 12],
            b"retry token bytes",
        );
        encoder.len()
    };

    let buffer = quartz_codec::DecoderBufferMut::new(&mut storage[..datagram_len]);
    let (packet, remaining) = Packet::decode(buffer, 0).unwrap();
    assert!(remaining.is_empty());

    let packet = match packet {
        Packet::Retry(packet) => packet,
        _ => panic!("expected retry"),
    };
    assert_eq!(packet.destination_connection_id(), &[1, 2, 3, 4]);
    assert_eq!(packet.source_connection_id(), &[5, 6, 7, 8]);
    assert_eq!(packet.retry_token(), b"retry token bytes");
    assert_eq!(packet.integrity_tag().len(), 16);
}

#[test]
fn truncated_datagram_is_rejected() {
    let mut storage = [0u8; 1500];
    let datagram_len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        seal_initial(&mut encoder, b"payload for truncation test", None)
    };

    // cut the datagram short of the advertised length field
    let truncated_len = datagram_len - 5;
    let buffer = quartz_codec::DecoderBufferMut::new(&mut storage[..truncated_len]);
    assert!(Packet::decode(buffer, 0).is_err());
}
