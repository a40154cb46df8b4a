// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use quartz_codec::DecoderBufferMut;
use quartz_quic_core::{
    crypto::testing,
    inet::SocketAddress,
    packet::{encoder::seal_long_packet, encoder::LongHeader, number::PacketNumberSpace, PacketKind},
    random::testing::Generator,
    time::testing::now,
    varint::VarInt,
};

/// Accepts or rejects everything, by configuration
struct TestTokenFormat {
    accept: bool,
}

impl token::Format for TestTokenFormat {
    const TOKEN_LEN: usize = 8;

    fn generate_retry_token(
        &mut self,
        _now: Timestamp,
        _peer: &SocketAddress,
        _odcid: &[u8],
        output: &mut [u8],
    ) -> Option<usize> {
        output[..8].copy_from_slice(b"token!!!");
        Some(8)
    }

    fn generate_new_token(
        &mut self,
        _now: Timestamp,
        _peer: &SocketAddress,
        output: &mut [u8],
    ) -> Option<usize> {
        output[..8].copy_from_slice(b"newtoken");
        Some(8)
    }

    fn validate_token(
        &mut self,
        _now: Timestamp,
        _peer: &SocketAddress,
        _odcid: &[u8],
        _source: token::Source,
        _token: &[u8],
    ) -> token::Outcome {
        if self.accept {
            token::Outcome::Valid
        } else {
            token::Outcome::Invalid
        }
    }
}

fn master(use_retry: bool) -> Master<TestTokenFormat, testing::RetryKey> {
    let mut random = Generator::default();
    Master::new(
        Config {
            use_retry,
            worker_count: 2,
        },
        TestTokenFormat { accept: true },
        &mut random,
    )
}

fn addr() -> SocketAddress {
    "127.0.0.1:4433".parse().unwrap()
}

fn client_initial(token: &[u8], version: u32) -> Vec<u8> {
    let mut datagram = vec![0u8; 1400];
    let mut encoder = quartz_codec::EncoderBuffer::new(&mut datagram);
    let mut key = testing::Key::default();
    let len = seal_long_packet(
        &mut encoder,
        LongHeader {
            kind: PacketKind::Initial,
            version,
            destination_connection_id: &[1, 2, 3, 4, 5, 6, 7, 8],
            source_connection_id: &[9, 9, 9, 9, 9, 9, 9, 9],
            token,
        },
        PacketNumberSpace::Initial.new_packet_number(VarInt::ZERO),
        None,
        b"\x01crypto-ish payload",
        Some(1200),
        &mut key,
        &testing::HeaderKey,
    )
    .unwrap();
    datagram.truncate(len);
    datagram
}

#[test]
fn fresh_initial_is_accepted_and_routed() {
    let mut master = master(false);
    let mut datagram = client_initial(&[], 1);

    match master.on_datagram(now(0), &addr(), &mut datagram) {
        Disposition::Accept {
            original_destination_id,
            ..
        } => {
            assert_eq!(original_destination_id.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        }
        other => panic!("unexpected disposition {other:?}"),
    }

    // the follow-up datagram routes to the same worker
    let mut datagram = client_initial(&[], 1);
    assert!(matches!(
        master.on_datagram(now(1), &addr(), &mut datagram),
        Disposition::Route { .. }
    ));
}

#[test]
fn small_initial_datagrams_are_dropped() {
    let mut master = master(false);

    // craft an initial datagram without padding
    let mut datagram = vec![0u8; 1400];
    let mut encoder = quartz_codec::EncoderBuffer::new(&mut datagram);
    let mut key = testing::Key::default();
    let len = seal_long_packet(
        &mut encoder,
        LongHeader {
            kind: PacketKind::Initial,
            version: 1,
            destination_connection_id: &[1; 8],
            source_connection_id: &[2; 8],
            token: &[],
        },
        PacketNumberSpace::Initial.new_packet_number(VarInt::ZERO),
        None,
        b"small",
        None,
        &mut key,
        &testing::HeaderKey,
    )
    .unwrap();
    datagram.truncate(len);

    assert!(matches!(
        master.on_datagram(now(0), &addr(), &mut datagram),
        Disposition::Drop(_)
    ));
}

#[test]
fn unsupported_versions_get_version_negotiation() {
    let mut master = master(false);
    let mut datagram = client_initial(&[], 0x1a2a_3a4a);

    let mut response = match master.on_datagram(now(0), &addr(), &mut datagram) {
        Disposition::Transmit(response) => response,
        other => panic!("unexpected disposition {other:?}"),
    };

    let buffer = DecoderBufferMut::new(&mut response[..]);
    let (packet, _) = Packet::decode(buffer, id_manager::LOCAL_ID_LEN).unwrap();
    match packet {
        Packet::VersionNegotiation(vn) => {
            // addressed back using the client's SCID
            assert_eq!(vn.destination_connection_id(), &[9; 8]);
            assert_eq!(
                vn.supported_versions().collect::<Vec<_>>(),
                version::SUPPORTED_VERSIONS
            );
        }
        _ => panic!("expected a version negotiation packet"),
    }
}

#[test]
fn retry_is_sent_when_enabled() {
    let mut master = master(true);
    let mut datagram = client_initial(&[], 1);

    let response = match master.on_datagram(now(0), &addr(), &mut datagram) {
        Disposition::Transmit(response) => response,
        other => panic!("unexpected disposition {other:?}"),
    };

    let mut response = response;
    let buffer = DecoderBufferMut::new(&mut response[..]);
    let (packet, _) = Packet::decode(buffer, id_manager::LOCAL_ID_LEN).unwrap();
    match packet {
        Packet::Retry(retry) => {
            assert_eq!(retry.destination_connection_id(), &[9; 8]);
            assert_eq!(retry.retry_token(), b"token!!!");
        }
        _ => panic!("expected a retry packet"),
    }

    // an initial carrying the token is accepted
    let mut datagram = client_initial(b"token!!!", 1);
    assert!(matches!(
        master.on_datagram(now(1), &addr(), &mut datagram),
        Disposition::Accept { .. }
    ));
}

#[test]
fn invalid_tokens_are_dropped() {
    let mut random = Generator::default();
    let mut master: Master<TestTokenFormat, testing::RetryKey> = Master::new(
        Config {
            use_retry: true,
            worker_count: 1,
        },
        TestTokenFormat { accept: false },
        &mut random,
    );

    let mut datagram = client_initial(b"badtoken", 1);
    assert!(matches!(
        master.on_datagram(now(0), &addr(), &mut datagram),
        Disposition::Drop(_)
    ));
}

#[test]
fn unroutable_short_headers_get_stateless_resets() {
    let mut master = master(false);

    let mut datagram = vec![0u8; 100];
    datagram[0] = 0b0100_0000;
    datagram[1..9].copy_from_slice(&[7; 8]);

    let response = match master.on_datagram(now(0), &addr(), &mut datagram) {
        Disposition::Transmit(response) => response,
        other => panic!("unexpected disposition {other:?}"),
    };

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
    //# An endpoint MUST NOT send a Stateless Reset that is three times or
    //# more larger than the packet it receives
    assert!(response.len() < datagram.len());
    // the trailer is the token for the unroutable connection id
    let expected = derive_reset_token(&master.reset_token_key(), &[7; 8]);
    assert!(expected.matches_datagram(&response));
    // and it looks like a short-header packet
    assert_eq!(response[0] & 0b1100_0000, 0b0100_0000);
}

#[test]
fn tiny_datagrams_never_trigger_resets() {
    let mut master = master(false);
    let mut datagram = vec![0b0100_0000u8; stateless_reset::MIN_DATAGRAM_LEN];
    assert!(matches!(
        master.on_datagram(now(0), &addr(), &mut datagram),
        Disposition::Drop(_)
    ));
}
