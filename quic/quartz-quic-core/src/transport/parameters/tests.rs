// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::endpoint::Type::{Client, Server};
use quartz_codec::{DecoderBuffer, EncoderBuffer, EncoderValue as _};

fn round_trip(params: &TransportParameters, sender: crate::endpoint::Type) -> TransportParameters {
    let mut storage = [0u8; 1024];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode(params);
        encoder.len()
    };

    TransportParameters::decode(DecoderBuffer::new(&storage[..len]), sender).unwrap()
}

fn cid(bytes: &[u8]) -> UnboundedId {
    UnboundedId::try_from_bytes(bytes).unwrap()
}

#[test]
fn defaults_encode_to_nothing() {
    let params = TransportParameters::default();
    assert_eq!(params.encoding_size(), 0);
    assert_eq!(round_trip(&params, Client), params);
}

#[test]
fn client_parameters_round_trip() {
    let params = TransportParameters {
        max_idle_timeout: VarInt::from_u32(30_000),
        initial_max_data: VarInt::from_u32(1 << 20),
        initial_max_stream_data_bidi_local: VarInt::from_u32(65_536),
        initial_max_stream_data_bidi_remote: VarInt::from_u32(65_536),
        initial_max_stream_data_uni: VarInt::from_u32(32_768),
        initial_max_streams_bidi: VarInt::from_u8(100),
        initial_max_streams_uni: VarInt::from_u8(3),
        ack_delay_exponent: 2,
        max_ack_delay: VarInt::from_u8(20),
        disable_active_migration: true,
        active_connection_id_limit: VarInt::from_u8(4),
        initial_source_connection_id: Some(cid(&[1, 2, 3, 4])),
        ..Default::default()
    };

    assert_eq!(round_trip(&params, Client), params);
}

#[test]
fn server_parameters_round_trip() {
    let params = TransportParameters {
        original_destination_connection_id: Some(cid(&[9; 8])),
        stateless_reset_token: Some([0xab; 16]),
        retry_source_connection_id: Some(cid(&[7; 8])),
        preferred_address: Some(PreferredAddress {
            ipv4: Some((Ipv4Addr::new(192, 0, 2, 1), 443)),
            ipv6: None,
            connection_id: cid(&[3; 8]),
            stateless_reset_token: [0x11; 16],
        }),
        initial_max_data: VarInt::from_u32(1 << 16),
        initial_source_connection_id: Some(cid(&[8; 8])),
        ..Default::default()
    };

    assert_eq!(round_trip(&params, Server), params);
}

#[test]
fn server_only_parameters_are_rejected_from_clients() {
    let params = TransportParameters {
        original_destination_connection_id: Some(cid(&[9; 8])),
        ..Default::default()
    };

    let mut storage = [0u8; 256];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode(&params);
        encoder.len()
    };

    let error =
        TransportParameters::decode(DecoderBuffer::new(&storage[..len]), Client).unwrap_err();
    assert_eq!(error.code, Error::TRANSPORT_PARAMETER_ERROR.code);
}

#[test]
fn duplicates_are_rejected() {
    let mut storage = [0u8; 64];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        // initial_max_data twice
        encoder.encode(&VarInt::from_u8(0x04));
        encoder.encode(&VarInt::from_u8(1));
        encoder.encode(&VarInt::from_u8(7));
        encoder.encode(&VarInt::from_u8(0x04));
        encoder.encode(&VarInt::from_u8(1));
        encoder.encode(&VarInt::from_u8(7));
        encoder.len()
    };

    assert!(TransportParameters::decode(DecoderBuffer::new(&storage[..len]), Client).is_err());
}

#[test]
fn unknown_parameters_are_ignored() {
    let mut storage = [0u8; 64];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut storage);
        // a greased parameter id
        encoder.encode(&VarInt::from_u32(0x1b66));
        encoder.encode(&VarInt::from_u8(3));
        encoder.write_repeated(3, 0xff);
        // followed by a real one
        encoder.encode(&VarInt::from_u8(0x04));
        encoder.encode(&VarInt::from_u8(1));
        encoder.encode(&VarInt::from_u8(7));
        encoder.len()
    };

    let params =
        TransportParameters::decode(DecoderBuffer::new(&storage[..len]), Client).unwrap();
    assert_eq!(params.initial_max_data.as_u64(), 7);
}

#[test]
fn invalid_values_are_rejected() {
    for (id, value) in [
        // ack_delay_exponent above 20
        (0x0au8, 21u64),
        // max_ack_delay at 2^14
        (0x0b, 1 << 14),
        // max_udp_payload_size below 1200
        (0x03, 1199),
        // active_connection_id_limit below 2
        (0x0e, 1),
    ] {
        let mut storage = [0u8; 32];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut storage);
            let value = VarInt::new(value).unwrap();
            encoder.encode(&VarInt::from_u8(id));
            encoder.encode(&VarInt::new(value.encoding_size() as u64).unwrap());
            encoder.encode(&value);
            encoder.len()
        };

        assert!(
            TransportParameters::decode(DecoderBuffer::new(&storage[..len]), Client).is_err(),
            "id {id:#x} value should be rejected"
        );
    }
}
