// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-level behavior, driven with null crypto and a scripted
//! TLS session so every state transition is observable.

use super::*;
use crate::space::InitialSpace;
use bytes::Bytes;
use quartz_codec::EncoderBuffer;
use quartz_quic_core::{
    ack,
    connection::id::{InitialId, LocalId},
    crypto::{
        testing,
        tls::testing::{Session, Step},
        tls::EarlyDataStatus,
    },
    endpoint::Type::{Client, Server},
    packet::{
        encoder::{seal_long_packet, seal_short_packet, LongHeader, ShortHeader},
        number::PacketNumberSpace,
        KeyPhase, PacketKind,
    },
    random::testing::Generator,
    time::testing::now,
};

const CLIENT_SCID: [u8; 8] = [9; 8];
const SERVER_LOCAL_ID: [u8; 8] = [5; 8];
const ODCID: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

const ECN: ExplicitCongestionNotification = ExplicitCongestionNotification::NotEct;

fn addr(port: u16) -> SocketAddress {
    SocketAddress::new("127.0.0.1".parse().unwrap(), port)
}

fn peer_params_for_server() -> Vec<u8> {
    let params = TransportParameters {
        initial_source_connection_id: Some(
            quartz_quic_core::connection::id::UnboundedId::try_from_bytes(&CLIENT_SCID).unwrap(),
        ),
        initial_max_data: VarInt::from_u32(1 << 20),
        initial_max_streams_bidi: VarInt::from_u8(16),
        initial_max_stream_data_bidi_local: VarInt::from_u32(1 << 16),
        initial_max_stream_data_bidi_remote: VarInt::from_u32(1 << 16),
        initial_max_stream_data_uni: VarInt::from_u32(1 << 16),
        ..Default::default()
    };
    quartz_codec::EncoderValue::encode_to_vec(&params)
}

fn connection(
    role: quartz_quic_core::endpoint::Type,
    steps: Vec<Step>,
    path_validated: bool,
) -> Connection<Session> {
    let (local_id, remote_id, odcid) = match role {
        Server => (
            LocalId::try_from_bytes(&SERVER_LOCAL_ID).unwrap(),
            PeerId::try_from_bytes(&[]).unwrap(),
            Some(InitialId::try_from_bytes(&ODCID).unwrap()),
        ),
        Client => (
            LocalId::try_from_bytes(&CLIENT_SCID).unwrap(),
            PeerId::try_from_bytes(&ODCID).unwrap(),
            Some(InitialId::try_from_bytes(&ODCID).unwrap()),
        ),
    };

    let initial_space = InitialSpace::new(
        testing::Key::default(),
        testing::HeaderKey,
        ack::Settings::default(),
    );

    Connection::new(
        role,
        Limits::default(),
        Session::with_steps(steps),
        initial_space,
        local_id,
        remote_id,
        addr(9000),
        path_validated,
        Box::new(Generator::default()),
        odcid,
        now(0),
    )
}

/// A client Initial datagram carrying one CRYPTO frame
fn client_initial_datagram() -> Vec<u8> {
    let mut payload = vec![0u8; 64];
    let payload_len = {
        let mut encoder = EncoderBuffer::new(&mut payload);
        quartz_codec::Encoder::encode(
            &mut encoder,
            &frame::Crypto {
                offset: VarInt::ZERO,
                data: b"client hello",
            },
        );
        quartz_codec::Encoder::len(&encoder)
    };
    payload.truncate(payload_len);

    let mut datagram = vec![0u8; 1400];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    let mut key = testing::Key::default();
    let len = seal_long_packet(
        &mut encoder,
        LongHeader {
            kind: PacketKind::Initial,
            version: quartz_quic_core::packet::version::QUIC_VERSION_1,
            destination_connection_id: &ODCID,
            source_connection_id: &CLIENT_SCID,
            token: &[],
        },
        PacketNumberSpace::Initial.new_packet_number(VarInt::ZERO),
        None,
        &payload,
        Some(1200),
        &mut key,
        &testing::HeaderKey,
    )
    .unwrap();
    datagram.truncate(len);
    datagram
}

fn confirmed_server() -> Connection<Session> {
    let mut server = connection(
        Server,
        vec![
            Step::HandshakeKeys,
            Step::SendHandshake(Bytes::from_static(b"server hello + finished")),
            Step::OneRttKeys {
                transport_parameters: peer_params_for_server(),
            },
            Step::Alpn(Bytes::from_static(b"h3")),
            Step::Complete,
        ],
        false,
    );

    let mut datagram = client_initial_datagram();
    server
        .on_datagram(now(1000), addr(9000), ECN, &mut datagram)
        .unwrap();
    server
}

#[test]
fn client_first_flight_is_a_padded_initial() {
    let mut client = connection(
        Client,
        vec![Step::SendInitial(Bytes::from_static(b"client hello"))],
        true,
    );
    client.drive_tls(now(0)).unwrap();

    let outgoing = client.transmit(now(0)).expect("first flight");
    //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
    //# a client MUST expand the payload of all UDP datagrams carrying
    //# Initial packets to at least the smallest allowed maximum datagram
    //# size of 1200 bytes
    assert!(outgoing.payload.len() >= 1200);

    let mut payload = outgoing.payload;
    let (packet, _) =
        Packet::decode(quartz_codec::DecoderBufferMut::new(&mut payload), 8).unwrap();
    let packet = match packet {
        Packet::Protected(packet) => packet,
        _ => panic!("expected a protected packet"),
    };
    assert_eq!(packet.kind(), PacketKind::Initial);
    assert_eq!(packet.destination_connection_id(), &ODCID);
    assert_eq!(packet.source_connection_id(), &CLIENT_SCID);
}

#[test]
fn server_confirms_the_handshake_and_queues_handshake_done() {
    let mut server = confirmed_server();

    assert!(server.is_handshake_confirmed());
    assert_eq!(server.state(), State::Connected);
    assert_eq!(server.alpn().map(|alpn| alpn.as_ref()), Some(&b"h3"[..]));

    // initial and handshake spaces are gone once confirmed
    assert!(server.initial.is_none());
    assert!(server.handshake.is_none());

    let events: Vec<Event> = core::iter::from_fn(|| server.poll_event()).collect();
    assert!(events.contains(&Event::HandshakeDone));

    // the first application flight carries HANDSHAKE_DONE
    assert!(server
        .application
        .as_ref()
        .is_some_and(|space| space.handshake_done_pending));
    let outgoing = server.transmit(now(2000)).expect("server flight");
    assert!(!outgoing.payload.is_empty());
    assert!(!server
        .application
        .as_ref()
        .is_some_and(|space| space.handshake_done_pending));
}

#[test]
fn server_learns_the_client_connection_id() {
    let server = confirmed_server();
    assert_eq!(server.cids.active_remote_id().as_bytes(), &CLIENT_SCID);
}

#[test]
fn stream_data_is_delivered_and_acknowledged() {
    let mut server = confirmed_server();
    // flush the handshake-done flight
    let _ = server.transmit(now(2000));

    // a client 1-RTT packet opening stream 0 with data
    let mut payload = vec![0u8; 128];
    let payload_len = {
        let mut encoder = EncoderBuffer::new(&mut payload);
        quartz_codec::Encoder::encode(
            &mut encoder,
            &frame::Stream {
                stream_id: VarInt::ZERO,
                offset: VarInt::ZERO,
                is_last_frame: false,
                is_fin: true,
                data: b"hello quic",
            },
        );
        quartz_codec::Encoder::len(&encoder)
    };
    payload.truncate(payload_len);

    let mut datagram = vec![0u8; 256];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    let mut key = testing::Key::default();
    let len = seal_short_packet(
        &mut encoder,
        ShortHeader {
            destination_connection_id: &SERVER_LOCAL_ID,
            spin_bit: false,
            key_phase: KeyPhase::Zero,
        },
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::ZERO),
        None,
        &payload,
        &mut key,
        &testing::HeaderKey,
    )
    .unwrap();
    datagram.truncate(len);

    server
        .on_datagram(now(3000), addr(9000), ECN, &mut datagram)
        .unwrap();

    let opened = server.poll_event();
    let id = match opened {
        Some(Event::StreamOpened(id)) => id,
        other => panic!("expected a stream-opened event, got {other:?}"),
    };

    let mut buf = [0u8; 32];
    match server.stream_recv(id, &mut buf).unwrap() {
        ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"hello quic"),
        other => panic!("unexpected read outcome {other:?}"),
    }
    assert!(matches!(
        server.stream_recv(id, &mut buf).unwrap(),
        ReadOutcome::Finished
    ));

    // once the ack delay elapses, an ACK-only flight goes out
    assert!(server.transmit(now(3100)).is_none());
    let outgoing = server.transmit(now(40_000)).expect("ack flight");
    assert!(!outgoing.payload.is_empty());
}

#[test]
fn graceful_close_round_trip() {
    let mut client = connection(
        Client,
        vec![Step::SendInitial(Bytes::from_static(b"ch"))],
        true,
    );
    client.drive_tls(now(0)).unwrap();
    let _ = client.transmit(now(0));

    client.close(VarInt::ZERO, now(1000));
    assert_eq!(client.state(), State::Closing);

    let close_datagram = client.transmit(now(1000)).expect("close packet");

    // the peer enters draining on receipt and never sends again
    let mut server = connection(Server, vec![], false);
    let mut payload = close_datagram.payload;
    server
        .on_datagram(now(2000), addr(9000), ECN, &mut payload)
        .unwrap();
    assert_eq!(server.state(), State::Draining);
    assert!(server.transmit(now(2100)).is_none());

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
    //# These states SHOULD persist for at least three times the current
    //# PTO interval
    let late = now(20_000_000);
    client.on_timeout(late);
    server.on_timeout(late);
    assert_eq!(client.state(), State::Closed);
    assert_eq!(server.state(), State::Closed);

    let client_events: Vec<Event> = core::iter::from_fn(|| client.poll_event()).collect();
    assert!(client_events.contains(&Event::ConnectionClosed(connection::Error::Closed)));
    // the client's graceful close was converted to 0x1c/APPLICATION_ERROR
    // for the Initial packet, so the server reports a transport error
    let server_events: Vec<Event> = core::iter::from_fn(|| server.poll_event()).collect();
    assert!(server_events
        .iter()
        .any(|event| matches!(event, Event::ConnectionClosed(_))));
}

#[test]
fn closing_answers_at_most_once_per_pto() {
    let mut client = connection(
        Client,
        vec![Step::SendInitial(Bytes::from_static(b"ch"))],
        true,
    );
    client.drive_tls(now(0)).unwrap();
    client.close(VarInt::ZERO, now(0));

    assert!(client.transmit(now(0)).is_some());
    // nothing more to send until a packet arrives
    assert!(client.transmit(now(1)).is_none());

    // an incoming packet within the same PTO does not produce a close
    let mut datagram = client_initial_datagram();
    let _ = client.on_datagram(now(100), addr(9000), ECN, &mut datagram);
    assert!(client.transmit(now(200)).is_none());

    // after a PTO it does
    let pto_us = client.current_pto().as_micros() as u64;
    assert!(client.transmit(now(pto_us + 200)).is_some());
}

#[test]
fn idle_timeout_closes_silently() {
    let mut server = confirmed_server();
    let idle = Limits::default().max_idle_timeout.as_micros() as u64;

    server.on_timeout(now(idle + 10_000));
    assert_eq!(server.state(), State::Closed);

    let events: Vec<Event> = core::iter::from_fn(|| server.poll_event()).collect();
    assert!(events.contains(&Event::ConnectionClosed(connection::Error::IdleTimeout)));
}

#[test]
fn unvalidated_server_is_amplification_limited() {
    // the handshake intentionally never completes so the 4KB of queued
    // handshake data keeps pressing against the amplification budget
    let mut server = connection(
        Server,
        vec![
            Step::HandshakeKeys,
            Step::SendHandshake(Bytes::from_static(&[0u8; 4000])),
        ],
        false,
    );

    let mut datagram = client_initial_datagram();
    let received = datagram.len() as u64;
    server
        .on_datagram(now(1000), addr(9000), ECN, &mut datagram)
        .unwrap();

    // 4KB of handshake data is queued but only 3x the received bytes
    // may leave before the address validates
    let mut sent = 0u64;
    while let Some(outgoing) = server.transmit(now(2000)) {
        sent += outgoing.payload.len() as u64;
        assert!(sent <= 3 * received, "sent {sent} of {received} received");
    }
    assert!(sent > 0);
}

fn remembered_server_params() -> Vec<u8> {
    let params = TransportParameters {
        initial_max_data: VarInt::from_u32(1 << 20),
        initial_max_streams_bidi: VarInt::from_u8(16),
        initial_max_stream_data_bidi_remote: VarInt::from_u32(1 << 16),
        initial_source_connection_id: Some(
            quartz_quic_core::connection::id::UnboundedId::try_from_bytes(&ODCID).unwrap(),
        ),
        original_destination_connection_id: Some(
            quartz_quic_core::connection::id::UnboundedId::try_from_bytes(&ODCID).unwrap(),
        ),
        ..Default::default()
    };
    quartz_codec::EncoderValue::encode_to_vec(&params)
}

#[test]
fn zero_rtt_stream_data_rides_the_first_flight() {
    let mut client = connection(
        Client,
        vec![
            Step::SendInitial(Bytes::from_static(b"client hello + early data")),
            Step::ZeroRttKeys {
                transport_parameters: remembered_server_params(),
            },
            Step::EarlyData(EarlyDataStatus::Offered),
        ],
        true,
    );
    client.drive_tls(now(0)).unwrap();

    // a stream created before handshake completion
    let id = client
        .open_stream(quartz_quic_core::stream::StreamType::Bidirectional)
        .expect("remembered limits allow a stream");
    assert_eq!(client.stream_send(id, b"hello 0rtt").unwrap(), 10);

    let outgoing = client.transmit(now(0)).expect("first flight");
    assert!(outgoing.payload.len() >= 1200);

    // the datagram coalesces an Initial and a 0-RTT packet
    let mut payload = outgoing.payload;
    let buffer = quartz_codec::DecoderBufferMut::new(&mut payload);
    let (first, remaining) = Packet::decode(buffer, 8).unwrap();
    match first {
        Packet::Protected(packet) => assert_eq!(packet.kind(), PacketKind::Initial),
        _ => panic!("expected the initial packet first"),
    }
    let (second, _) = Packet::decode(remaining, 8).unwrap();
    match second {
        Packet::Protected(packet) => assert_eq!(packet.kind(), PacketKind::ZeroRtt),
        _ => panic!("expected a coalesced 0-RTT packet"),
    }
}

#[test]
fn rejected_zero_rtt_data_is_requeued_for_one_rtt() {
    let mut client = connection(
        Client,
        vec![
            Step::SendInitial(Bytes::from_static(b"client hello + early data")),
            Step::ZeroRttKeys {
                transport_parameters: remembered_server_params(),
            },
        ],
        true,
    );
    client.drive_tls(now(0)).unwrap();

    let id = client
        .open_stream(quartz_quic_core::stream::StreamType::Bidirectional)
        .unwrap();
    client.stream_send(id, b"hello 0rtt").unwrap();
    let _ = client.transmit(now(0)).expect("first flight with 0-RTT");

    // the server rejects early data and installs 1-RTT keys
    client.tls.push(Step::EarlyData(EarlyDataStatus::Rejected));
    client.tls.push(Step::OneRttKeys {
        transport_parameters: remembered_server_params(),
    });
    client.drive_tls(now(1000)).unwrap();
    assert!(client.early_data_status().is_rejected());

    // the stream data goes out again, now in a 1-RTT packet
    let outgoing = client.transmit(now(2000)).expect("retransmission");
    let mut payload = outgoing.payload;
    let buffer = quartz_codec::DecoderBufferMut::new(&mut payload);
    let (packet, _) = Packet::decode(buffer, 8).unwrap();
    match packet {
        Packet::Protected(packet) => assert_eq!(packet.kind(), PacketKind::OneRtt),
        _ => panic!("expected a 1-RTT packet"),
    }
}

#[test]
fn early_data_status_is_surfaced() {
    let mut client = connection(
        Client,
        vec![Step::EarlyData(EarlyDataStatus::Rejected)],
        true,
    );
    client.drive_tls(now(0)).unwrap();
    assert!(client.early_data_status().is_rejected());
}

#[test]
fn handshake_timeout_refuses_the_connection() {
    let mut client = connection(
        Client,
        vec![Step::SendInitial(Bytes::from_static(b"ch"))],
        true,
    );
    client.drive_tls(now(0)).unwrap();

    let timeout = Limits::default().handshake_timeout.as_micros() as u64;
    client.on_timeout(now(timeout + 1));
    assert_eq!(client.state(), State::Closing);
    assert_eq!(
        client.close_reason.as_ref().map(|reason| reason.error),
        Some(connection::Error::Transport(
            transport::Error::CONNECTION_REFUSED.with_reason("handshake timed out")
        ))
    );
}
