// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use quartz_quic_core::endpoint::Type::{Client, Server};

fn peer_params() -> TransportParameters {
    TransportParameters {
        initial_max_streams_bidi: VarInt::from_u8(3),
        initial_max_streams_uni: VarInt::from_u8(1),
        initial_max_stream_data_bidi_local: VarInt::from_u32(1_000),
        initial_max_stream_data_bidi_remote: VarInt::from_u32(2_000),
        initial_max_stream_data_uni: VarInt::from_u32(500),
        ..Default::default()
    }
}

fn manager(role: endpoint::Type) -> StreamManager {
    let mut manager = StreamManager::new(role, &Limits::default());
    manager.on_peer_parameters(&peer_params());
    manager
}

fn stream_frame(id: StreamId, offset: u64, data: &[u8], fin: bool) -> frame::Stream {
    frame::Stream {
        stream_id: id.as_varint(),
        offset: VarInt::new(offset).unwrap(),
        is_last_frame: false,
        is_fin: fin,
        data,
    }
}

#[test]
fn open_honors_peer_limits() {
    let mut manager = manager(Client);

    for expected_ordinal in 0..3 {
        let id = manager.open(StreamType::Bidirectional).unwrap();
        assert_eq!(id.ordinal(), expected_ordinal);
        assert_eq!(id.initiator(), Client);
    }

    // the fourth exceeds the peer's limit and queues STREAMS_BLOCKED
    assert!(manager.open(StreamType::Bidirectional).is_none());
    let mut control = Vec::new();
    manager.pending_control_frames(&mut control);
    assert!(control.contains(&StreamControlFrame::StreamsBlocked(
        StreamType::Bidirectional,
        VarInt::from_u8(3)
    )));

    // MAX_STREAMS unblocks
    manager.on_max_streams_frame(&frame::MaxStreams {
        stream_type: StreamType::Bidirectional,
        maximum_streams: VarInt::from_u8(4),
    });
    assert!(manager.open(StreamType::Bidirectional).is_some());
}

#[test]
fn peer_streams_are_created_implicitly() {
    let mut manager = manager(Server);

    // a frame for client stream ordinal 2 implicitly opens 0 and 1
    let id = StreamId::nth(Client, StreamType::Bidirectional, 2).unwrap();
    manager
        .on_stream_frame(&stream_frame(id, 0, b"hello", false))
        .unwrap();

    assert_eq!(manager.stream_count(), 3);
    let accepted: Vec<u64> = core::iter::from_fn(|| manager.accept())
        .map(|id| id.ordinal())
        .collect();
    assert_eq!(accepted, [0, 1, 2]);
}

#[test]
fn peer_exceeding_stream_limit_is_rejected() {
    let mut manager = StreamManager::new(
        Server,
        &Limits::default().with_max_open_remote_bidirectional_streams(2),
    );

    let id = StreamId::nth(Client, StreamType::Bidirectional, 2).unwrap();
    let error = manager
        .on_stream_frame(&stream_frame(id, 0, b"x", false))
        .unwrap_err();
    assert_eq!(error.code, transport::Error::STREAM_LIMIT_ERROR.code);
}

#[test]
fn frame_for_unopened_local_stream_is_rejected() {
    let mut manager = manager(Client);

    // the peer claims to have data on a bidi stream we never opened
    let id = StreamId::nth(Client, StreamType::Bidirectional, 0).unwrap();
    let error = manager
        .on_stream_frame(&stream_frame(id, 0, b"x", false))
        .unwrap_err();
    assert_eq!(error.code, transport::Error::STREAM_STATE_ERROR.code);
}

#[test]
fn stream_frame_on_send_only_stream_is_rejected() {
    let mut manager = manager(Client);

    // our unidirectional stream cannot carry peer data
    let id = manager.open(StreamType::Unidirectional).unwrap();
    let error = manager
        .on_stream_frame(&stream_frame(id, 0, b"x", false))
        .unwrap_err();
    assert_eq!(error.code, transport::Error::STREAM_STATE_ERROR.code);
}

#[test]
fn send_and_deliver_round_trip() {
    let mut client = manager(Client);
    let mut server = manager(Server);

    let id = client.open(StreamType::Bidirectional).unwrap();
    let written = client.send(id, b"request body", u64::MAX).unwrap();
    assert_eq!(written, 12);

    let ready = client.next_ready().unwrap();
    assert_eq!(ready, id);

    let send = client.send_stream_mut(id).unwrap();
    let slice = send.pop_transmission(1200).unwrap();
    let mut payload = Vec::new();
    send.copy_range(slice.offset, slice.len, &mut payload);

    server
        .on_stream_frame(&stream_frame(id, slice.offset, &payload, slice.fin))
        .unwrap();

    let mut buf = [0u8; 64];
    match server.read(id, &mut buf).unwrap() {
        ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"request body"),
        other => panic!("unexpected read outcome {other:?}"),
    }
}

#[test]
fn destroying_remote_streams_raises_max_streams() {
    let mut manager = manager(Server);

    let id = StreamId::nth(Client, StreamType::Unidirectional, 0).unwrap();
    manager
        .on_stream_frame(&stream_frame(id, 0, b"done", true))
        .unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(
        manager.read(id, &mut buf).unwrap(),
        ReadOutcome::Data(4)
    ));
    assert!(matches!(
        manager.read(id, &mut buf).unwrap(),
        ReadOutcome::Finished
    ));

    // the stream is gone and concurrency credit comes back
    assert_eq!(manager.stream_count(), 0);
    let mut control = Vec::new();
    manager.pending_control_frames(&mut control);
    let expected_limit = Limits::default().max_open_remote_unidirectional_streams + 1;
    assert!(control.contains(&StreamControlFrame::MaxStreams(
        StreamType::Unidirectional,
        VarInt::new(expected_limit).unwrap()
    )));
}

#[test]
fn late_frames_for_destroyed_streams_are_ignored() {
    let mut manager = manager(Server);

    let id = StreamId::nth(Client, StreamType::Unidirectional, 0).unwrap();
    manager
        .on_stream_frame(&stream_frame(id, 0, b"done", true))
        .unwrap();
    let mut buf = [0u8; 16];
    manager.read(id, &mut buf).unwrap();
    manager.read(id, &mut buf).unwrap();
    assert_eq!(manager.stream_count(), 0);

    // a retransmission of the same data arrives after destruction
    assert_eq!(
        manager
            .on_stream_frame(&stream_frame(id, 0, b"done", true))
            .unwrap(),
        0
    );
}

#[test]
fn stop_sending_routes_to_send_half() {
    let mut manager = manager(Client);
    let id = manager.open(StreamType::Bidirectional).unwrap();
    manager.send(id, b"payload", u64::MAX).unwrap();

    manager
        .on_stop_sending_frame(&frame::StopSending {
            stream_id: id.as_varint(),
            application_error_code: VarInt::from_u8(5),
        })
        .unwrap();

    let mut control = Vec::new();
    manager.pending_control_frames(&mut control);
    assert!(control.contains(&StreamControlFrame::ResetStream(
        id,
        VarInt::from_u8(5),
        7
    )));
}
