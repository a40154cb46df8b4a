// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream creation, routing and lifecycle.
//!
//! Peer-initiated streams are created opportunistically when their
//! first frame arrives, up to the advertised concurrency limit.
//! Streams are destroyed once both halves reach a terminal state, which
//! in turn frees concurrency credit advertised back through
//! MAX_STREAMS.

use crate::stream::{
    recv::{ReadOutcome, ReceiveStream},
    send::{SendSlice, SendStream},
};
use hashbrown::HashMap;
use quartz_quic_core::{
    connection::limits::Limits,
    endpoint,
    frame,
    stream::{StreamId, StreamType},
    transport,
    transport::parameters::TransportParameters,
    varint::VarInt,
};
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct Entry {
    send: Option<SendStream>,
    recv: Option<ReceiveStream>,
}

impl Entry {
    fn is_finished(&self) -> bool {
        self.send.as_ref().map_or(true, SendStream::is_terminal)
            && self.recv.as_ref().map_or(true, ReceiveStream::is_terminal)
    }
}

#[derive(Debug)]
pub struct StreamManager {
    local_role: endpoint::Type,
    streams: HashMap<StreamId, Entry>,

    /// Streams with data waiting for packet space, round-robin order
    ready: VecDeque<StreamId>,

    /// Peer-granted stream counts for streams we open
    peer_max_bidi: u64,
    peer_max_uni: u64,
    next_bidi_ordinal: u64,
    next_uni_ordinal: u64,
    streams_blocked_pending: Option<StreamType>,

    /// Initial send credit per stream type, from peer parameters
    send_credit_bidi_local_opened: u64,
    send_credit_bidi_peer_opened: u64,
    send_credit_uni: u64,

    /// What we grant the peer
    local_max_bidi: u64,
    local_max_uni: u64,
    opened_remote_bidi: u64,
    opened_remote_uni: u64,
    closed_remote_bidi: u64,
    closed_remote_uni: u64,
    max_streams_pending_bidi: bool,
    max_streams_pending_uni: bool,

    /// Per-stream receive window for new streams
    stream_data_window: u64,

    /// Peer-opened streams not yet surfaced to the application
    accept_queue: VecDeque<StreamId>,
}

impl StreamManager {
    pub fn new(local_role: endpoint::Type, limits: &Limits) -> Self {
        Self {
            local_role,
            streams: HashMap::new(),
            ready: VecDeque::new(),
            peer_max_bidi: 0,
            peer_max_uni: 0,
            next_bidi_ordinal: 0,
            next_uni_ordinal: 0,
            streams_blocked_pending: None,
            send_credit_bidi_local_opened: 0,
            send_credit_bidi_peer_opened: 0,
            send_credit_uni: 0,
            local_max_bidi: limits.max_open_remote_bidirectional_streams,
            local_max_uni: limits.max_open_remote_unidirectional_streams,
            opened_remote_bidi: 0,
            opened_remote_uni: 0,
            closed_remote_bidi: 0,
            closed_remote_uni: 0,
            max_streams_pending_bidi: false,
            max_streams_pending_uni: false,
            stream_data_window: limits.stream_data_window,
            accept_queue: VecDeque::new(),
        }
    }

    /// Applies the peer's transport parameters
    pub fn on_peer_parameters(&mut self, peer: &TransportParameters) {
        self.peer_max_bidi = peer.initial_max_streams_bidi.as_u64();
        self.peer_max_uni = peer.initial_max_streams_uni.as_u64();
        // from the peer's perspective our locally-opened bidi streams are
        // "remote", so their send credit comes from bidi_remote
        self.send_credit_bidi_local_opened = peer.initial_max_stream_data_bidi_remote.as_u64();
        self.send_credit_bidi_peer_opened = peer.initial_max_stream_data_bidi_local.as_u64();
        self.send_credit_uni = peer.initial_max_stream_data_uni.as_u64();
    }

    /// Opens a locally-initiated stream.
    ///
    /// `None` means the peer's MAX_STREAMS limit is exhausted; a
    /// STREAMS_BLOCKED frame is queued.
    pub fn open(&mut self, stream_type: StreamType) -> Option<StreamId> {
        let (ordinal, limit) = match stream_type {
            StreamType::Bidirectional => (&mut self.next_bidi_ordinal, self.peer_max_bidi),
            StreamType::Unidirectional => (&mut self.next_uni_ordinal, self.peer_max_uni),
        };

        if *ordinal >= limit {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
            //# An endpoint that is unable to open a new stream due to the peer's
            //# limits SHOULD send a STREAMS_BLOCKED frame
            self.streams_blocked_pending = Some(stream_type);
            return None;
        }

        let id = StreamId::nth(self.local_role, stream_type, *ordinal)?;
        *ordinal += 1;

        let send_credit = match stream_type {
            StreamType::Bidirectional => self.send_credit_bidi_local_opened,
            StreamType::Unidirectional => self.send_credit_uni,
        };

        let mut entry = Entry::default();
        entry.send = Some(SendStream::new(id, send_credit));
        if stream_type.is_bidirectional() {
            entry.recv = Some(ReceiveStream::new(id, self.stream_data_window));
        }
        self.streams.insert(id, entry);

        Some(id)
    }

    /// Creates peer-initiated streams up to and including `id`
    fn create_remote_streams(&mut self, id: StreamId) -> Result<(), transport::Error> {
        let stream_type = id.stream_type();
        let (opened, limit) = match stream_type {
            StreamType::Bidirectional => (&mut self.opened_remote_bidi, self.local_max_bidi),
            StreamType::Unidirectional => (&mut self.opened_remote_uni, self.local_max_uni),
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint that receives a frame with a stream ID exceeding the
        //# limit it has sent MUST treat this as a connection error of type
        //# STREAM_LIMIT_ERROR
        if id.ordinal() >= limit {
            return Err(transport::Error::STREAM_LIMIT_ERROR);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
        //# A stream is opened implicitly along with every lower-numbered
        //# stream of the same type
        while *opened <= id.ordinal() {
            let id = StreamId::nth(self.local_role.peer_type(), stream_type, *opened)
                .ok_or(transport::Error::INTERNAL_ERROR)?;
            *opened += 1;

            let mut entry = Entry::default();
            entry.recv = Some(ReceiveStream::new(id, self.stream_data_window));
            if stream_type.is_bidirectional() {
                let send_credit = self.send_credit_bidi_peer_opened;
                entry.send = Some(SendStream::new(id, send_credit));
            }
            self.streams.insert(id, entry);
            self.accept_queue.push_back(id);
        }

        Ok(())
    }

    fn entry_for_frame(
        &mut self,
        stream_id: VarInt,
        remote_must_send: bool,
    ) -> Result<&mut Entry, transport::Error> {
        let id = StreamId::from_varint(stream_id);

        if remote_must_send && !id.is_sendable_by(self.local_role.peer_type()) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
            //# An endpoint MUST terminate the connection with error
            //# STREAM_STATE_ERROR if it receives a STREAM frame for a locally
            //# initiated stream that has not yet been created, or for a send-
            //# only stream.
            return Err(transport::Error::STREAM_STATE_ERROR
                .with_reason("frame for a send-only stream"));
        }

        if id.initiator() == self.local_role {
            // our stream: it must exist already
            if !self.streams.contains_key(&id) {
                let opened = match id.stream_type() {
                    StreamType::Bidirectional => self.next_bidi_ordinal,
                    StreamType::Unidirectional => self.next_uni_ordinal,
                };
                if id.ordinal() >= opened {
                    return Err(transport::Error::STREAM_STATE_ERROR
                        .with_reason("frame for a stream that was never opened"));
                }
                // already destroyed; recreate a tombstone-free default so
                // late frames are tolerated
                return Err(transport::Error::STREAM_STATE_ERROR.with_reason("stream closed"));
            }
        } else if !self.streams.contains_key(&id) {
            let opened = match id.stream_type() {
                StreamType::Bidirectional => self.opened_remote_bidi,
                StreamType::Unidirectional => self.opened_remote_uni,
            };
            if id.ordinal() >= opened {
                self.create_remote_streams(id)?;
            } else {
                return Err(transport::Error::STREAM_STATE_ERROR.with_reason("stream closed"));
            }
        }

        self.streams
            .get_mut(&id)
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("stream closed"))
    }

    /// Routes a STREAM frame. Returns the connection flow-control delta.
    pub fn on_stream_frame(&mut self, frame: &frame::Stream) -> Result<u64, transport::Error> {
        let entry = match self.entry_for_frame(frame.stream_id, true) {
            Ok(entry) => entry,
            // frames for closed streams are expected after local destruction
            Err(error) if error.reason == "stream closed" => return Ok(0),
            Err(error) => return Err(error),
        };

        let recv = entry
            .recv
            .as_mut()
            .ok_or(transport::Error::STREAM_STATE_ERROR)?;
        let delta = recv.on_data(frame)?;

        let id = StreamId::from_varint(frame.stream_id);
        self.maybe_destroy(id);
        Ok(delta)
    }

    pub fn on_reset_stream_frame(
        &mut self,
        frame: &frame::ResetStream,
    ) -> Result<u64, transport::Error> {
        let entry = match self.entry_for_frame(frame.stream_id, true) {
            Ok(entry) => entry,
            Err(error) if error.reason == "stream closed" => return Ok(0),
            Err(error) => return Err(error),
        };

        let recv = entry
            .recv
            .as_mut()
            .ok_or(transport::Error::STREAM_STATE_ERROR)?;
        let delta = recv.on_reset(frame)?;

        let id = StreamId::from_varint(frame.stream_id);
        self.maybe_destroy(id);
        Ok(delta)
    }

    pub fn on_stop_sending_frame(
        &mut self,
        frame: &frame::StopSending,
    ) -> Result<(), transport::Error> {
        let local_role = self.local_role;
        let id = StreamId::from_varint(frame.stream_id);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.5
        //# Receiving a STOP_SENDING frame for a locally initiated stream that
        //# has not yet been created MUST be treated as a connection error of
        //# type STREAM_STATE_ERROR.
        if !id.is_sendable_by(local_role) {
            return Err(transport::Error::STREAM_STATE_ERROR
                .with_reason("STOP_SENDING for a receive-only stream"));
        }

        let entry = match self.entry_for_frame(frame.stream_id, false) {
            Ok(entry) => entry,
            Err(error) if error.reason == "stream closed" => return Ok(()),
            Err(error) => return Err(error),
        };

        if let Some(send) = entry.send.as_mut() {
            send.on_stop_sending(frame.application_error_code);
        }

        self.mark_ready(id);
        Ok(())
    }

    pub fn on_max_stream_data_frame(
        &mut self,
        frame: &frame::MaxStreamData,
    ) -> Result<(), transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        if !id.is_sendable_by(self.local_role) {
            return Err(transport::Error::STREAM_STATE_ERROR
                .with_reason("MAX_STREAM_DATA for a receive-only stream"));
        }

        let entry = match self.entry_for_frame(frame.stream_id, false) {
            Ok(entry) => entry,
            Err(error) if error.reason == "stream closed" => return Ok(()),
            Err(error) => return Err(error),
        };

        if let Some(send) = entry.send.as_mut() {
            send.on_max_stream_data(frame.maximum_stream_data);
        }
        self.mark_ready(id);
        Ok(())
    }

    /// Re-queues a MAX_STREAMS update after the frame carrying it was
    /// lost
    pub fn on_max_streams_lost(&mut self, stream_type: StreamType) {
        match stream_type {
            StreamType::Bidirectional => self.max_streams_pending_bidi = true,
            StreamType::Unidirectional => self.max_streams_pending_uni = true,
        }
    }

    pub fn on_max_streams_frame(&mut self, frame: &frame::MaxStreams) {
        let limit = match frame.stream_type {
            StreamType::Bidirectional => &mut self.peer_max_bidi,
            StreamType::Unidirectional => &mut self.peer_max_uni,
        };
        *limit = (*limit).max(frame.maximum_streams.as_u64());
    }

    /// Application write
    pub fn send(
        &mut self,
        id: StreamId,
        data: &[u8],
        connection_credit: u64,
    ) -> Result<usize, transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"))?;
        let send = entry
            .send
            .as_mut()
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("receive-only stream"))?;

        let written = send.send(data, connection_credit);
        if send.has_pending_data() {
            self.mark_ready(id);
        }
        Ok(written)
    }

    pub fn finish(&mut self, id: StreamId) -> Result<(), transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"))?;
        if let Some(send) = entry.send.as_mut() {
            send.finish();
        }
        self.mark_ready(id);
        Ok(())
    }

    /// Application read
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<ReadOutcome, transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"))?;
        let recv = entry
            .recv
            .as_mut()
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("send-only stream"))?;

        let outcome = recv.read(buf);
        self.maybe_destroy(id);
        Ok(outcome)
    }

    pub fn reset(&mut self, id: StreamId, error_code: VarInt) -> Result<(), transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"))?;
        if let Some(send) = entry.send.as_mut() {
            send.reset(error_code);
        }
        self.mark_ready(id);
        Ok(())
    }

    pub fn stop_sending(&mut self, id: StreamId, error_code: VarInt) -> Result<(), transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"))?;
        if let Some(recv) = entry.recv.as_mut() {
            recv.stop_sending(error_code);
        }
        self.mark_ready(id);
        Ok(())
    }

    /// The next peer-opened stream for the application
    pub fn accept(&mut self) -> Option<StreamId> {
        self.accept_queue.pop_front()
    }

    /// Whether any stream has queued data or control frames
    pub fn has_transmission_interest(&self) -> bool {
        !self.ready.is_empty()
            || self.streams_blocked_pending.is_some()
            || self.max_streams_pending_bidi
            || self.max_streams_pending_uni
    }

    pub fn mark_ready(&mut self, id: StreamId) {
        if !self.ready.contains(&id) {
            self.ready.push_back(id);
        }
    }

    /// Round-robin pick of a stream with work to do
    pub fn next_ready(&mut self) -> Option<StreamId> {
        let len = self.ready.len();
        for _ in 0..len {
            let id = self.ready.pop_front()?;
            let has_work = self.streams.get(&id).map_or(false, |entry| {
                entry.send.as_ref().map_or(false, |send| {
                    send.has_pending_data()
                }) || entry
                    .recv
                    .as_ref()
                    .map_or(false, |_| false)
            });
            if has_work {
                // rotate to the back so other streams get a turn
                self.ready.push_back(id);
                return Some(id);
            }
        }
        None
    }

    pub fn send_stream_mut(&mut self, id: StreamId) -> Option<&mut SendStream> {
        self.streams.get_mut(&id)?.send.as_mut()
    }

    pub fn recv_stream_mut(&mut self, id: StreamId) -> Option<&mut ReceiveStream> {
        self.streams.get_mut(&id)?.recv.as_mut()
    }

    /// Collects pending control frames from every stream: resets,
    /// stop-sendings, window updates, blocked signals
    pub fn pending_control_frames(
        &mut self,
        out: &mut Vec<StreamControlFrame>,
    ) {
        if let Some(stream_type) = self.streams_blocked_pending.take() {
            let limit = match stream_type {
                StreamType::Bidirectional => self.peer_max_bidi,
                StreamType::Unidirectional => self.peer_max_uni,
            };
            if let Ok(limit) = VarInt::new(limit) {
                out.push(StreamControlFrame::StreamsBlocked(stream_type, limit));
            }
        }

        if self.max_streams_pending_bidi {
            self.max_streams_pending_bidi = false;
            let limit = self.local_max_bidi + self.closed_remote_bidi;
            self.local_max_bidi = limit;
            self.closed_remote_bidi = 0;
            if let Ok(limit) = VarInt::new(limit) {
                out.push(StreamControlFrame::MaxStreams(
                    StreamType::Bidirectional,
                    limit,
                ));
            }
        }
        if self.max_streams_pending_uni {
            self.max_streams_pending_uni = false;
            let limit = self.local_max_uni + self.closed_remote_uni;
            self.local_max_uni = limit;
            self.closed_remote_uni = 0;
            if let Ok(limit) = VarInt::new(limit) {
                out.push(StreamControlFrame::MaxStreams(
                    StreamType::Unidirectional,
                    limit,
                ));
            }
        }

        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let entry = match self.streams.get_mut(&id) {
                Some(entry) => entry,
                None => continue,
            };

            if let Some(send) = entry.send.as_mut() {
                if let Some((error_code, final_size)) = send.take_reset() {
                    out.push(StreamControlFrame::ResetStream(id, error_code, final_size));
                }
                if let Some(limit) = send.take_blocked() {
                    out.push(StreamControlFrame::StreamDataBlocked(id, limit));
                }
            }
            if let Some(recv) = entry.recv.as_mut() {
                if let Some(error_code) = recv.take_stop_sending() {
                    out.push(StreamControlFrame::StopSending(id, error_code));
                }
                if let Some(limit) = recv.take_max_stream_data() {
                    out.push(StreamControlFrame::MaxStreamData(id, limit));
                }
            }
        }
    }

    /// Returns a control frame that did not fit in the packet
    pub fn requeue_control_frame(&mut self, frame: StreamControlFrame) {
        match frame {
            StreamControlFrame::ResetStream(id, ..) => self.on_reset_stream_lost(id),
            StreamControlFrame::StopSending(id, _) => {
                if let Some(recv) = self.recv_stream_mut(id) {
                    recv.on_stop_sending_lost();
                }
            }
            StreamControlFrame::MaxStreamData(id, _) => {
                if let Some(recv) = self.recv_stream_mut(id) {
                    recv.on_max_stream_data_lost();
                }
            }
            StreamControlFrame::MaxStreams(stream_type, _) => {
                self.on_max_streams_lost(stream_type)
            }
            // blocked signals regenerate on their own when still relevant
            StreamControlFrame::StreamDataBlocked(..) | StreamControlFrame::StreamsBlocked(..) => {}
        }
    }

    /// Applies ack/loss manifests
    pub fn on_stream_range_acked(&mut self, id: StreamId, offset: u64, len: u64, fin: bool) {
        if let Some(send) = self.send_stream_mut(id) {
            send.on_range_acked(offset, len, fin);
        }
        self.maybe_destroy(id);
    }

    pub fn on_stream_range_lost(&mut self, id: StreamId, offset: u64, len: u64, fin: bool) {
        if let Some(send) = self.send_stream_mut(id) {
            send.on_range_lost(offset, len, fin);
            if send.has_pending_data() {
                self.mark_ready(id);
            }
        }
    }

    pub fn on_reset_stream_acked(&mut self, id: StreamId) {
        if let Some(send) = self.send_stream_mut(id) {
            send.on_reset_acked();
        }
        self.maybe_destroy(id);
    }

    pub fn on_reset_stream_lost(&mut self, id: StreamId) {
        if let Some(send) = self.send_stream_mut(id) {
            send.on_reset_lost();
            self.mark_ready(id);
        }
    }

    /// Destroys the stream once both halves are terminal
    pub fn maybe_destroy(&mut self, id: StreamId) {
        let finished = self
            .streams
            .get(&id)
            .map_or(false, Entry::is_finished);
        if !finished {
            return;
        }

        self.streams.remove(&id);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# Endpoints that want to continue offering the peer new streams
        //# increase the maximum as streams complete
        if id.initiator() != self.local_role {
            match id.stream_type() {
                StreamType::Bidirectional => {
                    self.closed_remote_bidi += 1;
                    self.max_streams_pending_bidi = true;
                }
                StreamType::Unidirectional => {
                    self.closed_remote_uni += 1;
                    self.max_streams_pending_uni = true;
                }
            }
        }
    }

    #[inline]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Control frames emitted by streams, gathered by the scheduler
#[derive(Debug, PartialEq, Eq)]
pub enum StreamControlFrame {
    ResetStream(StreamId, VarInt, u64),
    StopSending(StreamId, VarInt),
    MaxStreamData(StreamId, VarInt),
    StreamDataBlocked(StreamId, VarInt),
    MaxStreams(StreamType, VarInt),
    StreamsBlocked(StreamType, VarInt),
}

/// A stream transmission produced by the scheduler
#[derive(Debug)]
pub struct StreamTransmission {
    pub id: StreamId,
    pub slice: SendSlice,
}

#[cfg(test)]
mod tests;
