// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection: one state machine binding packet protection, packet
//! number spaces, recovery, flow control, streams, connection IDs and
//! paths together.
//!
//! The role-specific behavior (client vs server) is a [`endpoint::Type`]
//! field, not a type hierarchy; the handshake differences live in a
//! handful of role checks.

use crate::{
    connection::id_manager::{IdManager, RoutingEvent},
    flow_control::{RxController, TxController},
    path,
    recovery::Manifest,
    space::{ApplicationSpace, HandshakeSpace, InitialSpace},
    stream::{ReadOutcome, StreamManager},
};
use bytes::Bytes;
use quartz_quic_core::{
    ack,
    connection::{self, id::PeerId, limits::Limits},
    crypto::{tls, tls::EarlyDataStatus},
    endpoint,
    frame::{self, Frame},
    inet::{ExplicitCongestionNotification, SocketAddress},
    packet::{self, number::PacketNumberSpace, Packet, ProtectedPacket},
    random,
    stream::{StreamId, StreamType},
    time::{Timer, Timestamp},
    transport::{self, parameters::TransportParameters},
    varint::VarInt,
};
use std::collections::VecDeque;

pub mod id_manager;

/// Connection states, RFC 9000 section 10
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for the first handshake flight
    Initial,
    Handshaking,
    Connected,
    /// We closed; CONNECTION_CLOSE goes out for a while
    Closing,
    /// The peer closed; nothing is ever sent again
    Draining,
    Closed,
}

/// Events surfaced to the application layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    HandshakeDone,
    StreamOpened(StreamId),
    NewToken(Bytes),
    ConnectionClosed(connection::Error),
}

/// The CONNECTION_CLOSE content retransmitted during the closing window
#[derive(Clone, Debug)]
pub(crate) struct CloseReason {
    pub error: connection::Error,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

pub struct Connection<S: tls::Session> {
    pub(crate) role: endpoint::Type,
    pub(crate) state: State,
    pub(crate) limits: Limits,
    pub(crate) peer_params: Option<TransportParameters>,

    pub(crate) tls: S,
    pub(crate) handshake_complete: bool,
    pub(crate) handshake_confirmed: bool,
    pub(crate) alpn: Option<Bytes>,
    pub(crate) early_data: EarlyDataStatus,
    /// Tokens from NEW_TOKEN frames, for future dials
    pub(crate) new_tokens: Vec<Bytes>,

    pub(crate) initial: Option<InitialSpace<S>>,
    pub(crate) handshake: Option<HandshakeSpace<S>>,
    pub(crate) application: Option<ApplicationSpace<S>>,
    /// 0-RTT keys parked until the application space exists
    pub(crate) zero_rtt_keys: Option<(S::ZeroRttKey, S::ZeroRttHeaderKey)>,

    pub(crate) streams: StreamManager,
    pub(crate) tx_flow: TxController,
    pub(crate) rx_flow: RxController,
    pub(crate) cids: IdManager,
    pub(crate) paths: path::Manager,
    pub(crate) random: Box<dyn random::Generator>,

    /// Doubles on PTO across all spaces
    pub(crate) pto_backoff: u32,

    pub(crate) idle_timer: Timer,
    pub(crate) handshake_timer: Timer,
    pub(crate) close_timer: Timer,
    pub(crate) keep_alive_timer: Timer,
    /// A PING is owed (keep-alive or PTO probe filler)
    pub(crate) ping_pending: bool,

    /// Token presented in Initial packets (from Retry or NEW_TOKEN)
    pub(crate) initial_token: Vec<u8>,

    /// Key for deriving stateless reset tokens from local ids
    pub(crate) reset_token_key: [u8; 16],

    /// The 0-RTT rejection was already processed
    pub(crate) zero_rtt_reject_handled: bool,

    pub(crate) close_reason: Option<CloseReason>,
    /// A packet arrived while Closing; answer with CONNECTION_CLOSE
    pub(crate) close_response_pending: bool,
    pub(crate) last_close_sent: Option<Timestamp>,

    /// Validation material from the handshake
    pub(crate) original_destination_id: Option<connection::id::InitialId>,
    pub(crate) retry_source_id: Option<PeerId>,
    pub(crate) peer_handshake_scid: Option<PeerId>,

    pub(crate) events: VecDeque<Event>,
}

impl<S: tls::Session> Connection<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: endpoint::Type,
        limits: Limits,
        tls: S,
        initial_space: InitialSpace<S>,
        local_id: connection::id::LocalId,
        remote_id: PeerId,
        remote_address: SocketAddress,
        path_validated: bool,
        random: Box<dyn random::Generator>,
        original_destination_id: Option<connection::id::InitialId>,
        now: Timestamp,
    ) -> Self {
        let active_path = path::Path::new(
            remote_address,
            limits.congestion_controller,
            limits.max_udp_payload_size.min(1452),
            path_validated,
            limits.ecn_disabled,
        );

        let mut idle_timer = Timer::default();
        idle_timer.set(now + limits.max_idle_timeout);
        let mut handshake_timer = Timer::default();
        handshake_timer.set(now + limits.handshake_timeout);

        Self {
            role,
            state: State::Initial,
            streams: StreamManager::new(role, &limits),
            tx_flow: TxController::new(VarInt::ZERO),
            rx_flow: RxController::new(limits.data_window),
            cids: IdManager::new(local_id, remote_id, limits.active_connection_id_limit),
            paths: path::Manager::new(
                active_path,
                limits.congestion_controller,
                limits.max_udp_payload_size.min(1452),
                limits.ecn_disabled,
            ),
            random,
            peer_params: None,
            tls,
            handshake_complete: false,
            handshake_confirmed: false,
            alpn: None,
            early_data: EarlyDataStatus::None,
            new_tokens: Vec::new(),
            initial: Some(initial_space),
            handshake: None,
            application: None,
            zero_rtt_keys: None,
            pto_backoff: 1,
            idle_timer,
            handshake_timer,
            close_timer: Timer::default(),
            keep_alive_timer: Timer::default(),
            ping_pending: false,
            initial_token: Vec::new(),
            reset_token_key: [0; 16],
            zero_rtt_reject_handled: false,
            close_reason: None,
            close_response_pending: false,
            last_close_sent: None,
            original_destination_id,
            retry_source_id: None,
            peer_handshake_scid: None,
            events: VecDeque::new(),
            limits,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn role(&self) -> endpoint::Type {
        self.role
    }

    #[inline]
    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    #[inline]
    pub fn early_data_status(&self) -> EarlyDataStatus {
        self.early_data
    }

    #[inline]
    pub fn alpn(&self) -> Option<&Bytes> {
        self.alpn.as_ref()
    }

    /// Pops the next application-facing event
    pub fn poll_event(&mut self) -> Option<Event> {
        if let Some(id) = self.streams.accept() {
            return Some(Event::StreamOpened(id));
        }
        self.events.pop_front()
    }

    // === application boundary =========================================

    pub fn open_stream(&mut self, stream_type: StreamType) -> Option<StreamId> {
        if !matches!(self.state, State::Connected | State::Handshaking | State::Initial) {
            return None;
        }
        self.streams.open(stream_type)
    }

    pub fn stream_send(&mut self, id: StreamId, data: &[u8]) -> Result<usize, transport::Error> {
        let credit = self.tx_flow.available();
        let written = self.streams.send(id, data, credit)?;
        self.tx_flow.on_data_sent(written as u64);
        if written < data.len() && self.tx_flow.available() == 0 {
            self.tx_flow.on_blocked();
        }
        Ok(written)
    }

    pub fn stream_finish(&mut self, id: StreamId) -> Result<(), transport::Error> {
        self.streams.finish(id)
    }

    pub fn stream_recv(
        &mut self,
        id: StreamId,
        buf: &mut [u8],
    ) -> Result<ReadOutcome, transport::Error> {
        let outcome = self.streams.read(id, buf)?;
        if let ReadOutcome::Data(n) = outcome {
            self.rx_flow.on_data_consumed(n as u64);
        }
        Ok(outcome)
    }

    pub fn stream_reset(&mut self, id: StreamId, error_code: VarInt) -> Result<(), transport::Error> {
        self.streams.reset(id, error_code)
    }

    pub fn stream_stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
    ) -> Result<(), transport::Error> {
        self.streams.stop_sending(id, error_code)
    }

    /// Closes the connection.
    ///
    /// Error code zero is a graceful close.
    pub fn close(&mut self, error_code: VarInt, now: Timestamp) {
        if matches!(self.state, State::Closing | State::Draining | State::Closed) {
            return;
        }

        let error = if error_code == VarInt::ZERO {
            connection::Error::Closed
        } else {
            connection::Error::Application { error_code }
        };

        self.enter_closing(
            CloseReason {
                error,
                // application closes use frame type None (0x1d encoding)
                frame_type: None,
                reason: "",
            },
            now,
        );
    }

    pub(crate) fn close_with_transport_error(&mut self, error: transport::Error, now: Timestamp) {
        if matches!(self.state, State::Closing | State::Draining | State::Closed) {
            return;
        }

        tracing::debug!(code = %error.code, reason = error.reason, "closing connection");
        self.enter_closing(
            CloseReason {
                error: error.into(),
                frame_type: Some(error.frame_type.unwrap_or(VarInt::ZERO)),
                reason: error.reason,
            },
            now,
        );
    }

    fn enter_closing(&mut self, reason: CloseReason, now: Timestamp) {
        self.state = State::Closing;
        self.close_reason = Some(reason);
        self.close_response_pending = true;
        self.arm_close_timer(now);
        self.idle_timer.cancel();
        self.handshake_timer.cancel();
    }

    fn arm_close_timer(&mut self, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
        //# The closing and draining connection states exist to ensure that
        //# connections close cleanly and that delayed or reordered packets are
        //# properly discarded.  These states SHOULD persist for at least three
        //# times the current PTO interval
        let pto = self.current_pto();
        let linger = (pto * 3).max(core::time::Duration::from_millis(500));
        self.close_timer.set(now + linger);
    }

    pub(crate) fn current_pto(&self) -> core::time::Duration {
        self.paths
            .active()
            .rtt
            .pto_period(self.pto_backoff, PacketNumberSpace::ApplicationData)
    }

    // === receive path =================================================

    /// Processes one incoming UDP datagram
    pub fn on_datagram(
        &mut self,
        now: Timestamp,
        remote_address: SocketAddress,
        ecn: ExplicitCongestionNotification,
        payload: &mut [u8],
    ) -> Result<(), connection::Error> {
        if matches!(self.state, State::Closed | State::Draining) {
            return Ok(());
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
        //# An endpoint detects a potential stateless reset using the token it
        //# associates with the connection ID it used to send the datagram
        if let Some(token) = self.cids.active_reset_token() {
            if token.matches_datagram(payload) {
                self.state = State::Draining;
                self.close_timer.cancel();
                self.state = State::Closed;
                self.events
                    .push_back(Event::ConnectionClosed(connection::Error::StatelessReset));
                return Ok(());
            }
        }

        self.paths.on_datagram(
            remote_address,
            payload.len(),
            self.handshake_confirmed,
            &mut *self.random,
        );

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# An endpoint restarts its idle timer when a packet from its peer is
        //# received and processed successfully.
        if matches!(self.state, State::Initial | State::Handshaking | State::Connected) {
            self.idle_timer.set(now + self.limits.max_idle_timeout);
        }

        let ecn = if self.limits.ecn_disabled {
            ExplicitCongestionNotification::NotEct
        } else {
            ecn
        };

        let mut buffer = quartz_codec::DecoderBufferMut::new(payload);
        while !buffer.is_empty() {
            let (packet, remaining) =
                match Packet::decode(buffer, id_manager::LOCAL_ID_LEN) {
                    Ok(decoded) => decoded,
                    // undecodable remainder of a datagram is dropped
                    Err(_) => break,
                };
            buffer = remaining;

            match packet {
                Packet::Protected(packet) => {
                    if let Err(error) = self.on_protected_packet(now, remote_address, ecn, packet) {
                        self.close_with_transport_error(error, now);
                        let reason = self
                            .close_reason
                            .as_ref()
                            .expect("closing sets a reason")
                            .error;
                        return Err(reason);
                    }
                }
                Packet::Retry(retry) => self.on_retry(retry),
                Packet::VersionNegotiation(_) => {
                    // only meaningful before any server packet arrives;
                    // this implementation speaks v1 exclusively, so a VN
                    // packet means no common version exists
                    if self.role.is_client() && matches!(self.state, State::Initial) {
                        self.state = State::Closed;
                        self.events.push_back(Event::ConnectionClosed(
                            connection::Error::HandshakeTimeout,
                        ));
                        return Ok(());
                    }
                }
            }

            if matches!(self.state, State::Closed | State::Draining) {
                break;
            }
        }

        self.drive_tls(now)?;
        Ok(())
    }

    fn on_retry(&mut self, retry: packet::Retry) {
        use quartz_quic_core::crypto::InitialKey as _;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# A client MUST accept and process at most one Retry packet for
        //# each connection attempt.
        if !self.role.is_client()
            || !matches!(self.state, State::Initial)
            || self.retry_source_id.is_some()
            || retry.retry_token().is_empty()
        {
            return;
        }

        self.retry_source_id = PeerId::try_from_bytes(retry.source_connection_id());
        let retry_source_id = match self.retry_source_id {
            Some(id) => id,
            None => return,
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# The client responds to a Retry packet with an Initial packet that
        //# includes the provided Retry token to continue connection
        //# establishment.
        self.initial_token = retry.retry_token().to_vec();
        self.cids.update_initial_remote_id(retry_source_id);

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
        //# The connection ID used with HKDF-Expand-Label is the Destination
        //# Connection ID in the Initial packet sent by the client.  ...
        //# This includes Initial packets sent after receiving a Retry packet,
        //# which use the connection ID selected by the server.
        let (key, header_key) =
            <S as quartz_quic_core::crypto::CryptoSuite>::InitialKey::new_client(
                retry.source_connection_id(),
            );

        if let Some(space) = self.initial.as_mut() {
            space.key = key;
            space.header_key = header_key;

            // the first flight leaves the sent-record set and goes again
            let path = self.paths.active_mut();
            let manifests = space
                .common
                .recovery
                .take_all_for_retransmission(&mut path.cc);
            for manifest in manifests {
                for (offset, len) in manifest.crypto {
                    space.common.crypto_stream.on_frame_lost(offset, len);
                }
            }
        }

        tracing::debug!("retry accepted, resending the first flight");
    }

    fn on_protected_packet(
        &mut self,
        now: Timestamp,
        remote_address: SocketAddress,
        ecn: ExplicitCongestionNotification,
        packet: ProtectedPacket,
    ) -> Result<(), transport::Error> {
        let kind = packet.kind();
        let level = kind.level();
        let space = kind.space();

        // record the peer's handshake-time SCID for parameter validation
        if matches!(kind, packet::PacketKind::Initial | packet::PacketKind::Handshake)
            && self.peer_handshake_scid.is_none()
        {
            self.peer_handshake_scid = PeerId::try_from_bytes(packet.source_connection_id());

            // the client replaces its made-up remote id with the server's;
            // the server learns the client's SCID the same way
            if matches!(kind, packet::PacketKind::Initial) {
                if let Some(id) = self.peer_handshake_scid {
                    self.cids.update_initial_remote_id(id);
                }
            }
        }

        let decrypted = match kind {
            packet::PacketKind::Initial => {
                let space_ref = match self.initial.as_mut() {
                    Some(space_ref) => space_ref,
                    // keys discarded; late packet
                    None => return Ok(()),
                };
                let largest = space_ref.common.largest_received();
                let encrypted = match packet.unprotect(&space_ref.header_key, largest) {
                    Ok(encrypted) => encrypted,
                    Err(_) => return Ok(()),
                };
                if space_ref
                    .common
                    .ack_manager
                    .check_duplicate(encrypted.packet_number())
                    .is_err()
                {
                    return Ok(());
                }
                match encrypted.decrypt(&space_ref.key) {
                    Ok(cleartext) => cleartext,
                    Err(_) => return Ok(()),
                }
            }
            packet::PacketKind::Handshake => {
                let space_ref = match self.handshake.as_mut() {
                    Some(space_ref) => space_ref,
                    None => return Ok(()),
                };
                let largest = space_ref.common.largest_received();
                let encrypted = match packet.unprotect(&space_ref.header_key, largest) {
                    Ok(encrypted) => encrypted,
                    Err(_) => return Ok(()),
                };
                if space_ref
                    .common
                    .ack_manager
                    .check_duplicate(encrypted.packet_number())
                    .is_err()
                {
                    return Ok(());
                }
                match encrypted.decrypt(&space_ref.key) {
                    Ok(cleartext) => cleartext,
                    Err(_) => return Ok(()),
                }
            }
            packet::PacketKind::ZeroRtt => {
                // servers decrypt 0-RTT with the installed zero-rtt keys
                let space_ref = match self.application.as_mut() {
                    Some(space_ref) => space_ref,
                    None => return Ok(()),
                };
                let (key, header_key) = match space_ref.zero_rtt.as_ref() {
                    Some((key, header_key)) => (key, header_key),
                    None => return Ok(()),
                };
                let largest = space_ref.common.largest_received();
                let encrypted = match packet.unprotect(header_key, largest) {
                    Ok(encrypted) => encrypted,
                    Err(_) => return Ok(()),
                };
                if space_ref
                    .common
                    .ack_manager
                    .check_duplicate(encrypted.packet_number())
                    .is_err()
                {
                    return Ok(());
                }
                match encrypted.decrypt(key) {
                    Ok(cleartext) => cleartext,
                    Err(_) => return Ok(()),
                }
            }
            packet::PacketKind::OneRtt => {
                let pto = self.current_pto();
                let space_ref = match self.application.as_mut() {
                    Some(space_ref) => space_ref,
                    None => return Ok(()),
                };
                let one_rtt = match space_ref.one_rtt.as_mut() {
                    Some(one_rtt) => one_rtt,
                    None => return Ok(()),
                };
                let largest = space_ref.common.largest_received();
                let encrypted = match packet.unprotect(&one_rtt.header_key, largest) {
                    Ok(encrypted) => encrypted,
                    Err(_) => return Ok(()),
                };
                if space_ref
                    .common
                    .ack_manager
                    .check_duplicate(encrypted.packet_number())
                    .is_err()
                {
                    return Ok(());
                }

                //= https://www.rfc-editor.org/rfc/rfc9001#section-6.3
                //# An endpoint SHOULD attempt to decrypt packets with the
                //# key phase the packet announces
                let key_phase = encrypted.key_phase();
                let tag_len = {
                    use quartz_quic_core::crypto::Key as _;
                    one_rtt.key_set.active_key().tag_len()
                };
                let key_set = &mut one_rtt.key_set;
                let cleartext = match encrypted.decrypt_with(tag_len, |pn, header, payload| {
                    key_set
                        .decrypt_packet(key_phase, pn, header, payload, now, pto)
                        .map(|_rotated| ())
                }) {
                    Ok(cleartext) => cleartext,
                    Err(_) => {
                        //= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
                        //# the endpoint MUST immediately close the connection
                        //# with a connection error of type AEAD_LIMIT_REACHED
                        if one_rtt.key_set.integrity_limit_exceeded() {
                            return Err(transport::Error::AEAD_LIMIT_REACHED);
                        }
                        return Ok(());
                    }
                };

                cleartext
            }
        };

        let packet_number = decrypted.packet_number();
        let payload = decrypted.payload();

        // walk the frames
        let mut ack_eliciting = false;
        let mut frame_buffer = quartz_codec::DecoderBuffer::new(payload);
        let mut frames: Vec<Frame> = Vec::new();
        while !frame_buffer.is_empty() {
            let (frame, remaining) = Frame::decode(frame_buffer)
                .map_err(|_| transport::Error::FRAME_ENCODING_ERROR)?;
            frame_buffer = remaining;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat receipt of a frame in a packet type
            //# that is not permitted as a connection error of type
            //# PROTOCOL_VIOLATION
            if !frame.is_allowed_in(level) {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("frame not allowed at this encryption level")
                    .with_frame_type(VarInt::from_u8(frame.tag())));
            }

            ack_eliciting |= frame.ack_elicitation().is_ack_eliciting();
            frames.push(frame);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
        //# An endpoint MUST treat receipt of a packet containing no frames
        //# as a connection error of type PROTOCOL_VIOLATION.
        if frames.is_empty() {
            return Err(transport::Error::PROTOCOL_VIOLATION.with_reason("empty packet"));
        }

        if matches!(self.state, State::Closing) {
            // only watch for the peer's own close; answer with ours
            for frame in &frames {
                if let Frame::ConnectionClose(close) = frame {
                    self.on_connection_close_frame(close, now);
                    return Ok(());
                }
            }
            self.close_response_pending = true;
            return Ok(());
        }

        let dcid: smallvec::SmallVec<[u8; 20]> =
            smallvec::SmallVec::from_slice(decrypted.destination_connection_id());

        for frame in frames {
            self.on_frame(now, space, remote_address, &dcid, frame)?;
            if matches!(self.state, State::Draining | State::Closed) {
                return Ok(());
            }
        }

        // record the packet for acknowledgment
        let common = match kind {
            packet::PacketKind::Initial => self.initial.as_mut().map(|s| &mut s.common),
            packet::PacketKind::Handshake => self.handshake.as_mut().map(|s| &mut s.common),
            packet::PacketKind::ZeroRtt | packet::PacketKind::OneRtt => {
                self.application.as_mut().map(|s| &mut s.common)
            }
        };
        if let Some(common) = common {
            common
                .ack_manager
                .on_packet_received(packet_number, now, ack_eliciting, ecn);
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a client MUST discard Initial keys when it first sends a
        //# Handshake packet... a server MUST discard Initial keys when it
        //# first successfully processes a Handshake packet
        if matches!(kind, packet::PacketKind::Handshake) && self.role.is_server() {
            self.discard_initial_space();
            // processing a handshake packet validates the client address
            self.paths.active_mut().on_validated();
        }

        if matches!(self.state, State::Initial) {
            self.state = State::Handshaking;
        }

        Ok(())
    }

    fn on_frame(
        &mut self,
        now: Timestamp,
        space: PacketNumberSpace,
        _remote_address: SocketAddress,
        datagram_dcid: &[u8],
        frame: Frame,
    ) -> Result<(), transport::Error> {
        match frame {
            Frame::Padding(_) | Frame::Ping(_) => {}

            Frame::Ack(ack_frame) => self.on_ack_frame(now, space, &ack_frame)?,

            Frame::Crypto(crypto) => {
                // CRYPTO frames belong to the space they arrived in
                if let Some(common) = self.common_for_space(space) {
                    common.crypto_stream.on_rx_frame(crypto.offset, crypto.data)?;
                }
            }

            Frame::Stream(stream) => {
                let delta = self.streams.on_stream_frame(&stream)?;
                self.rx_flow.on_data_received(delta)?;
            }

            Frame::ResetStream(reset) => {
                let delta = self.streams.on_reset_stream_frame(&reset)?;
                self.rx_flow.on_data_received(delta)?;
            }

            Frame::StopSending(stop) => self.streams.on_stop_sending_frame(&stop)?,

            Frame::MaxData(max_data) => self.tx_flow.on_max_data(max_data.maximum_data),

            Frame::MaxStreamData(frame) => self.streams.on_max_stream_data_frame(&frame)?,

            Frame::MaxStreams(frame) => self.streams.on_max_streams_frame(&frame),

            // informational; peers resolve their own blocking
            Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) | Frame::StreamsBlocked(_) => {}

            Frame::NewConnectionId(frame) => self.cids.on_new_connection_id(&frame)?,

            Frame::RetireConnectionId(frame) => {
                self.cids.on_retire_connection_id(&frame, datagram_dcid)?;
                let key = self.reset_token_key;
                self.cids.replenish_local(&mut *self.random, &key);
            }

            Frame::PathChallenge(challenge) => self.paths.on_path_challenge(&challenge),

            Frame::PathResponse(response) => {
                if self.paths.on_path_response(&response) {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.5
                    //# An endpoint MUST NOT reuse a connection ID when sending
                    //# from more than one local address
                    self.cids.rotate_remote();
                    tracing::debug!("path migrated");
                }
            }

            Frame::ConnectionClose(close) => self.on_connection_close_frame(&close, now),

            Frame::HandshakeDone(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST treat receipt of a HANDSHAKE_DONE frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.role.is_server() {
                    return Err(transport::Error::PROTOCOL_VIOLATION
                        .with_reason("client sent HANDSHAKE_DONE"));
                }
                self.on_handshake_confirmed(now);
            }

            Frame::NewToken(frame) => {
                if self.role.is_server() {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                    //# A server MUST treat receipt of a NEW_TOKEN frame as a
                    //# connection error of type FRAME_ENCODING_ERROR.
                    return Err(transport::Error::PROTOCOL_VIOLATION
                        .with_reason("client sent NEW_TOKEN"));
                }
                let token = Bytes::copy_from_slice(frame.token);
                self.new_tokens.push(token.clone());
                self.events.push_back(Event::NewToken(token));
            }
        }

        Ok(())
    }

    fn on_ack_frame(
        &mut self,
        now: Timestamp,
        space: PacketNumberSpace,
        frame: &frame::Ack,
    ) -> Result<(), transport::Error> {
        let peer_settings = self.peer_ack_settings();
        let handshake_confirmed = self.handshake_confirmed;

        let path = self.paths.active_mut();
        let common = match space {
            PacketNumberSpace::Initial => self.initial.as_mut().map(|s| &mut s.common),
            PacketNumberSpace::Handshake => self.handshake.as_mut().map(|s| &mut s.common),
            PacketNumberSpace::ApplicationData => {
                self.application.as_mut().map(|s| &mut s.common)
            }
        };
        let common = match common {
            Some(common) => common,
            None => return Ok(()),
        };

        let outcome = common.recovery.on_ack_frame(
            frame,
            now,
            &peer_settings,
            handshake_confirmed,
            &mut self.pto_backoff,
            &mut path.rtt,
            &mut path.cc,
        )?;

        for (_, manifest) in outcome.newly_acked {
            self.on_manifest_acked(space, manifest);
        }
        for (_, manifest) in outcome.lost {
            self.on_manifest_lost(space, manifest);
        }

        Ok(())
    }

    pub(crate) fn on_manifest_acked(&mut self, space: PacketNumberSpace, manifest: Manifest) {
        if let Some(largest) = manifest.ack_largest {
            let common = self.common_for_space(space);
            if let Some(common) = common {
                common.ack_manager.on_ack_frame_acked(largest);
            }
        }

        for (id, offset, len, fin) in manifest.stream {
            self.streams.on_stream_range_acked(id, offset, len, fin);
        }
        for id in manifest.reset_stream {
            self.streams.on_reset_stream_acked(id);
        }

        if manifest.handshake_done {
            if let Some(space) = self.application.as_mut() {
                space.handshake_done_pending = false;
            }
        }
    }

    pub(crate) fn on_manifest_lost(&mut self, space: PacketNumberSpace, manifest: Manifest) {
        for (offset, len) in manifest.crypto {
            if let Some(common) = self.common_for_space(space) {
                common.crypto_stream.on_frame_lost(offset, len);
            }
        }

        for (id, offset, len, fin) in manifest.stream {
            self.streams.on_stream_range_lost(id, offset, len, fin);
        }
        for id in manifest.reset_stream {
            self.streams.on_reset_stream_lost(id);
        }
        for id in manifest.stop_sending {
            if let Some(recv) = self.streams.recv_stream_mut(id) {
                recv.on_stop_sending_lost();
            }
        }
        for id in manifest.max_stream_data {
            if let Some(recv) = self.streams.recv_stream_mut(id) {
                recv.on_max_stream_data_lost();
            }
        }
        if manifest.max_data {
            self.rx_flow.on_frame_lost();
        }
        if manifest.max_streams_bidi {
            self.streams.on_max_streams_lost(StreamType::Bidirectional);
        }
        if manifest.max_streams_uni {
            self.streams.on_max_streams_lost(StreamType::Unidirectional);
        }
        for sequence in manifest.new_connection_ids {
            self.cids.on_new_id_frame_lost(sequence);
        }
        for sequence in manifest.retire_connection_ids {
            self.cids.on_retire_frame_lost(sequence);
        }
        if manifest.handshake_done {
            if let Some(space) = self.application.as_mut() {
                space.handshake_done_pending = true;
            }
        }
        // lost PATH_CHALLENGE and PATH_RESPONSE frames are not
        // retransmitted; challenges have their own timer and responses
        // are regenerated by a fresh challenge
    }

    fn on_connection_close_frame(&mut self, close: &frame::ConnectionClose, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.2
        //# The draining state is entered once an endpoint receives a
        //# CONNECTION_CLOSE frame, which indicates that its peer is closing
        //# or draining.
        let error = if close.error_code == VarInt::ZERO {
            connection::Error::Closed
        } else if close.is_application_close() {
            connection::Error::Application {
                error_code: close.error_code,
            }
        } else {
            connection::Error::Transport(transport::Error::new(close.error_code))
        };

        tracing::debug!(?error, "peer closed the connection");
        self.state = State::Draining;
        self.close_reason = Some(CloseReason {
            error,
            frame_type: None,
            reason: "",
        });
        self.idle_timer.cancel();
        self.handshake_timer.cancel();
        self.arm_close_timer(now);
    }

    // === TLS integration ==============================================

    pub(crate) fn drive_tls(&mut self, now: Timestamp) -> Result<(), connection::Error> {
        let mut context = TlsContext {
            initial: &mut self.initial,
            handshake: &mut self.handshake,
            application: &mut self.application,
            zero_rtt_keys: &mut self.zero_rtt_keys,
            peer_params: &mut self.peer_params,
            role: self.role,
            limits: &self.limits,
            alpn: &mut self.alpn,
            early_data: &mut self.early_data,
            handshake_complete: &mut self.handshake_complete,
            original_destination_id: self.original_destination_id,
            retry_source_id: self.retry_source_id,
            peer_handshake_scid: self.peer_handshake_scid,
            error: None,
        };

        let poll = self.tls.poll(&mut context);
        let context_error = context.error;

        if let Some(error) = context_error {
            self.close_with_transport_error(error, now);
            return Err(self.close_reason.as_ref().expect("closing").error);
        }

        if let core::task::Poll::Ready(Err(error)) = poll {
            self.close_with_transport_error(error, now);
            return Err(self.close_reason.as_ref().expect("closing").error);
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.6.2
        //# When rejected, a client MUST NOT send further 0-RTT data;
        //# the data is instead retransmitted in 1-RTT packets after the
        //# handshake completes
        if self.early_data.is_rejected() && !self.zero_rtt_reject_handled {
            self.zero_rtt_reject_handled = true;
            self.requeue_zero_rtt_data();
        }

        // remembered 0-RTT parameters apply before completion; the
        // authoritative 1-RTT copy re-applies over them
        if self.peer_params.is_some() {
            self.on_peer_parameters_applied(now)?;
        }

        if self.handshake_complete {
            if self.role.is_server() && !self.handshake_confirmed {
                //= https://www.rfc-editor.org/rfc/rfc9001#section-4.1.2
                //# the TLS handshake is considered confirmed at the server when
                //# the handshake completes
                if let Some(space) = self.application.as_mut() {
                    space.handshake_done_pending = true;
                }
                self.on_handshake_confirmed(now);
            }
            // the client stays Handshaking until HANDSHAKE_DONE arrives
        }

        Ok(())
    }

    fn on_peer_parameters_applied(&mut self, _now: Timestamp) -> Result<(), connection::Error> {
        let params = match self.peer_params.as_ref() {
            Some(params) => params.clone(),
            None => return Ok(()),
        };

        self.streams.on_peer_parameters(&params);
        self.tx_flow.on_max_data(params.initial_max_data);
        self.cids.on_peer_parameters(
            params.active_connection_id_limit,
            params.stateless_reset_token,
        );
        if params.disable_active_migration {
            self.paths.on_peer_disabled_migration();
        }
        self.paths
            .active_mut()
            .rtt
            .on_max_ack_delay(core::time::Duration::from_millis(
                params.max_ack_delay.as_u64(),
            ));

        Ok(())
    }

    /// Returns every in-flight 0-RTT transmission to its owner for
    /// retransmission at 1-RTT
    fn requeue_zero_rtt_data(&mut self) {
        let manifests: Vec<Manifest> = {
            let path = self.paths.active_mut();
            match self.application.as_mut() {
                Some(space) => {
                    space.zero_rtt = None;
                    space.common.recovery.take_all_for_retransmission(&mut path.cc)
                }
                None => Vec::new(),
            }
        };
        for manifest in manifests {
            self.on_manifest_lost(PacketNumberSpace::ApplicationData, manifest);
        }
    }

    fn on_handshake_confirmed(&mut self, _now: Timestamp) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.state = State::Connected;
        self.handshake_timer.cancel();
        self.discard_initial_space();
        self.discard_handshake_space();
        self.events.push_back(Event::HandshakeDone);
        tracing::debug!(role = ?self.role, "handshake confirmed");
    }

    pub(crate) fn discard_initial_space(&mut self) {
        if let Some(mut space) = self.initial.take() {
            space.common.recovery.discard(&mut self.paths.active_mut().cc);
        }
    }

    pub(crate) fn discard_handshake_space(&mut self) {
        if let Some(mut space) = self.handshake.take() {
            space.common.recovery.discard(&mut self.paths.active_mut().cc);
        }
    }

    // === timers =======================================================

    pub fn on_timeout(&mut self, now: Timestamp) {
        if matches!(self.state, State::Closed) {
            return;
        }

        if self.close_timer.poll_expiration(now) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
            //# Once its closing or draining state ends, an endpoint SHOULD
            //# discard all connection state.
            let error = self
                .close_reason
                .as_ref()
                .map(|reason| reason.error)
                .unwrap_or(connection::Error::Closed);
            self.state = State::Closed;
            self.events.push_back(Event::ConnectionClosed(error));
            return;
        }

        if matches!(self.state, State::Closing | State::Draining) {
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# If a max_idle_timeout is specified by either endpoint ... the
        //# connection is silently closed and its state is discarded when it
        //# remains idle
        if self.idle_timer.poll_expiration(now) {
            self.state = State::Closed;
            self.events
                .push_back(Event::ConnectionClosed(connection::Error::IdleTimeout));
            return;
        }

        if self.handshake_timer.poll_expiration(now) {
            self.close_with_transport_error(
                transport::Error::CONNECTION_REFUSED.with_reason("handshake timed out"),
                now,
            );
            return;
        }

        let path = self.paths.active_mut();
        let mut lost_manifests: Vec<(PacketNumberSpace, Manifest)> = Vec::new();
        for common in [
            self.initial.as_mut().map(|s| &mut s.common),
            self.handshake.as_mut().map(|s| &mut s.common),
            self.application.as_mut().map(|s| &mut s.common),
        ]
        .into_iter()
        .flatten()
        {
            let (lost, _pto) = common.recovery.on_timeout(
                now,
                &mut self.pto_backoff,
                &mut path.rtt,
                &mut path.cc,
            );
            let space = common.space();
            lost_manifests.extend(lost.into_iter().map(|(_, manifest)| (space, manifest)));
        }
        for (space, manifest) in lost_manifests {
            self.on_manifest_lost(space, manifest);
        }

        if let Some(one_rtt) = self
            .application
            .as_mut()
            .and_then(|space| space.one_rtt.as_mut())
        {
            one_rtt.key_set.on_timeout(now);
        }

        if self.keep_alive_timer.poll_expiration(now) {
            self.ping_pending = true;
        }

        self.paths.on_timeout(now);
    }

    /// Presents an address validation token on future Initial packets
    pub fn set_initial_token(&mut self, token: Vec<u8>) {
        self.initial_token = token;
    }

    /// Installs the endpoint-wide stateless reset token key
    pub fn set_reset_token_key(&mut self, key: [u8; 16]) {
        self.reset_token_key = key;
    }

    /// The nearest timer deadline across the whole connection
    pub fn next_expiration(&self) -> Option<Timestamp> {
        let mut deadlines = vec![
            self.idle_timer.deadline(),
            self.handshake_timer.deadline(),
            self.close_timer.deadline(),
            self.paths.next_expiration(),
        ];

        for common in [
            self.initial.as_ref().map(|s| &s.common),
            self.handshake.as_ref().map(|s| &s.common),
            self.application.as_ref().map(|s| &s.common),
        ]
        .into_iter()
        .flatten()
        {
            deadlines.push(common.recovery.next_expiration());
            deadlines.push(common.ack_manager.next_expiration());
        }

        if let Some(one_rtt) = self
            .application
            .as_ref()
            .and_then(|space| space.one_rtt.as_ref())
        {
            deadlines.push(one_rtt.key_set.next_expiration());
        }

        quartz_quic_core::time::timer::earliest(deadlines)
    }

    // === helpers ======================================================

    pub(crate) fn peer_ack_settings(&self) -> ack::Settings {
        let mut settings = ack::Settings::default();
        if let Some(params) = self.peer_params.as_ref() {
            settings.ack_delay_exponent = params.ack_delay_exponent;
            settings.max_ack_delay =
                core::time::Duration::from_millis(params.max_ack_delay.as_u64());
        }
        settings
    }

    pub(crate) fn common_for_space(
        &mut self,
        space: PacketNumberSpace,
    ) -> Option<&mut crate::space::Common> {
        match space {
            PacketNumberSpace::Initial => self.initial.as_mut().map(|s| &mut s.common),
            PacketNumberSpace::Handshake => self.handshake.as_mut().map(|s| &mut s.common),
            PacketNumberSpace::ApplicationData => {
                self.application.as_mut().map(|s| &mut s.common)
            }
        }
    }

    /// Routing updates for the dispatch layer
    pub fn take_routing_events(&mut self) -> smallvec::SmallVec<[RoutingEvent; 2]> {
        self.cids.take_routing_events()
    }
}

/// The `tls::Context` the session drives during `poll`
struct TlsContext<'a, S: tls::Session> {
    initial: &'a mut Option<InitialSpace<S>>,
    handshake: &'a mut Option<HandshakeSpace<S>>,
    application: &'a mut Option<ApplicationSpace<S>>,
    zero_rtt_keys: &'a mut Option<(S::ZeroRttKey, S::ZeroRttHeaderKey)>,
    peer_params: &'a mut Option<TransportParameters>,
    role: endpoint::Type,
    limits: &'a Limits,
    alpn: &'a mut Option<Bytes>,
    early_data: &'a mut EarlyDataStatus,
    handshake_complete: &'a mut bool,
    original_destination_id: Option<connection::id::InitialId>,
    retry_source_id: Option<PeerId>,
    peer_handshake_scid: Option<PeerId>,
    error: Option<transport::Error>,
}

impl<'a, S: tls::Session> TlsContext<'a, S> {
    fn ack_settings(&self) -> ack::Settings {
        ack::Settings {
            max_ack_delay: self.limits.max_ack_delay,
            ack_delay_exponent: self.limits.ack_delay_exponent,
            ..Default::default()
        }
    }

    fn apply_peer_params(
        &mut self,
        application_parameters: &tls::ApplicationParameters,
    ) -> Result<(), transport::Error> {
        let buffer = quartz_codec::DecoderBuffer::new(application_parameters.transport_parameters);
        let params = TransportParameters::decode(buffer, self.role.peer_type())?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
        //# An endpoint MUST treat the absence of the
        //# initial_source_connection_id transport parameter from either
        //# endpoint or the absence of the original_destination_connection_id
        //# transport parameter from the server as a connection error of type
        //# TRANSPORT_PARAMETER_ERROR.
        let initial_scid = params
            .initial_source_connection_id
            .ok_or(transport::Error::TRANSPORT_PARAMETER_ERROR
                .with_reason("missing initial_source_connection_id"))?;

        if let Some(observed) = self.peer_handshake_scid {
            if initial_scid.as_bytes() != observed.as_bytes() {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
                //# An endpoint MUST treat the following as a connection error
                //# of type TRANSPORT_PARAMETER_ERROR or PROTOCOL_VIOLATION:
                //# a mismatch between values received from a peer in these
                //# transport parameters and the value sent in the
                //# corresponding Destination or Source Connection ID fields
                return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                    .with_reason("initial_source_connection_id mismatch"));
            }
        }

        if self.role.is_client() {
            let odcid = params
                .original_destination_connection_id
                .as_ref()
                .ok_or(transport::Error::TRANSPORT_PARAMETER_ERROR
                    .with_reason("missing original_destination_connection_id"))?;
            if let Some(expected) = self.original_destination_id {
                if odcid.as_bytes() != expected.as_bytes() {
                    return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                        .with_reason("original_destination_connection_id mismatch"));
                }
            }

            match (self.retry_source_id, params.retry_source_connection_id.as_ref()) {
                (None, None) => {}
                (Some(expected), Some(sent)) if expected.as_bytes() == sent.as_bytes() => {}
                _ => {
                    return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                        .with_reason("retry_source_connection_id mismatch"));
                }
            }
        }

        *self.peer_params = Some(params);
        Ok(())
    }
}

impl<'a, S: tls::Session> tls::Context<S> for TlsContext<'a, S> {
    fn on_handshake_keys(
        &mut self,
        key: S::HandshakeKey,
        header_key: S::HandshakeHeaderKey,
    ) -> Result<(), transport::Error> {
        if self.handshake.is_none() {
            *self.handshake = Some(HandshakeSpace::new(key, header_key, self.ack_settings()));
        }
        Ok(())
    }

    fn on_zero_rtt_keys(
        &mut self,
        key: S::ZeroRttKey,
        header_key: S::ZeroRttHeaderKey,
        application_parameters: tls::ApplicationParameters,
    ) -> Result<(), transport::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.1
        //# To enable 0-RTT, endpoints store the values of the server's
        //# transport parameters from a connection and apply them to any
        //# 0-RTT packets that are sent in subsequent connections
        if !application_parameters.transport_parameters.is_empty() {
            if let Ok(params) = TransportParameters::decode(
                quartz_codec::DecoderBuffer::new(application_parameters.transport_parameters),
                self.role.peer_type(),
            ) {
                *self.peer_params = Some(params);
            }
        }

        if let Some(space) = self.application.as_mut() {
            space.zero_rtt = Some((key, header_key));
        } else if self.role.is_client() {
            //= https://www.rfc-editor.org/rfc/rfc9001#section-4.6.1
            //# A client that wishes to send 0-RTT packets uses the
            //# early_data extension in the ClientHello message of a
            //# subsequent handshake
            // the application space opens early so 0-RTT packets draw
            // from the same packet number sequence as 1-RTT
            *self.application = Some(ApplicationSpace::new_zero_rtt(
                key,
                header_key,
                self.ack_settings(),
            ));
        } else {
            *self.zero_rtt_keys = Some((key, header_key));
        }
        if matches!(*self.early_data, EarlyDataStatus::None) {
            *self.early_data = EarlyDataStatus::Offered;
        }
        Ok(())
    }

    fn on_one_rtt_keys(
        &mut self,
        key: S::OneRttKey,
        header_key: S::OneRttHeaderKey,
        application_parameters: tls::ApplicationParameters,
    ) -> Result<(), transport::Error> {
        if let Err(error) = self.apply_peer_params(&application_parameters) {
            self.error = Some(error);
            return Err(error);
        }

        match self.application.as_mut() {
            Some(space) => space.install_one_rtt(key, header_key),
            None => {
                let mut space =
                    ApplicationSpace::new_one_rtt(key, header_key, self.ack_settings());
                space.zero_rtt = self.zero_rtt_keys.take();
                *self.application = Some(space);
            }
        }
        Ok(())
    }

    fn on_application_protocol(&mut self, protocol: Bytes) -> Result<(), transport::Error> {
        *self.alpn = Some(protocol);
        Ok(())
    }

    fn on_handshake_complete(&mut self) -> Result<(), transport::Error> {
        *self.handshake_complete = true;
        Ok(())
    }

    fn on_early_data_status(&mut self, status: EarlyDataStatus) -> Result<(), transport::Error> {
        *self.early_data = status;
        Ok(())
    }

    fn receive_initial(&mut self, max_len: Option<usize>) -> Option<Bytes> {
        self.initial
            .as_mut()
            .and_then(|space| space.common.crypto_stream.pop_rx(max_len))
    }

    fn receive_handshake(&mut self, max_len: Option<usize>) -> Option<Bytes> {
        self.handshake
            .as_mut()
            .and_then(|space| space.common.crypto_stream.pop_rx(max_len))
    }

    fn receive_application(&mut self, max_len: Option<usize>) -> Option<Bytes> {
        self.application
            .as_mut()
            .and_then(|space| space.common.crypto_stream.pop_rx(max_len))
    }

    fn can_send_initial(&self) -> bool {
        self.initial.is_some()
    }

    fn send_initial(&mut self, transmission: Bytes) {
        if let Some(space) = self.initial.as_mut() {
            space.common.crypto_stream.push_tx(transmission);
        }
    }

    fn can_send_handshake(&self) -> bool {
        self.handshake.is_some()
    }

    fn send_handshake(&mut self, transmission: Bytes) {
        if let Some(space) = self.handshake.as_mut() {
            space.common.crypto_stream.push_tx(transmission);
        }
    }

    fn can_send_application(&self) -> bool {
        self.application.is_some()
    }

    fn send_application(&mut self, transmission: Bytes) {
        if let Some(space) = self.application.as_mut() {
            space.common.crypto_stream.push_tx(transmission);
        }
    }
}

#[cfg(test)]
mod tests;
