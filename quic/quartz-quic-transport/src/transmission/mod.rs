// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The send scheduler: decides what frames go in the next datagram,
//! coalesces packets across encryption levels, and runs the
//! amplification, congestion and pacing gates.

use crate::{
    connection::{Connection, State},
    recovery::{Manifest, PacketDetails},
    space::Common,
};
use quartz_codec::{Encoder as _, EncoderBuffer, EncoderValue};
use quartz_quic_core::{
    crypto::{tls, Key as _},
    frame,
    transport,
    inet::{ExplicitCongestionNotification, SocketAddress},
    packet::{
        encoder::{seal_long_packet, seal_short_packet, LongHeader, ShortHeader},
        PacketKind,
    },
    path::MINIMUM_MAX_DATAGRAM_SIZE,
    recovery::CongestionController as _,
    time::Timestamp,
    varint::VarInt,
};
use smallvec::SmallVec;

/// One outgoing UDP datagram
#[derive(Debug)]
pub struct Outgoing {
    pub remote_address: SocketAddress,
    pub ecn: ExplicitCongestionNotification,
    pub payload: Vec<u8>,
}

/// Headroom assumed for a long header, packet number and AEAD tag when
/// deciding whether a packet is worth starting
const MIN_PACKET_HEADROOM: usize = 96;

impl<S: tls::Session> Connection<S> {
    /// Builds the next outgoing datagram, or `None` when there is
    /// nothing (or no permission) to send.
    pub fn transmit(&mut self, now: Timestamp) -> Option<Outgoing> {
        match self.state {
            State::Closed | State::Draining => None,
            State::Closing => self.transmit_close(now),
            _ => {
                if let Some(probe) = self.transmit_candidate_probe(now) {
                    return Some(probe);
                }
                self.transmit_normal(now)
            }
        }
    }

    fn max_datagram_size(&self) -> usize {
        let mut mtu = self.limits.max_udp_payload_size as usize;
        if let Some(params) = self.peer_params.as_ref() {
            mtu = mtu.min(params.max_udp_payload_size.as_u64() as usize);
        }
        mtu.max(MINIMUM_MAX_DATAGRAM_SIZE as usize)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.1
    //# An endpoint that is closing is not required to process any
    //# received frame... it MAY retransmit the CONNECTION_CLOSE frame in
    //# response, limiting the rate at which it does so
    fn transmit_close(&mut self, now: Timestamp) -> Option<Outgoing> {
        if !self.close_response_pending {
            return None;
        }

        if let Some(last) = self.last_close_sent {
            if now.saturating_duration_since(last) < self.current_pto() {
                return None;
            }
        }

        let reason = self.close_reason.clone()?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.3
        //# A CONNECTION_CLOSE of type 0x1d MUST be replaced by a
        //# CONNECTION_CLOSE of type 0x1c when sending the frame in Initial
        //# or Handshake packets.  Otherwise, information about the
        //# application state might be revealed.  Endpoints MUST clear the
        //# value of the Reason Phrase field and SHOULD use the
        //# APPLICATION_ERROR code when converting to a CONNECTION_CLOSE of
        //# type 0x1c.
        let application_level = self.application.is_some();
        let close_frame = if reason.frame_type.is_none() && !application_level {
            frame::ConnectionClose {
                error_code: transport::Error::APPLICATION_ERROR.code,
                frame_type: Some(VarInt::ZERO),
                reason: None,
            }
        } else {
            frame::ConnectionClose {
                error_code: reason.error.error_code(),
                frame_type: reason.frame_type,
                reason: if reason.reason.is_empty() {
                    None
                } else {
                    Some(reason.reason.as_bytes())
                },
            }
        };

        let mut scratch = vec![0u8; 128];
        let close_len = {
            let mut payload = EncoderBuffer::new(&mut scratch);
            payload.encode(&close_frame);
            payload.len()
        };
        scratch.truncate(close_len);

        let mtu = self.max_datagram_size();
        let mut datagram = vec![0u8; mtu];
        let mut encoder = EncoderBuffer::new(&mut datagram);

        let remote_address = self.paths.active().remote_address;
        let sealed = self.seal_best_effort(&mut encoder, &scratch, now);
        let len = encoder.len();
        drop(encoder);
        if !sealed || len == 0 {
            return None;
        }

        datagram.truncate(len);
        self.close_response_pending = false;
        self.last_close_sent = Some(now);

        Some(Outgoing {
            remote_address,
            ecn: ExplicitCongestionNotification::NotEct,
            payload: datagram,
        })
    }

    /// Seals a payload at the highest installed level, for close frames
    fn seal_best_effort(
        &mut self,
        encoder: &mut EncoderBuffer,
        payload: &[u8],
        _now: Timestamp,
    ) -> bool {
        let scid = self.cids.handshake_local_id();
        let dcid = self.cids.active_remote_id();

        if let Some(space) = self.application.as_mut() {
            if let Some(one_rtt) = space.one_rtt.as_mut() {
                let pn = space.common.next_packet_number();
                let largest_acked = space.common.recovery.largest_acked();
                let header = ShortHeader {
                    destination_connection_id: dcid.as_bytes(),
                    spin_bit: false,
                    key_phase: one_rtt.key_set.key_phase(),
                };
                return seal_short_packet(
                    encoder,
                    header,
                    pn,
                    largest_acked,
                    payload,
                    one_rtt.key_set.active_key_mut(),
                    &one_rtt.header_key,
                )
                .is_ok();
            }
        }

        if let Some(space) = self.handshake.as_mut() {
            let pn = space.common.next_packet_number();
            let largest_acked = space.common.recovery.largest_acked();
            let header = LongHeader {
                kind: PacketKind::Handshake,
                version: quartz_quic_core::packet::version::QUIC_VERSION_1,
                destination_connection_id: dcid.as_bytes(),
                source_connection_id: scid.as_bytes(),
                token: &[],
            };
            return seal_long_packet(
                encoder,
                header,
                pn,
                largest_acked,
                payload,
                None,
                &mut space.key,
                &space.header_key,
            )
            .is_ok();
        }

        if let Some(space) = self.initial.as_mut() {
            let pn = space.common.next_packet_number();
            let largest_acked = space.common.recovery.largest_acked();
            let header = LongHeader {
                kind: PacketKind::Initial,
                version: quartz_quic_core::packet::version::QUIC_VERSION_1,
                destination_connection_id: dcid.as_bytes(),
                source_connection_id: scid.as_bytes(),
                token: &self.initial_token,
            };
            return seal_long_packet(
                encoder,
                header,
                pn,
                largest_acked,
                payload,
                Some(MINIMUM_MAX_DATAGRAM_SIZE as usize),
                &mut space.key,
                &space.header_key,
            )
            .is_ok();
        }

        false
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.1
    //# An endpoint MUST expand datagrams that contain a PATH_CHALLENGE
    //# frame to at least the smallest allowed maximum datagram size of
    //# 1200 bytes
    fn transmit_candidate_probe(&mut self, now: Timestamp) -> Option<Outgoing> {
        let pto = self.current_pto();
        let candidate = self.paths.candidate_mut()?;
        let challenge = candidate.pending_challenge(now)?;
        let remote_address = candidate.remote_address;
        candidate.on_challenge_sent(now, pto);

        let space = self.application.as_mut()?;
        let one_rtt = space.one_rtt.as_mut()?;

        let mut scratch = vec![0u8; 64];
        let payload_len = {
            let mut payload = EncoderBuffer::new(&mut scratch);
            payload.encode(&frame::PathChallenge { data: challenge });
            payload.len()
        };
        scratch.truncate(payload_len);

        let mut datagram = vec![0u8; MINIMUM_MAX_DATAGRAM_SIZE as usize];
        let mut encoder = EncoderBuffer::new(&mut datagram);

        let pn = space.common.next_packet_number();
        let largest_acked = space.common.recovery.largest_acked();
        let dcid = self.cids.active_remote_id();
        let header = ShortHeader {
            destination_connection_id: dcid.as_bytes(),
            spin_bit: false,
            key_phase: one_rtt.key_set.key_phase(),
        };

        // pad the payload so the sealed packet fills the datagram
        let sealed_len = {
            let tag_len = one_rtt.key_set.active_key().tag_len();
            let target = MINIMUM_MAX_DATAGRAM_SIZE as usize;
            let padding = target
                .saturating_sub(header.len() + 4 + payload_len + tag_len);
            let mut padded = scratch.clone();
            padded.extend(core::iter::repeat(0).take(padding));

            seal_short_packet(
                &mut encoder,
                header,
                pn,
                largest_acked,
                &padded,
                one_rtt.key_set.active_key_mut(),
                &one_rtt.header_key,
            )
            .ok()?
        };

        let mut manifest = Manifest::default();
        manifest.path_challenge = Some(challenge);
        let path = self.paths.candidate_mut().expect("candidate exists");
        path.on_bytes_sent(sealed_len);

        space.common.recovery.on_packet_sent(
            pn,
            PacketDetails {
                sent_time: now,
                sent_bytes: sealed_len as u16,
                ack_eliciting: true,
                in_flight: false,
                manifest,
            },
            now,
            self.pto_backoff,
            &path.rtt,
            &mut path.cc,
        );

        datagram.truncate(sealed_len);
        Some(Outgoing {
            remote_address,
            ecn: ExplicitCongestionNotification::NotEct,
            payload: datagram,
        })
    }

    fn transmit_normal(&mut self, now: Timestamp) -> Option<Outgoing> {
        let mtu = self.max_datagram_size();
        let remote_address = self.paths.active().remote_address;

        // the amplification gate caps the datagram outright
        let amp_remaining = self.paths.active().amplification_remaining();
        if amp_remaining == 0 {
            return None;
        }
        let datagram_budget = mtu.min(amp_remaining.min(usize::MAX as u64) as usize);

        let probes_pending = self.probes_pending();
        let congestion_blocked = {
            let path = self.paths.active_mut();
            !path.cc.can_send(now).is_ok()
        };

        let mut datagram = vec![0u8; datagram_budget];
        let mut encoder = EncoderBuffer::new(&mut datagram);
        let ecn = self.egress_ecn();

        self.transmit_initial_packet(now, &mut encoder, congestion_blocked, probes_pending);
        self.transmit_handshake_packet(now, &mut encoder, congestion_blocked, probes_pending);
        self.transmit_application_packet(now, &mut encoder, congestion_blocked, probes_pending);

        let len = encoder.len();
        drop(encoder);
        if len == 0 {
            return None;
        }

        datagram.truncate(len);
        self.paths.active_mut().on_bytes_sent(len);

        Some(Outgoing {
            remote_address,
            ecn,
            payload: datagram,
        })
    }

    fn probes_pending(&self) -> bool {
        let spaces = [
            self.initial.as_ref().map(|s| &s.common),
            self.handshake.as_ref().map(|s| &s.common),
            self.application.as_ref().map(|s| &s.common),
        ];
        spaces
            .into_iter()
            .flatten()
            .any(|common| common.recovery.probes_pending() > 0)
    }

    fn egress_ecn(&self) -> ExplicitCongestionNotification {
        match self.paths.active().ecn {
            crate::path::EcnValidation::Testing | crate::path::EcnValidation::Capable => {
                ExplicitCongestionNotification::Ect0
            }
            _ => ExplicitCongestionNotification::NotEct,
        }
    }

    fn transmit_initial_packet(
        &mut self,
        now: Timestamp,
        encoder: &mut EncoderBuffer,
        congestion_blocked: bool,
        probes_pending: bool,
    ) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# an endpoint MUST expand the payload of all UDP datagrams
        //# carrying ack-eliciting Initial packets to at least the smallest
        //# allowed maximum datagram size of 1200 bytes
        // started only when the datagram can reach the padded size
        if encoder.remaining_capacity() < MINIMUM_MAX_DATAGRAM_SIZE as usize {
            return;
        }

        let role = self.role;
        let scid = self.cids.handshake_local_id();
        let dcid = self.cids.active_remote_id();
        let pto_backoff = self.pto_backoff;
        let path = self.paths.active_mut();

        let space = match self.initial.as_mut() {
            Some(space) => space,
            None => return,
        };

        let Some((payload, manifest, ack_eliciting)) = assemble_handshake_payload(
            &mut space.common,
            now,
            encoder.remaining_capacity().saturating_sub(MIN_PACKET_HEADROOM),
            congestion_blocked,
            probes_pending,
        ) else {
            return;
        };

        let pn = space.common.next_packet_number();
        let largest_acked = space.common.recovery.largest_acked();
        let header = LongHeader {
            kind: PacketKind::Initial,
            version: quartz_quic_core::packet::version::QUIC_VERSION_1,
            destination_connection_id: dcid.as_bytes(),
            source_connection_id: scid.as_bytes(),
            token: &self.initial_token,
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# a client MUST expand the payload of all UDP datagrams carrying
        //# Initial packets to at least the smallest allowed maximum
        //# datagram size of 1200 bytes
        let pad_to = ack_eliciting.then_some(MINIMUM_MAX_DATAGRAM_SIZE as usize);
        let _ = role;

        if let Ok(sealed_len) = seal_long_packet(
            encoder,
            header,
            pn,
            largest_acked,
            &payload,
            pad_to,
            &mut space.key,
            &space.header_key,
        ) {
            space.common.recovery.on_packet_sent(
                pn,
                PacketDetails {
                    sent_time: now,
                    sent_bytes: sealed_len as u16,
                    ack_eliciting,
                    in_flight: ack_eliciting,
                    manifest,
                },
                now,
                pto_backoff,
                &path.rtt,
                &mut path.cc,
            );
        }
    }

    fn transmit_handshake_packet(
        &mut self,
        now: Timestamp,
        encoder: &mut EncoderBuffer,
        congestion_blocked: bool,
        probes_pending: bool,
    ) {
        if encoder.remaining_capacity() < MIN_PACKET_HEADROOM {
            return;
        }

        let scid = self.cids.handshake_local_id();
        let dcid = self.cids.active_remote_id();
        let pto_backoff = self.pto_backoff;
        let path = self.paths.active_mut();

        let space = match self.handshake.as_mut() {
            Some(space) => space,
            None => return,
        };

        let Some((payload, manifest, ack_eliciting)) = assemble_handshake_payload(
            &mut space.common,
            now,
            encoder.remaining_capacity().saturating_sub(MIN_PACKET_HEADROOM),
            congestion_blocked,
            probes_pending,
        ) else {
            return;
        };

        let pn = space.common.next_packet_number();
        let largest_acked = space.common.recovery.largest_acked();
        let header = LongHeader {
            kind: PacketKind::Handshake,
            version: quartz_quic_core::packet::version::QUIC_VERSION_1,
            destination_connection_id: dcid.as_bytes(),
            source_connection_id: scid.as_bytes(),
            token: &[],
        };

        if let Ok(sealed_len) = seal_long_packet(
            encoder,
            header,
            pn,
            largest_acked,
            &payload,
            None,
            &mut space.key,
            &space.header_key,
        ) {
            space.common.recovery.on_packet_sent(
                pn,
                PacketDetails {
                    sent_time: now,
                    sent_bytes: sealed_len as u16,
                    ack_eliciting,
                    in_flight: ack_eliciting,
                    manifest,
                },
                now,
                pto_backoff,
                &path.rtt,
                &mut path.cc,
            );
        }
    }

    fn transmit_application_packet(
        &mut self,
        now: Timestamp,
        encoder: &mut EncoderBuffer,
        congestion_blocked: bool,
        probes_pending: bool,
    ) {
        if encoder.remaining_capacity() < MIN_PACKET_HEADROOM {
            return;
        }
        let has_one_rtt = self
            .application
            .as_ref()
            .map_or(false, |space| space.one_rtt.is_some());
        if !has_one_rtt {
            // a client offering early data sends stream frames under the
            // 0-RTT keys until the handshake installs 1-RTT
            self.transmit_zero_rtt_packet(now, encoder, congestion_blocked);
            return;
        }

        let budget = encoder
            .remaining_capacity()
            .saturating_sub(MIN_PACKET_HEADROOM);

        let Some((payload, manifest, ack_eliciting)) =
            self.assemble_application_payload(now, budget, congestion_blocked, probes_pending)
        else {
            return;
        };

        let dcid = self.cids.active_remote_id();
        let pto_backoff = self.pto_backoff;
        let path = self.paths.active_mut();
        let space = self.application.as_mut().expect("checked above");
        let one_rtt = space.one_rtt.as_mut().expect("checked above");

        let pn = space.common.next_packet_number();
        let largest_acked = space.common.recovery.largest_acked();
        let header = ShortHeader {
            destination_connection_id: dcid.as_bytes(),
            spin_bit: false,
            key_phase: one_rtt.key_set.key_phase(),
        };

        if let Ok(sealed_len) = seal_short_packet(
            encoder,
            header,
            pn,
            largest_acked,
            &payload,
            one_rtt.key_set.active_key_mut(),
            &one_rtt.header_key,
        ) {
            space.common.recovery.on_packet_sent(
                pn,
                PacketDetails {
                    sent_time: now,
                    sent_bytes: sealed_len as u16,
                    ack_eliciting,
                    in_flight: ack_eliciting,
                    manifest,
                },
                now,
                pto_backoff,
                &path.rtt,
                &mut path.cc,
            );

            if let Some(period) = self.limits.keep_alive_period {
                self.keep_alive_timer.set(now + period);
            }
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.6.1
    //# 0-RTT data can be sent to a server that advertised support,
    //# carrying application data in the client's first flight
    fn transmit_zero_rtt_packet(
        &mut self,
        now: Timestamp,
        encoder: &mut EncoderBuffer,
        congestion_blocked: bool,
    ) {
        if congestion_blocked || self.early_data_status().is_rejected() {
            return;
        }
        let has_zero_rtt = self
            .application
            .as_ref()
            .map_or(false, |space| space.zero_rtt.is_some());
        if !has_zero_rtt || !self.role.is_client() {
            return;
        }

        let budget = encoder
            .remaining_capacity()
            .saturating_sub(MIN_PACKET_HEADROOM);

        // 0-RTT carries stream frames only; everything else waits for
        // 1-RTT keys
        let mut scratch = vec![0u8; budget];
        let mut payload = EncoderBuffer::new(&mut scratch);
        let mut manifest = Manifest::default();
        while payload.remaining_capacity() > 24 {
            let Some(id) = self.streams.next_ready() else {
                break;
            };
            let Some(send) = self.streams.send_stream_mut(id) else {
                continue;
            };
            let capacity = payload.remaining_capacity();
            let Some(slice) = send.pop_transmission(capacity.saturating_sub(24)) else {
                break;
            };
            let mut data = Vec::with_capacity(slice.len as usize);
            send.copy_range(slice.offset, slice.len, &mut data);

            payload.encode(&frame::Stream {
                stream_id: id.as_varint(),
                offset: VarInt::new(slice.offset).expect("offsets are varints"),
                is_last_frame: false,
                is_fin: slice.fin,
                data: &data,
            });
            manifest.stream.push((id, slice.offset, slice.len, slice.fin));
        }

        if payload.is_empty() {
            return;
        }
        let len = payload.len();
        scratch.truncate(len);

        let scid = self.cids.handshake_local_id();
        let dcid = self.cids.active_remote_id();
        let pto_backoff = self.pto_backoff;
        let path = self.paths.active_mut();
        let space = self.application.as_mut().expect("checked above");
        let (key, header_key) = space.zero_rtt.as_mut().expect("checked above");

        let pn = space.common.next_packet_number();
        let largest_acked = space.common.recovery.largest_acked();
        let header = LongHeader {
            kind: PacketKind::ZeroRtt,
            version: quartz_quic_core::packet::version::QUIC_VERSION_1,
            destination_connection_id: dcid.as_bytes(),
            source_connection_id: scid.as_bytes(),
            token: &[],
        };

        if let Ok(sealed_len) = seal_long_packet(
            encoder,
            header,
            pn,
            largest_acked,
            &scratch,
            None,
            key,
            header_key,
        ) {
            space.common.recovery.on_packet_sent(
                pn,
                PacketDetails {
                    sent_time: now,
                    sent_bytes: sealed_len as u16,
                    ack_eliciting: true,
                    in_flight: true,
                    manifest,
                },
                now,
                pto_backoff,
                &path.rtt,
                &mut path.cc,
            );
        }
    }

    /// Whether anything beyond acknowledgments wants packet space
    fn has_application_work(&self) -> bool {
        self.ping_pending
            || self.cids.has_pending_frames()
            || self.streams.has_transmission_interest()
            || self
                .application
                .as_ref()
                .map_or(false, |space| {
                    space.handshake_done_pending
                        || space.common.crypto_stream.has_tx_pending()
                        || space.common.recovery.probes_pending() > 0
                })
    }

    /// Frames for the application space, in scheduler priority order
    fn assemble_application_payload(
        &mut self,
        now: Timestamp,
        budget: usize,
        congestion_blocked: bool,
        probes_pending: bool,
    ) -> Option<(Vec<u8>, Manifest, bool)> {
        let mut scratch = vec![0u8; budget];
        let mut payload = EncoderBuffer::new(&mut scratch);
        let mut manifest = Manifest::default();
        let mut ack_eliciting = false;

        // 1. ACK: standalone when the ack rules demand one, piggybacked
        // whenever this packet goes out anyway
        {
            let include_ecn = !self.limits.ecn_disabled;
            let other_work = self.has_application_work();
            let space = self.application.as_mut()?;
            let ack_due = space.common.ack_manager.ack_required(now);
            if ack_due || (other_work && space.common.ack_manager.ack_worthwhile()) {
                if let Some(ack) = space.common.ack_manager.on_transmit(now, include_ecn) {
                    if ack.encoding_size() <= payload.remaining_capacity() {
                        manifest.ack_largest = Some(ack.largest_acknowledged());
                        payload.encode(&ack);
                    }
                }
            }
        }

        let sending_allowed = !congestion_blocked || probes_pending;

        if sending_allowed {
            // 2. CRYPTO (post-handshake TLS messages)
            {
                let space = self.application.as_mut()?;
                while space.common.crypto_stream.has_tx_pending() {
                    let frame_overhead = 16;
                    let room = payload
                        .remaining_capacity()
                        .saturating_sub(frame_overhead);
                    if room == 0 {
                        break;
                    }
                    let Some((offset, data)) = space.common.crypto_stream.pop_tx(room) else {
                        break;
                    };
                    let frame = frame::Crypto { offset, data };
                    manifest.crypto.push((offset.as_u64(), data.len() as u64));
                    payload.encode(&frame);
                    ack_eliciting = true;
                }
            }

            // 3. HANDSHAKE_DONE
            {
                let space = self.application.as_mut()?;
                if space.handshake_done_pending && payload.remaining_capacity() >= 1 {
                    space.handshake_done_pending = false;
                    payload.encode(&frame::HandshakeDone);
                    manifest.handshake_done = true;
                    ack_eliciting = true;
                }
            }

            // 4. connection ID maintenance
            let reset_token_key = self.reset_token_key;
            self.cids.replenish_local(&mut *self.random, &reset_token_key);
            while payload.remaining_capacity() >= 2 {
                let Some(sequence) = self.cids.take_retire_frame() else {
                    break;
                };
                payload.encode(&frame::RetireConnectionId {
                    sequence_number: sequence,
                });
                manifest.retire_connection_ids.push(sequence);
                ack_eliciting = true;
            }
            while payload.remaining_capacity() >= 44 {
                let Some((sequence, id, token)) = self.cids.take_new_id_frame() else {
                    break;
                };
                payload.encode(&frame::NewConnectionId {
                    sequence_number: sequence,
                    retire_prior_to: VarInt::ZERO,
                    connection_id: id.as_bytes(),
                    stateless_reset_token: token.as_bytes(),
                });
                manifest.new_connection_ids.push(sequence);
                ack_eliciting = true;
            }

            // 5. flow control updates
            if let Some(maximum_data) = self.rx_flow.take_max_data() {
                if payload.remaining_capacity() >= 9 {
                    payload.encode(&frame::MaxData { maximum_data });
                    manifest.max_data = true;
                    ack_eliciting = true;
                } else {
                    self.rx_flow.on_frame_lost();
                }
            }

            let mut control = Vec::new();
            self.streams.pending_control_frames(&mut control);
            for frame in control {
                if payload.remaining_capacity() < 24 {
                    // hand it back rather than dropping it on the floor
                    self.streams.requeue_control_frame(frame);
                    continue;
                }
                ack_eliciting = true;
                match frame {
                    crate::stream::StreamControlFrame::ResetStream(id, code, final_size) => {
                        payload.encode(&frame::ResetStream {
                            stream_id: id.as_varint(),
                            application_error_code: code,
                            final_size: VarInt::new(final_size)
                                .expect("stream offsets are varints"),
                        });
                        manifest.reset_stream.push(id);
                    }
                    crate::stream::StreamControlFrame::StopSending(id, code) => {
                        payload.encode(&frame::StopSending {
                            stream_id: id.as_varint(),
                            application_error_code: code,
                        });
                        manifest.stop_sending.push(id);
                    }
                    crate::stream::StreamControlFrame::MaxStreamData(id, limit) => {
                        payload.encode(&frame::MaxStreamData {
                            stream_id: id.as_varint(),
                            maximum_stream_data: limit,
                        });
                        manifest.max_stream_data.push(id);
                    }
                    crate::stream::StreamControlFrame::StreamDataBlocked(id, limit) => {
                        payload.encode(&frame::StreamDataBlocked {
                            stream_id: id.as_varint(),
                            stream_data_limit: limit,
                        });
                    }
                    crate::stream::StreamControlFrame::MaxStreams(stream_type, limit) => {
                        payload.encode(&frame::MaxStreams {
                            stream_type,
                            maximum_streams: limit,
                        });
                        match stream_type {
                            quartz_quic_core::stream::StreamType::Bidirectional => {
                                manifest.max_streams_bidi = true
                            }
                            quartz_quic_core::stream::StreamType::Unidirectional => {
                                manifest.max_streams_uni = true
                            }
                        }
                    }
                    crate::stream::StreamControlFrame::StreamsBlocked(stream_type, limit) => {
                        payload.encode(&frame::StreamsBlocked {
                            stream_type,
                            stream_limit: limit,
                        });
                    }
                }
            }

            if let Some(limit) = self.tx_flow.take_blocked() {
                if payload.remaining_capacity() >= 9 {
                    payload.encode(&frame::DataBlocked { data_limit: limit });
                    ack_eliciting = true;
                }
            }

            // 6. PATH_RESPONSE, then PATH_CHALLENGE for the active path
            while payload.remaining_capacity() >= 9 {
                let Some(data) = self.paths.take_path_response() else {
                    break;
                };
                payload.encode(&frame::PathResponse { data });
                manifest.path_response = Some(data);
                ack_eliciting = true;
            }
            {
                let pto = self.current_pto();
                let path = self.paths.active_mut();
                if let Some(data) = path.pending_challenge(now) {
                    if payload.remaining_capacity() >= 9 {
                        path.on_challenge_sent(now, pto);
                        payload.encode(&frame::PathChallenge { data });
                        manifest.path_challenge = Some(data);
                        ack_eliciting = true;
                    }
                }
            }

            // 7. stream data, round-robin; connection flow control was
            // charged when the application handed the data over
            let mut visited: SmallVec<[quartz_quic_core::stream::StreamId; 4]> = SmallVec::new();
            while payload.remaining_capacity() > 8 {
                let Some(id) = self.streams.next_ready() else {
                    break;
                };
                if visited.contains(&id) {
                    break;
                }
                visited.push(id);

                let Some(send) = self.streams.send_stream_mut(id) else {
                    continue;
                };

                let mut probe = frame::Stream {
                    stream_id: id.as_varint(),
                    offset: VarInt::ZERO,
                    is_last_frame: false,
                    is_fin: false,
                    data: &[],
                };

                // reserve room for the frame header before picking a range
                let capacity = payload.remaining_capacity();
                let Some(slice) = send.pop_transmission(capacity.saturating_sub(24)) else {
                    continue;
                };

                let mut data = Vec::with_capacity(slice.len as usize);
                send.copy_range(slice.offset, slice.len, &mut data);

                probe.offset = VarInt::new(slice.offset).expect("offsets are varints");
                probe.is_fin = slice.fin;
                probe.data = &data;

                payload.encode(&probe);
                manifest
                    .stream
                    .push((id, slice.offset, slice.len, slice.fin));
                ack_eliciting = true;
            }
        }

        // 8. PING when a probe or keep-alive demands an eliciting packet
        if !ack_eliciting && (probes_pending || self.ping_pending) && payload.remaining_capacity() >= 1 {
            payload.encode(&frame::Ping);
            self.ping_pending = false;
            ack_eliciting = true;
        }

        if payload.is_empty() {
            return None;
        }

        if ack_eliciting {
            if let Some(space) = self.application.as_mut() {
                space.common.recovery.consume_probe();
            }
        }

        let len = payload.len();
        scratch.truncate(len);
        Some((scratch, manifest, ack_eliciting))
    }
}

/// ACK + CRYPTO + probe PING assembly shared by the Initial and
/// Handshake spaces
fn assemble_handshake_payload(
    common: &mut Common,
    now: Timestamp,
    budget: usize,
    congestion_blocked: bool,
    probes_pending: bool,
) -> Option<(Vec<u8>, Manifest, bool)> {
    if budget < 32 {
        return None;
    }

    let mut scratch = vec![0u8; budget];
    let mut payload = EncoderBuffer::new(&mut scratch);
    let mut manifest = Manifest::default();
    let mut ack_eliciting = false;

    let ack_due = common.ack_manager.ack_required(now);
    let crypto_due = common.crypto_stream.has_tx_pending();
    let probe_due = common.recovery.probes_pending() > 0;

    if !(ack_due || crypto_due || probe_due || common.ack_manager.ack_worthwhile()) {
        return None;
    }

    // handshake spaces never report ECN counts; they are too short-lived
    if ack_due || common.ack_manager.ack_worthwhile() {
        if let Some(ack) = common.ack_manager.on_transmit(now, false) {
            if ack.encoding_size() <= payload.remaining_capacity() {
                manifest.ack_largest = Some(ack.largest_acknowledged());
                payload.encode(&ack);
            }
        }
    }

    if !congestion_blocked || probe_due || probes_pending {
        while common.crypto_stream.has_tx_pending() {
            let room = payload.remaining_capacity().saturating_sub(16);
            if room == 0 {
                break;
            }
            let Some((offset, data)) = common.crypto_stream.pop_tx(room) else {
                break;
            };
            manifest.crypto.push((offset.as_u64(), data.len() as u64));
            let frame = frame::Crypto { offset, data };
            payload.encode(&frame);
            ack_eliciting = true;
        }
    }

    if !ack_eliciting && probe_due && payload.remaining_capacity() >= 1 {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
        //# When there is no data to send, the sender SHOULD send a PING or
        //# other ack-eliciting frame in a single packet
        payload.encode(&frame::Ping);
        ack_eliciting = true;
    }

    if payload.is_empty() {
        return None;
    }

    if ack_eliciting && probe_due {
        common.recovery.consume_probe();
    }

    let len = payload.len();
    scratch.truncate(len);
    Some((scratch, manifest, ack_eliciting))
}
