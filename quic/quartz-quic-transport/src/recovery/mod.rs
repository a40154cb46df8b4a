// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss recovery for one packet number space: sent-packet records,
//! ack processing, threshold- and time-based loss detection, and the
//! probe timeout.

use quartz_quic_core::{
    ack::Settings,
    frame::Ack,
    inet::EcnCounts,
    packet::number::{PacketNumber, PacketNumberSpace},
    recovery::{
        CongestionController, Controller, RttEstimator, SentPackets, K_PACKET_THRESHOLD,
    },
    stream::StreamId,
    time::{Timer, Timestamp},
    transport,
    varint::VarInt,
};
use smallvec::SmallVec;

/// What a sent packet carried, for ack finalization and loss requeueing
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    /// Largest packet number covered by an ACK frame in this packet
    pub ack_largest: Option<VarInt>,

    /// CRYPTO frame ranges as (offset, len)
    pub crypto: SmallVec<[(u64, u64); 1]>,

    /// STREAM frame ranges as (id, offset, len, fin)
    pub stream: SmallVec<[(StreamId, u64, u64, bool); 2]>,

    /// RESET_STREAM frames by stream
    pub reset_stream: SmallVec<[StreamId; 1]>,

    /// STOP_SENDING frames by stream
    pub stop_sending: SmallVec<[StreamId; 1]>,

    /// A MAX_DATA frame
    pub max_data: bool,

    /// MAX_STREAM_DATA frames by stream
    pub max_stream_data: SmallVec<[StreamId; 1]>,

    /// MAX_STREAMS (bidi, uni)
    pub max_streams_bidi: bool,
    pub max_streams_uni: bool,

    /// NEW_CONNECTION_ID sequence numbers
    pub new_connection_ids: SmallVec<[VarInt; 1]>,

    /// RETIRE_CONNECTION_ID sequence numbers
    pub retire_connection_ids: SmallVec<[VarInt; 1]>,

    /// HANDSHAKE_DONE
    pub handshake_done: bool,

    /// PATH_CHALLENGE / PATH_RESPONSE data
    pub path_challenge: Option<[u8; 8]>,
    pub path_response: Option<[u8; 8]>,
}

impl Manifest {
    /// Whether losing this packet requires anyone to act
    pub fn is_empty(&self) -> bool {
        self.ack_largest.is_none()
            && self.crypto.is_empty()
            && self.stream.is_empty()
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && !self.max_data
            && self.max_stream_data.is_empty()
            && !self.max_streams_bidi
            && !self.max_streams_uni
            && self.new_connection_ids.is_empty()
            && self.retire_connection_ids.is_empty()
            && !self.handshake_done
            && self.path_challenge.is_none()
            && self.path_response.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct PacketDetails {
    pub sent_time: Timestamp,
    pub sent_bytes: u16,
    pub ack_eliciting: bool,
    /// Counted against the congestion window
    pub in_flight: bool,
    pub manifest: Manifest,
}

/// The result of processing one ACK frame
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<(PacketNumber, Manifest)>,
    pub lost: Vec<(PacketNumber, Manifest)>,
    /// The ACK acknowledged at least one ack-eliciting packet
    pub includes_ack_eliciting: bool,
}

#[derive(Debug)]
pub struct Manager {
    space: PacketNumberSpace,
    sent: SentPackets<PacketDetails>,
    largest_sent: Option<PacketNumber>,
    largest_acked: Option<PacketNumber>,
    /// Arrival ECN counts the peer reported last; deltas feed the
    /// congestion controller
    ecn_baseline: EcnCounts,
    loss_timer: Timer,
    pto_timer: Timer,
    time_of_last_ack_eliciting: Option<Timestamp>,
    /// Probes the PTO handler still owes the scheduler
    probes_pending: u8,
}

impl Manager {
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            sent: SentPackets::new(space),
            largest_sent: None,
            largest_acked: None,
            ecn_baseline: EcnCounts::default(),
            loss_timer: Timer::default(),
            pto_timer: Timer::default(),
            time_of_last_ack_eliciting: None,
            probes_pending: 0,
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    /// The largest packet number the peer acknowledged, used for packet
    /// number truncation on send
    #[inline]
    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    #[inline]
    pub fn has_in_flight(&self) -> bool {
        !self.sent.is_empty()
    }

    #[inline]
    pub fn probes_pending(&self) -> u8 {
        self.probes_pending
    }

    pub fn consume_probe(&mut self) {
        self.probes_pending = self.probes_pending.saturating_sub(1);
    }

    pub fn on_packet_sent(
        &mut self,
        packet_number: PacketNumber,
        details: PacketDetails,
        now: Timestamp,
        pto_backoff: u32,
        rtt: &RttEstimator,
        cc: &mut Controller,
    ) {
        if details.in_flight {
            cc.on_packet_sent(now, details.sent_bytes as usize, rtt);
        }

        if details.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(details.sent_time);
            self.arm_pto(now, pto_backoff, rtt);
        }

        self.largest_sent = Some(packet_number);
        self.sent.insert(packet_number, details);
    }

    /// Processes an ACK frame received in this space
    #[allow(clippy::too_many_arguments)]
    pub fn on_ack_frame(
        &mut self,
        frame: &Ack,
        now: Timestamp,
        peer_settings: &Settings,
        handshake_confirmed: bool,
        pto_backoff: &mut u32,
        rtt: &mut RttEstimator,
        cc: &mut Controller,
    ) -> Result<AckOutcome, transport::Error> {
        let largest_in_frame = frame.largest_acknowledged();
        let largest_in_frame = self.space.new_packet_number(largest_in_frame);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.1
        //# An endpoint SHOULD treat receipt of an acknowledgment for a packet
        //# it did not send as a connection error of type PROTOCOL_VIOLATION
        if self
            .largest_sent
            .map_or(true, |largest_sent| largest_in_frame > largest_sent)
        {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("ack for a packet that was never sent"));
        }

        let mut outcome = AckOutcome::default();
        let mut largest_newly_acked: Option<(PacketNumber, Timestamp)> = None;

        for range in frame.ranges.iter() {
            let start = self.space.new_packet_number(
                VarInt::new(range.start).map_err(|_| transport::Error::FRAME_ENCODING_ERROR)?,
            );
            let end = self.space.new_packet_number(
                VarInt::new(range.end).map_err(|_| transport::Error::FRAME_ENCODING_ERROR)?,
            );

            let mut pn = Some(start);
            while let Some(current) = pn {
                if current > end {
                    break;
                }

                if let Some(details) = self.sent.remove(current) {
                    if details.ack_eliciting {
                        outcome.includes_ack_eliciting = true;
                    }
                    if details.in_flight {
                        cc.on_packet_acked(details.sent_time, details.sent_bytes as usize, rtt, now);
                    }
                    if largest_newly_acked.map_or(true, |(pn, _)| current > pn) {
                        largest_newly_acked = Some((current, details.sent_time));
                    }
                    outcome.newly_acked.push((current, details.manifest));
                }

                pn = current.next();
            }
        }

        if self.largest_acked.map_or(true, |acked| largest_in_frame > acked) {
            self.largest_acked = Some(largest_in_frame);
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
        //# An endpoint generates an RTT sample on receiving an ACK frame that
        //# meets the following two conditions:
        //# *  the largest acknowledged packet number is newly acknowledged
        //# *  at least one of the newly acknowledged packets was ack-eliciting
        if let Some((newly_acked_pn, sent_time)) = largest_newly_acked {
            if newly_acked_pn == largest_in_frame && outcome.includes_ack_eliciting {
                let ack_delay = peer_settings.decode_ack_delay(frame.ack_delay);
                rtt.update(sent_time, now, ack_delay, self.space, handshake_confirmed);
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-13.4.2
        //# ECN counts from the peer feed congestion response on CE increase
        if let Some(counts) = &frame.ecn_counts {
            if counts.regressed(&self.ecn_baseline) {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("ECN counts decreased"));
            }
            let ce_delta = counts
                .ce_count
                .as_u64()
                .saturating_sub(self.ecn_baseline.ce_count.as_u64());
            if ce_delta > 0 {
                cc.on_explicit_congestion(ce_delta, now);
            }
            self.ecn_baseline = *counts;
        }

        self.detect_lost_packets(now, rtt, cc, &mut outcome);

        if outcome.includes_ack_eliciting {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
            //# The PTO backoff factor is reset when an acknowledgment is
            //# received
            *pto_backoff = 1;
            self.probes_pending = 0;
            self.rearm_timers(now, *pto_backoff, rtt);
        }

        Ok(outcome)
    }

    /// Declares packets lost by packet threshold or time threshold
    fn detect_lost_packets(
        &mut self,
        now: Timestamp,
        rtt: &RttEstimator,
        cc: &mut Controller,
        outcome: &mut AckOutcome,
    ) {
        let largest_acked = match self.largest_acked {
            Some(largest_acked) => largest_acked,
            None => return,
        };

        let loss_threshold = rtt.loss_time_threshold();
        let mut lost: Vec<PacketNumber> = Vec::new();
        let mut next_loss_time: Option<Timestamp> = None;

        for (pn, details) in self.sent.iter() {
            if pn > largest_acked {
                break;
            }

            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
            //# the packet was sent kPacketThreshold packets before an
            //# acknowledged packet
            let by_threshold =
                largest_acked.checked_distance(pn).map_or(false, |gap| gap >= K_PACKET_THRESHOLD);

            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
            //# the packet was sent long enough in the past
            let deadline = details.sent_time + loss_threshold;
            let by_time = deadline.has_elapsed(now);

            if by_threshold || by_time {
                lost.push(pn);
            } else {
                next_loss_time = Some(match next_loss_time {
                    Some(existing) => existing.min(deadline),
                    None => deadline,
                });
            }
        }

        match next_loss_time {
            Some(deadline) => self.loss_timer.set(deadline),
            None => self.loss_timer.cancel(),
        }

        if lost.is_empty() {
            return;
        }

        // persistent congestion: the lost span outlasts the persistent
        // congestion duration
        let mut earliest: Option<Timestamp> = None;
        let mut latest: Option<Timestamp> = None;

        for pn in lost {
            if let Some(details) = self.sent.remove(pn) {
                if details.ack_eliciting {
                    earliest = Some(earliest.map_or(details.sent_time, |e| e.min(details.sent_time)));
                    latest = Some(latest.map_or(details.sent_time, |l| l.max(details.sent_time)));
                }

                if details.in_flight {
                    cc.on_packet_lost(
                        details.sent_bytes as usize,
                        details.sent_time,
                        false,
                        now,
                    );
                }

                tracing::debug!(space = ?self.space, packet_number = pn.as_u64(), "packet lost");
                outcome.lost.push((pn, details.manifest));
            }
        }

        if let (Some(earliest), Some(latest)) = (earliest, latest) {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
            //# A sender establishes persistent congestion after the receipt of
            //# an acknowledgment if two packets that are ack-eliciting are
            //# declared lost, and:
            //# ...the duration between the send times of these two packets
            //# exceeds the persistent congestion duration
            if rtt.first_rtt_sample().map_or(false, |sample| earliest > sample)
                && latest.saturating_duration_since(earliest)
                    > rtt.persistent_congestion_duration()
            {
                cc.on_packet_lost(0, latest, true, now);
            }
        }
    }

    fn arm_pto(&mut self, now: Timestamp, pto_backoff: u32, rtt: &RttEstimator) {
        let base = self.time_of_last_ack_eliciting.unwrap_or(now);
        self.pto_timer
            .set(base + rtt.pto_period(pto_backoff, self.space));
    }

    fn rearm_timers(&mut self, now: Timestamp, pto_backoff: u32, rtt: &RttEstimator) {
        let has_eliciting_in_flight =
            self.sent.iter().any(|(_, details)| details.ack_eliciting);

        if has_eliciting_in_flight {
            self.arm_pto(now, pto_backoff, rtt);
        } else {
            self.pto_timer.cancel();
        }
    }

    /// Fires expired timers.
    ///
    /// Returns `true` when a PTO expired; one or two probes become due
    /// and the backoff doubles (connection-wide, via `pto_backoff`).
    pub fn on_timeout(
        &mut self,
        now: Timestamp,
        pto_backoff: &mut u32,
        rtt: &mut RttEstimator,
        cc: &mut Controller,
    ) -> (Vec<(PacketNumber, Manifest)>, bool) {
        let mut outcome = AckOutcome::default();

        if self.loss_timer.poll_expiration(now) {
            self.detect_lost_packets(now, rtt, cc, &mut outcome);
        }

        let mut pto_expired = false;
        if self.pto_timer.poll_expiration(now) {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
            //# When a PTO timer expires, a sender MUST send at least one ack-
            //# eliciting packet in the packet number space as a probe.  An
            //# endpoint MAY send up to two full-sized datagrams containing
            //# ack-eliciting packets
            self.probes_pending = 2;
            *pto_backoff = pto_backoff.saturating_mul(2);
            pto_expired = true;
            self.arm_pto(now, *pto_backoff, rtt);
        }

        (outcome.lost, pto_expired)
    }

    /// Empties the space and returns every manifest so the carried
    /// frames can be requeued, e.g. after a 0-RTT rejection
    pub fn take_all_for_retransmission(&mut self, cc: &mut Controller) -> Vec<Manifest> {
        let mut manifests = Vec::new();
        for (_, details) in self.sent.drain() {
            if details.in_flight {
                cc.on_packet_discarded(details.sent_bytes as usize);
            }
            manifests.push(details.manifest);
        }
        self.loss_timer.cancel();
        self.pto_timer.cancel();
        self.probes_pending = 0;
        manifests
    }

    /// Discards the space, returning every record so the congestion
    /// controller can deduct the in-flight bytes
    pub fn discard(&mut self, cc: &mut Controller) {
        for (_, details) in self.sent.drain() {
            if details.in_flight {
                cc.on_packet_discarded(details.sent_bytes as usize);
            }
        }
        self.loss_timer.cancel();
        self.pto_timer.cancel();
        self.probes_pending = 0;
    }

    pub fn next_expiration(&self) -> Option<Timestamp> {
        quartz_quic_core::time::timer::earliest([
            self.loss_timer.deadline(),
            self.pto_timer.deadline(),
        ])
    }
}

#[cfg(test)]
mod tests;
