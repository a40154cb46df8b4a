// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Received-packet tracking and ACK generation for one packet number
//! space.

use quartz_quic_core::{
    ack::{AckRanges, Settings},
    frame::Ack,
    inet::{EcnCounts, ExplicitCongestionNotification},
    interval_set::Interval,
    packet::number::{PacketNumber, SlidingWindow, SlidingWindowError},
    time::{Timer, Timestamp},
    varint::VarInt,
};

#[derive(Debug)]
pub struct AckManager {
    settings: Settings,
    ranges: AckRanges,
    dedup: SlidingWindow,
    largest_received: Option<(PacketNumber, Timestamp)>,
    ecn_counts: EcnCounts,
    /// Ack-eliciting packets received since the last ACK went out
    ack_eliciting_unacked: u8,
    /// Arms when the first unacked ack-eliciting packet arrives
    ack_delay_timer: Timer,
    /// A reordered or gap-producing arrival forces an immediate ACK
    immediate: bool,
    /// Anything new to report since the last ACK
    ack_pending: bool,
}

impl AckManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            ranges: AckRanges::new(settings.ack_ranges_limit as usize),
            dedup: SlidingWindow::default(),
            largest_received: None,
            ecn_counts: EcnCounts::default(),
            ack_eliciting_unacked: 0,
            ack_delay_timer: Timer::default(),
            immediate: false,
            ack_pending: false,
            settings,
        }
    }

    #[inline]
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received.map(|(packet_number, _)| packet_number)
    }

    /// Checks a packet number before decryption effort is spent on it
    #[inline]
    pub fn check_duplicate(&self, packet_number: PacketNumber) -> Result<(), SlidingWindowError> {
        self.dedup.check(packet_number)
    }

    /// Records a processed packet. Returns `false` for duplicates.
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        now: Timestamp,
        ack_eliciting: bool,
        ecn: ExplicitCongestionNotification,
    ) -> bool {
        if self.dedup.insert(packet_number).is_err() {
            return false;
        }

        let is_largest = self
            .largest_received
            .map_or(true, |(largest, _)| packet_number > largest);
        if is_largest {
            self.largest_received = Some((packet_number, now));
        } else {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
            //# Similarly, packets marked with the ECN Congestion Experienced (CE)
            //# codepoint in the IP header SHOULD be acknowledged immediately
            // reordered arrival: the peer is probably missing something
            self.immediate = true;
        }

        self.ranges.insert_packet_number(packet_number.as_u64());
        self.ecn_counts.increment(ecn);
        self.ack_pending = true;

        if ecn.congestion_experienced() {
            self.immediate = true;
        }

        if ack_eliciting {
            self.ack_eliciting_unacked = self.ack_eliciting_unacked.saturating_add(1);

            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
            //# an endpoint MUST NOT delay the transmission of an
            //# acknowledgment for more than the time period advertised as
            //# max_ack_delay
            if !self.ack_delay_timer.is_armed() {
                self.ack_delay_timer.set(now + self.settings.max_ack_delay);
            }
        }

        true
    }

    /// Whether an ACK must be sent now (as opposed to piggybacked)
    pub fn ack_required(&self, now: Timestamp) -> bool {
        if self.ack_eliciting_unacked >= self.settings.ack_elicitation_interval {
            return true;
        }

        if self.immediate && self.ack_eliciting_unacked > 0 {
            return true;
        }

        self.ack_delay_timer.is_expired(now)
    }

    /// Whether an ACK is worth adding to a packet that is going out
    /// anyway
    pub fn ack_worthwhile(&self) -> bool {
        self.ack_pending && !self.ranges.is_empty()
    }

    /// Builds the ACK frame for transmission
    pub fn on_transmit(&mut self, now: Timestamp, include_ecn: bool) -> Option<Ack> {
        if self.ranges.is_empty() || !self.ack_pending {
            return None;
        }

        let (_, largest_time) = self.largest_received?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.5
        //# The ACK Delay field is the time the endpoint intentionally
        //# delayed sending the frame, measured from when the largest
        //# acknowledged packet was received
        let ack_delay = self
            .settings
            .encode_ack_delay(now.saturating_duration_since(largest_time));

        let frame = Ack {
            ack_delay,
            ranges: self.ranges.clone(),
            ecn_counts: include_ecn.then_some(self.ecn_counts),
        };

        self.ack_eliciting_unacked = 0;
        self.ack_delay_timer.cancel();
        self.immediate = false;
        self.ack_pending = false;

        Some(frame)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.4
    //# an endpoint can stop acknowledging packets below a threshold once
    //# an ACK frame containing them has itself been acknowledged
    pub fn on_ack_frame_acked(&mut self, largest_acked_in_frame: VarInt) {
        // retain the largest range edge so future ACKs stay anchored
        if let Some(largest) = self.ranges.largest() {
            let limit = largest_acked_in_frame.as_u64().min(largest.saturating_sub(1));
            if limit > 0 {
                self.ranges.remove(Interval::new(0, limit));
            }
        }
    }

    #[inline]
    pub fn next_expiration(&self) -> Option<Timestamp> {
        self.ack_delay_timer.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_quic_core::{packet::number::PacketNumberSpace, time::testing::now};

    const ECN: ExplicitCongestionNotification = ExplicitCongestionNotification::NotEct;

    fn pn(value: u64) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::new(value).unwrap())
    }

    fn manager() -> AckManager {
        AckManager::new(Settings::default())
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut manager = manager();
        assert!(manager.on_packet_received(pn(1), now(0), true, ECN));
        assert!(!manager.on_packet_received(pn(1), now(1), true, ECN));
    }

    #[test]
    fn two_ack_eliciting_packets_force_an_ack() {
        let mut manager = manager();
        manager.on_packet_received(pn(0), now(0), true, ECN);
        assert!(!manager.ack_required(now(1)));

        manager.on_packet_received(pn(1), now(1), true, ECN);
        assert!(manager.ack_required(now(2)));

        let frame = manager.on_transmit(now(2), false).unwrap();
        assert_eq!(frame.largest_acknowledged().as_u64(), 1);
        assert!(!manager.ack_required(now(3)));
    }

    #[test]
    fn max_ack_delay_forces_an_ack() {
        let mut manager = manager();
        manager.on_packet_received(pn(0), now(0), true, ECN);
        assert!(!manager.ack_required(now(10_000)));
        // 25ms default max_ack_delay
        assert!(manager.ack_required(now(25_000)));
    }

    #[test]
    fn reordered_arrival_forces_an_ack() {
        let mut manager = manager();
        manager.on_packet_received(pn(5), now(0), true, ECN);
        manager.on_transmit(now(0), false).unwrap();

        manager.on_packet_received(pn(3), now(1), true, ECN);
        assert!(manager.ack_required(now(2)));
    }

    #[test]
    fn non_eliciting_packets_do_not_force_acks() {
        let mut manager = manager();
        manager.on_packet_received(pn(0), now(0), false, ECN);
        manager.on_packet_received(pn(1), now(1), false, ECN);
        assert!(!manager.ack_required(now(100_000)));
        // but they are reported when something else goes out
        assert!(manager.ack_worthwhile());
    }

    #[test]
    fn ack_of_ack_prunes_ranges() {
        let mut manager = manager();
        for value in 0..10 {
            manager.on_packet_received(pn(value), now(value), true, ECN);
        }
        let frame = manager.on_transmit(now(20), false).unwrap();
        assert_eq!(frame.largest_acknowledged().as_u64(), 9);

        manager.on_ack_frame_acked(VarInt::from_u8(9));
        // the largest edge survives for future packet number anchoring
        manager.on_packet_received(pn(10), now(21), true, ECN);
        let frame = manager.on_transmit(now(22), false).unwrap();
        assert_eq!(frame.ranges.smallest(), Some(9));
    }

    #[test]
    fn ecn_counts_accumulate() {
        let mut manager = manager();
        manager.on_packet_received(pn(0), now(0), true, ExplicitCongestionNotification::Ect0);
        manager.on_packet_received(pn(1), now(1), true, ExplicitCongestionNotification::Ce);

        let frame = manager.on_transmit(now(2), true).unwrap();
        let counts = frame.ecn_counts.unwrap();
        assert_eq!(counts.ect_0_count.as_u64(), 1);
        assert_eq!(counts.ce_count.as_u64(), 1);

        // CE forces immediate feedback
        assert!(manager.immediate || !manager.ack_pending);
    }
}
