// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{recovery::RttEstimator, time::Timestamp};

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
//# The sender MUST exit slow start and enter a recovery period when a
//# packet is lost or when the ECN-CE count reported by its peer
//# increases.

/// NewReno, as specified by RFC 9002 section 7
#[derive(Clone, Debug)]
pub struct Reno {
    congestion_window: u32,
    slow_start_threshold: u32,
    /// Packets sent before this time do not change the window when acked
    recovery_start_time: Option<Timestamp>,
    max_datagram_size: u16,
    /// Accumulates sub-MTU increase credit in congestion avoidance
    increase_remainder: u32,
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
//# The multiplicative decrease factor, kLossReductionFactor, is 0.5.

const LOSS_REDUCTION_NUMERATOR: u32 = 1;
const LOSS_REDUCTION_DENOMINATOR: u32 = 2;

impl Reno {
    pub fn new(max_datagram_size: u16) -> Self {
        Self {
            congestion_window: crate::recovery::initial_congestion_window(max_datagram_size),
            slow_start_threshold: u32::MAX,
            recovery_start_time: None,
            max_datagram_size,
            increase_remainder: 0,
        }
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    #[inline]
    pub fn is_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    #[inline]
    fn minimum_window(&self) -> u32 {
        crate::recovery::minimum_congestion_window(self.max_datagram_size)
    }

    #[inline]
    fn in_recovery(&self, sent_time: Timestamp) -> bool {
        self.recovery_start_time
            .map_or(false, |start| sent_time <= start)
    }

    pub fn on_packet_sent(
        &mut self,
        _now: Timestamp,
        _bytes: usize,
        _bytes_in_flight: u32,
        _rtt: &RttEstimator,
    ) {
    }

    pub fn on_packet_acked(
        &mut self,
        sent_time: Timestamp,
        bytes: usize,
        _rtt: &RttEstimator,
        _now: Timestamp,
        _bytes_in_flight: u32,
    ) {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# A recovery period ends and the sender enters congestion avoidance
        //# when a packet sent during the recovery period is acknowledged.
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = None;

        if self.is_slow_start() {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
            //# While a sender is in slow start, the congestion window
            //# increases by the number of bytes acknowledged
            self.congestion_window = self.congestion_window.saturating_add(bytes as u32);
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.3
        //# limit the increase to one maximum datagram size for each
        //# congestion window that is acknowledged
        let increase = (self.max_datagram_size as u64 * bytes as u64
            + self.increase_remainder as u64) as u64;
        self.increase_remainder = (increase % self.congestion_window as u64) as u32;
        self.congestion_window = self
            .congestion_window
            .saturating_add((increase / self.congestion_window as u64) as u32);
    }

    pub fn on_packet_lost(
        &mut self,
        _bytes: usize,
        sent_time: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
        _bytes_in_flight: u32,
    ) {
        self.on_congestion_event(sent_time, now);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
        //# When persistent congestion is declared, the sender's congestion
        //# window MUST be reduced to the minimum congestion window
        if persistent_congestion {
            self.congestion_window = self.minimum_window();
            self.recovery_start_time = None;
            self.increase_remainder = 0;
        }
    }

    pub fn on_explicit_congestion(&mut self, ce_count: u64, now: Timestamp) {
        if ce_count > 0 {
            self.on_congestion_event(now, now);
        }
    }

    fn on_congestion_event(&mut self, sent_time: Timestamp, now: Timestamp) {
        // one reduction per recovery episode
        if self.in_recovery(sent_time) {
            return;
        }

        self.recovery_start_time = Some(now);
        self.congestion_window = (self.congestion_window * LOSS_REDUCTION_NUMERATOR
            / LOSS_REDUCTION_DENOMINATOR)
            .max(self.minimum_window());
        self.slow_start_threshold = self.congestion_window;
        self.increase_remainder = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.max_datagram_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;

    const MDS: u16 = 1200;

    fn rtt() -> RttEstimator {
        RttEstimator::default()
    }

    #[test]
    fn slow_start_increases_by_acked_bytes() {
        let mut reno = Reno::new(MDS);
        let initial = reno.congestion_window();

        reno.on_packet_acked(now(0), 1200, &rtt(), now(10), 0);
        reno.on_packet_acked(now(1), 800, &rtt(), now(11), 0);

        assert!(reno.is_slow_start());
        assert_eq!(reno.congestion_window(), initial + 2000);
    }

    #[test]
    fn loss_halves_the_window_and_sets_ssthresh() {
        let mut reno = Reno::new(MDS);
        let initial = reno.congestion_window();

        reno.on_packet_lost(1200, now(50), false, now(100), 0);

        assert_eq!(reno.congestion_window(), initial / 2);
        assert!(!reno.is_slow_start());

        // further losses from the same recovery episode do not reduce again
        reno.on_packet_lost(1200, now(60), false, now(150), 0);
        assert_eq!(reno.congestion_window(), initial / 2);
    }

    #[test]
    fn acks_of_pre_recovery_packets_do_not_grow_window() {
        let mut reno = Reno::new(MDS);
        reno.on_packet_lost(1200, now(50), false, now(100), 0);
        let window = reno.congestion_window();

        // sent before the recovery started
        reno.on_packet_acked(now(50), 1200, &rtt(), now(200), 0);
        assert_eq!(reno.congestion_window(), window);

        // sent after recovery started: recovery ends, window grows
        reno.on_packet_acked(now(150), 1200, &rtt(), now(250), 0);
        assert!(reno.congestion_window() > window);
    }

    #[test]
    fn congestion_avoidance_grows_one_mds_per_window() {
        let mut reno = Reno::new(MDS);
        // leave slow start
        reno.on_packet_lost(1200, now(0), false, now(0), 0);
        let window = reno.congestion_window();

        // ack one full window's worth of bytes after recovery ends
        let mut acked = 0;
        let mut time = 1_000;
        while acked < window {
            reno.on_packet_acked(now(time), 1200, &rtt(), now(time + 1), 0);
            acked += 1200;
            time += 10;
        }

        // close to one MDS; the window growing mid-round shaves a little
        let grown = reno.congestion_window() - window;
        assert!((1000..=1440).contains(&grown), "grew by {grown}");
    }

    #[test]
    fn persistent_congestion_collapses_to_minimum() {
        let mut reno = Reno::new(MDS);
        reno.on_packet_lost(1200, now(50), true, now(100), 0);
        assert_eq!(
            reno.congestion_window(),
            crate::recovery::minimum_congestion_window(MDS)
        );
    }
}
