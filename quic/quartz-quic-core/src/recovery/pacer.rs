// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::Timestamp;
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
//# Senders SHOULD limit bursts to the initial congestion window

pub const MAX_BURST_PACKETS: u32 = 10;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
//# Using a value for "N" that is small, but at least 1 (for example,
//# 1.25) ensures that variations in RTT do not result in
//# underutilization of the congestion window.

const N_NUMERATOR: u32 = 5;
const N_DENOMINATOR: u32 = 4;

// The window grows quickly in slow start; pace at twice the window to
// avoid holding growth back, as Linux TCP does
const SLOW_START_N_NUMERATOR: u32 = 2;
const SLOW_START_N_DENOMINATOR: u32 = 1;

/// Spreads packet bursts over time at the congestion controller's rate.
///
/// A burst budget refills whenever the departure-time slot rolls over;
/// sending drains it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pacer {
    /// Bytes remaining in the current burst
    capacity: u32,
    next_departure_time: Option<Timestamp>,
}

impl Pacer {
    /// Records `bytes_sent` and computes the next departure time.
    ///
    /// `rate_bps` is the pacing rate in bytes per second.
    pub fn on_packet_sent(
        &mut self,
        now: Timestamp,
        bytes_sent: usize,
        rate_bps: u64,
        max_datagram_size: u16,
    ) {
        if self.capacity == 0 {
            let burst = MAX_BURST_PACKETS * max_datagram_size as u32;
            let interval = Self::burst_interval(rate_bps, burst);

            self.next_departure_time = Some(match self.next_departure_time {
                Some(time) => (time + interval).max(now),
                None => now,
            });
            self.capacity = burst;
        }

        self.capacity = self.capacity.saturating_sub(bytes_sent as u32);
    }

    /// The earliest time the next packet may leave.
    ///
    /// `None` or a time in the past means "send immediately".
    #[inline]
    pub fn earliest_departure_time(&self) -> Option<Timestamp> {
        self.next_departure_time
    }

    #[inline]
    pub fn is_blocked(&self, now: Timestamp) -> bool {
        matches!(self.next_departure_time, Some(time) if !time.has_elapsed(now))
    }

    /// Resets pacing state, e.g. after a path migration
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The interval between bursts at the given rate
    fn burst_interval(rate_bps: u64, burst_bytes: u32) -> Duration {
        if rate_bps == 0 {
            return Duration::ZERO;
        }

        Duration::from_nanos((burst_bytes as u64 * 1_000_000_000) / rate_bps)
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
    //# rate = N * congestion_window / smoothed_rtt
    /// The default window-based pacing rate in bytes per second
    pub fn rate_from_window(congestion_window: u32, smoothed_rtt: Duration, slow_start: bool) -> u64 {
        let (numerator, denominator) = if slow_start {
            (SLOW_START_N_NUMERATOR, SLOW_START_N_DENOMINATOR)
        } else {
            (N_NUMERATOR, N_DENOMINATOR)
        };

        let rtt_micros = smoothed_rtt.as_micros().max(1) as u64;
        (congestion_window as u64 * 1_000_000 * numerator as u64)
            / (rtt_micros * denominator as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;

    #[test]
    fn bursts_drain_then_block() {
        let mut pacer = Pacer::default();
        let mds: u16 = 1200;
        // 12_000 byte burst at 1.2MB/s refills every 10ms
        let rate = 1_200_000;

        // the first burst departs immediately
        pacer.on_packet_sent(now(0), 12_000, rate, mds);
        assert_eq!(pacer.earliest_departure_time(), Some(now(0)));
        assert!(!pacer.is_blocked(now(0)));

        // the next burst is scheduled one interval out
        pacer.on_packet_sent(now(0), 1, rate, mds);
        assert_eq!(pacer.earliest_departure_time(), Some(now(10_000)));
        assert!(pacer.is_blocked(now(0)));
        assert!(!pacer.is_blocked(now(10_000)));
    }

    #[test]
    fn window_rate_scales_with_rtt() {
        let rate = Pacer::rate_from_window(100_000, core::time::Duration::from_millis(100), false);
        // 1.25 * 100_000 bytes / 100ms = 1.25MB/s
        assert_eq!(rate, 1_250_000);

        let slow_start_rate =
            Pacer::rate_from_window(100_000, core::time::Duration::from_millis(100), true);
        assert_eq!(slow_start_rate, 2_000_000);
    }

    #[test]
    fn zero_rate_never_delays() {
        let mut pacer = Pacer::default();
        pacer.on_packet_sent(now(0), 50_000, 0, 1200);
        pacer.on_packet_sent(now(0), 50_000, 0, 1200);
        assert!(!pacer.is_blocked(now(0)));
    }
}
