// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{recovery::RttEstimator, time::Timestamp};

//= https://www.rfc-editor.org/rfc/rfc8312#section-4.1
//# W_cubic(t) = C*(t-K)^3 + W_max (Eq. 1)

/// The CUBIC aggressiveness constant, in MSS/second^3
const C: f64 = 0.4;

//= https://www.rfc-editor.org/rfc/rfc8312#section-4.5
//# Parameter beta_cubic SHOULD be set to 0.7.

const BETA_CUBIC: f64 = 0.7;

/// CUBIC (RFC 8312) with the TCP-friendly region; HyStart is not wired
/// in, standard slow start applies below the threshold.
#[derive(Clone, Debug)]
pub struct Cubic {
    congestion_window: f64,
    slow_start_threshold: f64,
    /// Window size before the last reduction, in bytes
    w_max: f64,
    /// Time period until W_cubic regrows to w_max, in seconds
    k: f64,
    /// Start of the current congestion avoidance epoch
    epoch_start: Option<Timestamp>,
    /// Estimate of the window a Reno flow would have
    w_est: f64,
    recovery_start_time: Option<Timestamp>,
    max_datagram_size: u16,
}

impl Cubic {
    pub fn new(max_datagram_size: u16) -> Self {
        Self {
            congestion_window: crate::recovery::initial_congestion_window(max_datagram_size) as f64,
            slow_start_threshold: f64::MAX,
            w_max: 0.0,
            k: 0.0,
            epoch_start: None,
            w_est: 0.0,
            recovery_start_time: None,
            max_datagram_size,
        }
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        self.congestion_window as u32
    }

    #[inline]
    pub fn is_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    #[inline]
    fn minimum_window(&self) -> f64 {
        crate::recovery::minimum_congestion_window(self.max_datagram_size) as f64
    }

    #[inline]
    fn mds(&self) -> f64 {
        self.max_datagram_size as f64
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
        rtt: &RttEstimator,
        now: Timestamp,
        _bytes_in_flight: u32,
    ) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = None;

        if self.is_slow_start() {
            //= https://www.rfc-editor.org/rfc/rfc8312#section-4.8
            //# In the case when CUBIC runs the hybrid slow start [HR08], it may
            //# exit the first slow start without incurring any packet loss
            // standard slow start: one byte of window per byte acked
            self.congestion_window += bytes as f64;
            return;
        }

        self.on_congestion_avoidance(bytes, rtt, now);
    }

    fn on_congestion_avoidance(&mut self, bytes: usize, rtt: &RttEstimator, now: Timestamp) {
        let epoch_start = match self.epoch_start {
            Some(epoch_start) => epoch_start,
            None => {
                //= https://www.rfc-editor.org/rfc/rfc8312#section-4.1
                //# K = cubic_root(W_max*(1-beta_cubic)/C) (Eq. 2)
                // K is computed in MSS units to keep C dimensionless
                let w_max_mss = self.w_max / self.mds();
                self.k = cbrt(w_max_mss * (1.0 - BETA_CUBIC) / C);
                self.w_est = self.congestion_window;
                self.epoch_start = Some(now);
                now
            }
        };

        let t = (now.saturating_duration_since(epoch_start)
            + rtt.min_rtt())
        .as_secs_f64();

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.1
        //# W_cubic(t) = C*(t-K)^3 + W_max (Eq. 1)
        let delta = t - self.k;
        let w_cubic = (C * delta * delta * delta + self.w_max / self.mds()) * self.mds();

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.2
        //# W_est(t) = W_max*beta_cubic +
        //#             [3*(1-beta_cubic)/(1+beta_cubic)] * (t/RTT) (Eq. 4)
        self.w_est += 3.0 * (1.0 - BETA_CUBIC) / (1.0 + BETA_CUBIC)
            * (bytes as f64 / self.congestion_window)
            * self.mds();

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.2
        //# When receiving an ACK in congestion avoidance, if CUBIC is not in
        //# the TCP-friendly region, check whether W_cubic(t) is less than
        //# W_est(t).  If so, CUBIC is in the TCP-friendly region and cwnd
        //# SHOULD be set to W_est(t) at each reception of an ACK.
        if w_cubic < self.w_est {
            self.congestion_window = self.congestion_window.max(self.w_est);
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.3
        //# cwnd MUST be incremented by (W_cubic(t+RTT) - cwnd)/cwnd for each
        //# received ACK
        if w_cubic > self.congestion_window {
            let increment =
                (w_cubic - self.congestion_window) / self.congestion_window * bytes as f64;
            self.congestion_window += increment;
        } else {
            // minimal growth keeps the window probing
            self.congestion_window += self.mds() * 0.01 * (bytes as f64 / self.mds());
        }
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

        if persistent_congestion {
            self.congestion_window = self.minimum_window();
            self.w_max = self.congestion_window;
            self.k = 0.0;
            self.epoch_start = None;
            self.recovery_start_time = None;
        }
    }

    pub fn on_explicit_congestion(&mut self, ce_count: u64, now: Timestamp) {
        if ce_count > 0 {
            self.on_congestion_event(now, now);
        }
    }

    fn on_congestion_event(&mut self, sent_time: Timestamp, now: Timestamp) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = Some(now);

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.6
        //# With fast convergence, when a congestion event occurs, before the
        //# window reduction of the congestion window, a flow remembers the last
        //# value of W_max.
        let prior_w_max = self.w_max;
        self.w_max = self.congestion_window;
        if self.w_max < prior_w_max {
            // fast convergence: release bandwidth faster for newcomers
            self.w_max *= (1.0 + BETA_CUBIC) / 2.0;
        }

        self.congestion_window = (self.congestion_window * BETA_CUBIC).max(self.minimum_window());
        self.slow_start_threshold = self.congestion_window;
        self.epoch_start = None;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.max_datagram_size);
    }
}

/// Cube root via Newton's iterations; `f64::cbrt` needs std's libm
fn cbrt(value: f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }

    let mut x = value;
    // normalize the starting point so convergence is quick
    if value > 1.0 {
        x = value / 3.0 + 1.0;
    }

    for _ in 0..32 {
        let next = (2.0 * x + value / (x * x)) / 3.0;
        if (next - x).abs() < 1e-9 {
            return next;
        }
        x = next;
    }

    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;
    use core::time::Duration;

    const MDS: u16 = 1200;

    fn rtt_with(sample_ms: u64) -> RttEstimator {
        let mut rtt = RttEstimator::default();
        rtt.update(
            now(0),
            now(sample_ms * 1000),
            Duration::ZERO,
            crate::packet::number::PacketNumberSpace::ApplicationData,
            false,
        );
        rtt
    }

    #[test]
    fn cbrt_converges() {
        for (value, expected) in [(8.0f64, 2.0f64), (27.0, 3.0), (1.0, 1.0), (1000.0, 10.0)] {
            assert!((cbrt(value) - expected).abs() < 1e-6, "cbrt({value})");
        }
    }

    #[test]
    fn slow_start_until_first_loss() {
        let mut cubic = Cubic::new(MDS);
        let initial = cubic.congestion_window();
        assert!(cubic.is_slow_start());

        cubic.on_packet_acked(now(0), 2400, &rtt_with(50), now(10), 0);
        assert_eq!(cubic.congestion_window(), initial + 2400);
    }

    #[test]
    fn loss_applies_beta() {
        let mut cubic = Cubic::new(MDS);
        let initial = cubic.congestion_window();

        cubic.on_packet_lost(1200, now(10), false, now(100), 0);
        assert!(!cubic.is_slow_start());
        assert_eq!(cubic.congestion_window(), (initial as f64 * 0.7) as u32);
    }

    #[test]
    fn window_regrows_toward_w_max() {
        let mut cubic = Cubic::new(MDS);
        let rtt = rtt_with(30);

        cubic.on_packet_lost(1200, now(10), false, now(1_000_000), 0);
        let reduced = cubic.congestion_window();
        let w_max = (reduced as f64 / 0.7) as u32;

        // feed acks over several simulated seconds
        let mut time = 2_000_000;
        for _ in 0..2_000 {
            cubic.on_packet_acked(now(time), 1200, &rtt, now(time + 1), 0);
            time += 10_000;
        }

        let grown = cubic.congestion_window();
        assert!(grown > reduced, "window should regrow after loss");
        assert!(
            grown > w_max,
            "the cubic function passes w_max given enough time: {grown} <= {w_max}"
        );
    }

    #[test]
    fn persistent_congestion_collapses_to_minimum() {
        let mut cubic = Cubic::new(MDS);
        cubic.on_packet_lost(1200, now(10), true, now(100), 0);
        assert_eq!(
            cubic.congestion_window(),
            crate::recovery::minimum_congestion_window(MDS)
        );
    }
}
