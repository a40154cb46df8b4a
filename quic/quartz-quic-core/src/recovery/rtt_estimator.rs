// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{packet::number::PacketNumberSpace, time::Timestamp};
use core::{cmp::max, time::Duration};

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# When no previous RTT is available, the initial RTT
//# SHOULD be set to 333 milliseconds.

pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// The lowest RTT value the estimator will track
pub const MIN_RTT: Duration = Duration::from_micros(1);

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED value of the
//# timer granularity (kGranularity) is 1 millisecond.

pub const K_GRANULARITY: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEstimator {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    /// The peer's max_ack_delay; applied once the handshake is confirmed
    max_ack_delay: Duration,
    first_rtt_sample: Option<Timestamp>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        let initial_rtt = initial_rtt.max(MIN_RTT);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = kInitialRtt
        //# rttvar = kInitialRtt / 2
        Self {
            latest_rtt: initial_rtt,
            min_rtt: initial_rtt,
            smoothed_rtt: initial_rtt,
            rttvar: initial_rtt / 2,
            max_ack_delay: Duration::ZERO,
            first_rtt_sample: None,
        }
    }

    /// Installs the peer's max_ack_delay transport parameter
    pub fn on_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    /// Re-seeds the estimator for a new path, keeping `max_ack_delay`
    pub fn for_new_path(&self, initial_rtt: Duration) -> Self {
        let mut estimator = Self::new(initial_rtt);
        estimator.max_ack_delay = self.max_ack_delay;
        estimator
    }

    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    #[inline]
    pub fn first_rtt_sample(&self) -> Option<Timestamp> {
        self.first_rtt_sample
    }

    /// Processes an RTT sample from a newly acknowledged, ack-eliciting
    /// largest-acked packet
    pub fn update(
        &mut self,
        sent_time: Timestamp,
        now: Timestamp,
        ack_delay: Duration,
        space: PacketNumberSpace,
        handshake_confirmed: bool,
    ) {
        let latest_rtt = now.saturating_duration_since(sent_time).max(MIN_RTT);

        if self.first_rtt_sample.is_none() {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
            //# min_rtt = latest_rtt
            //# smoothed_rtt = latest_rtt
            //# rttvar = latest_rtt / 2
            self.first_rtt_sample = Some(now);
            self.latest_rtt = latest_rtt;
            self.min_rtt = latest_rtt;
            self.smoothed_rtt = latest_rtt;
            self.rttvar = latest_rtt / 2;
            return;
        }

        self.latest_rtt = latest_rtt;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
        //# min_rtt MUST be set to the lesser of min_rtt and latest_rtt
        //# (Section 5.1) on all other samples.
        self.min_rtt = self.min_rtt.min(latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST use the lesser of the acknowledgment delay and the peer's
        //#    max_ack_delay after the handshake is confirmed
        let mut adjusted_ack_delay = ack_delay;
        if handshake_confirmed {
            adjusted_ack_delay = adjusted_ack_delay.min(self.max_ack_delay);
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST NOT subtract the acknowledgment delay from the RTT sample if
        //#    the resulting value is smaller than the min_rtt.
        let mut adjusted_rtt = latest_rtt;
        if self.min_rtt + adjusted_ack_delay <= latest_rtt {
            adjusted_rtt -= adjusted_ack_delay;
        } else if !space.is_application_data() {
            // handshake packets are never delayed on purpose
            adjusted_rtt = latest_rtt;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
        //# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
        //# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample
        let rttvar_sample = if self.smoothed_rtt > adjusted_rtt {
            self.smoothed_rtt - adjusted_rtt
        } else {
            adjusted_rtt - self.smoothed_rtt
        };
        self.rttvar = (self.rttvar * 3 + rttvar_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted_rtt) / 8;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    pub fn pto_period(&self, pto_backoff: u32, space: PacketNumberSpace) -> Duration {
        let mut pto_period = self.smoothed_rtt;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# The PTO period MUST be at least kGranularity, to avoid the timer
        //# expiring immediately.
        pto_period += max(self.rttvar * 4, K_GRANULARITY);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# When the PTO is armed for Initial or Handshake packet number
        //# spaces, the max_ack_delay in the PTO period computation is set to
        //# 0, since the peer is expected to not delay these packets
        //# intentionally; see Section 13.2.1 of [QUIC-TRANSPORT].
        if space.is_application_data() {
            pto_period += self.max_ack_delay;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# Even when there are ack-
        //# eliciting packets in flight in multiple packet number spaces, the
        //# exponential increase in PTO occurs across all spaces to prevent
        //# excess load on the network.
        pto_period * pto_backoff
    }

    /// The loss time threshold: 9/8 * max(smoothed_rtt, latest_rtt),
    /// floored at kGranularity
    pub fn loss_time_threshold(&self) -> Duration {
        let rtt = max(self.smoothed_rtt, self.latest_rtt);
        max(
            rtt * crate::recovery::K_TIME_THRESHOLD_NUMERATOR
                / crate::recovery::K_TIME_THRESHOLD_DENOMINATOR,
            K_GRANULARITY,
        )
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
    //# the persistent congestion duration is:
    //#
    //# (smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay) *
    //#     kPersistentCongestionThreshold
    pub fn persistent_congestion_duration(&self) -> Duration {
        (self.smoothed_rtt + max(self.rttvar * 4, K_GRANULARITY) + self.max_ack_delay)
            * crate::recovery::K_PERSISTENT_CONGESTION_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn first_sample_seeds_the_estimator() {
        let mut estimator = RttEstimator::default();
        estimator.update(
            now(0),
            now(100_000),
            ms(0),
            PacketNumberSpace::Initial,
            false,
        );

        assert_eq!(estimator.latest_rtt(), ms(100));
        assert_eq!(estimator.min_rtt(), ms(100));
        assert_eq!(estimator.smoothed_rtt(), ms(100));
        assert_eq!(estimator.rttvar(), ms(50));
    }

    #[test]
    fn ewma_follows_rfc_weights() {
        let mut estimator = RttEstimator::default();
        estimator.update(now(0), now(100_000), ms(0), PacketNumberSpace::Initial, false);

        // a second sample of 200ms: smoothed = 7/8*100 + 1/8*200 = 112.5ms
        estimator.update(
            now(100_000),
            now(300_000),
            ms(0),
            PacketNumberSpace::Initial,
            false,
        );
        assert_eq!(estimator.smoothed_rtt(), Duration::from_micros(112_500));
        assert_eq!(estimator.min_rtt(), ms(100));
        assert_eq!(estimator.latest_rtt(), ms(200));
    }

    #[test]
    fn ack_delay_is_clamped_after_confirmation() {
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(ms(25));

        estimator.update(now(0), now(100_000), ms(0), PacketNumberSpace::Initial, false);

        // 100ms of claimed delay gets clamped to max_ack_delay
        estimator.update(
            now(0),
            now(300_000),
            ms(100),
            PacketNumberSpace::ApplicationData,
            true,
        );

        // adjusted = 300 - 25 = 275ms
        let expected = (ms(100) * 7 + ms(275)) / 8;
        assert_eq!(estimator.smoothed_rtt(), expected);
    }

    #[test]
    fn pto_period_backoff_and_floor() {
        let estimator = RttEstimator::new(ms(100));
        let base = estimator.pto_period(1, PacketNumberSpace::Initial);
        // 100 + max(4*50, 1) = 300ms
        assert_eq!(base, ms(300));
        assert_eq!(estimator.pto_period(2, PacketNumberSpace::Initial), ms(600));
        assert_eq!(estimator.pto_period(4, PacketNumberSpace::Initial), ms(1200));
    }

    #[test]
    fn pto_includes_max_ack_delay_in_application_space() {
        let mut estimator = RttEstimator::new(ms(100));
        estimator.on_max_ack_delay(ms(25));
        assert_eq!(
            estimator.pto_period(1, PacketNumberSpace::ApplicationData),
            ms(325)
        );
        assert_eq!(estimator.pto_period(1, PacketNumberSpace::Handshake), ms(300));
    }

    #[test]
    fn loss_threshold_uses_nine_eighths() {
        let mut estimator = RttEstimator::default();
        estimator.update(now(0), now(80_000), ms(0), PacketNumberSpace::Initial, false);
        assert_eq!(estimator.loss_time_threshold(), ms(90));
    }
}
