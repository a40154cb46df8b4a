// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! BBR congestion control, versions 1 through 3.
//!
//! One state machine covers all three: v1 is the classic
//! Startup/Drain/ProbeBW/ProbeRTT loop with the 8-phase gain cycle, v2
//! adds the inflight_hi/inflight_lo bounds driven by loss and ECN-CE,
//! and v3 replaces the gain cycle with the Down/Cruise/Refill/Up
//! sub-state machine.

use crate::{recovery::RttEstimator, time::Timestamp};
use core::time::Duration;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
    V3,
}

/// ProbeBW sub-states; v1/v2 map their gain cycle onto these names
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CyclePhase {
    Down,
    Cruise,
    Refill,
    Up,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Startup,
    Drain,
    ProbeBw(CyclePhase),
    ProbeRtt,
}

/// 2/ln(2), the startup growth gain, in percent
const STARTUP_GAIN_PCT: u64 = 277;
/// ln(2)/2, draining the startup queue
const DRAIN_GAIN_PCT: u64 = 36;
const PROBE_UP_GAIN_PCT: u64 = 125;
const PROBE_DOWN_GAIN_PCT: u64 = 90;
const CRUISE_GAIN_PCT: u64 = 100;
const STARTUP_CWND_GAIN_PCT: u64 = 200;
const PROBE_BW_CWND_GAIN_PCT: u64 = 200;

/// Max-bandwidth filter length, in rounds
const BW_FILTER_LEN: u64 = 10;

/// Rounds without 25% growth before the pipe counts as full
const FULL_BW_ROUNDS: u32 = 3;
const FULL_BW_GROWTH_NUMERATOR: u64 = 5;
const FULL_BW_GROWTH_DENOMINATOR: u64 = 4;

const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
const PROBE_RTT_CWND_PACKETS: u32 = 4;

/// inflight_hi reduction on loss (v2/v3)
const BETA_LOSS_PCT: u64 = 90;
/// inflight_hi reduction on ECN-CE (v2/v3)
const BETA_ECN_PCT: u64 = 85;

/// v1 ProbeBW pacing gain cycle, in percent
const V1_GAIN_CYCLE: [u64; 8] = [125, 75, 100, 100, 100, 100, 100, 100];

/// A windowed max filter over (round, bandwidth) samples
#[derive(Clone, Debug, Default)]
struct MaxBandwidthFilter {
    samples: SmallVec<[(u64, u64); 4]>,
}

impl MaxBandwidthFilter {
    fn update(&mut self, round: u64, bandwidth: u64) {
        self.samples
            .retain(|(sample_round, _)| round.saturating_sub(*sample_round) < BW_FILTER_LEN);

        match self.samples.iter_mut().find(|(r, _)| *r == round) {
            Some((_, value)) => *value = (*value).max(bandwidth),
            None => self.samples.push((round, bandwidth)),
        }
    }

    fn max(&self) -> u64 {
        self.samples
            .iter()
            .map(|(_, bandwidth)| *bandwidth)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct Bbr {
    version: Version,
    state: State,
    max_datagram_size: u16,

    congestion_window: u32,
    /// cwnd saved on ProbeRTT entry, restored on exit
    prior_cwnd: u32,

    bw_filter: MaxBandwidthFilter,
    round_count: u64,
    round_start_time: Option<Timestamp>,
    bytes_acked_in_round: u64,

    full_bw: u64,
    full_bw_count: u32,
    filled_pipe: bool,

    min_rtt: Option<Duration>,
    min_rtt_timestamp: Option<Timestamp>,
    probe_rtt_done_time: Option<Timestamp>,

    /// v1 gain cycle position
    cycle_index: usize,
    phase_start_time: Option<Timestamp>,

    /// Upper/lower inflight bounds (v2/v3); v1 leaves them unbounded
    inflight_hi: u64,
    inflight_lo: u64,
}

impl Bbr {
    pub fn new(version: Version, max_datagram_size: u16) -> Self {
        Self {
            version,
            state: State::Startup,
            max_datagram_size,
            congestion_window: crate::recovery::initial_congestion_window(max_datagram_size),
            prior_cwnd: 0,
            bw_filter: MaxBandwidthFilter::default(),
            round_count: 0,
            round_start_time: None,
            bytes_acked_in_round: 0,
            full_bw: 0,
            full_bw_count: 0,
            filled_pipe: false,
            min_rtt: None,
            min_rtt_timestamp: None,
            probe_rtt_done_time: None,
            cycle_index: 0,
            phase_start_time: None,
            inflight_hi: u64::MAX,
            inflight_lo: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    #[inline]
    pub fn is_slow_start(&self) -> bool {
        matches!(self.state, State::Startup)
    }

    #[inline]
    fn mds(&self) -> u64 {
        self.max_datagram_size as u64
    }

    #[inline]
    fn minimum_window(&self) -> u32 {
        crate::recovery::minimum_congestion_window(self.max_datagram_size)
    }

    /// The estimated bandwidth-delay product in bytes
    fn bdp(&self) -> u64 {
        let bw = self.bw_filter.max();
        let min_rtt = self.min_rtt.unwrap_or(Duration::from_millis(333));
        let bdp = bw.saturating_mul(min_rtt.as_micros() as u64) / 1_000_000;
        bdp.max(self.mds() * 4)
    }

    fn pacing_gain_pct(&self) -> u64 {
        match self.state {
            State::Startup => STARTUP_GAIN_PCT,
            State::Drain => DRAIN_GAIN_PCT,
            State::ProbeRtt => CRUISE_GAIN_PCT,
            State::ProbeBw(phase) => match self.version {
                Version::V1 => V1_GAIN_CYCLE[self.cycle_index],
                _ => match phase {
                    CyclePhase::Down => PROBE_DOWN_GAIN_PCT,
                    CyclePhase::Cruise | CyclePhase::Refill => CRUISE_GAIN_PCT,
                    CyclePhase::Up => PROBE_UP_GAIN_PCT,
                },
            },
        }
    }

    pub fn pacing_rate_bps(&self, rtt: &RttEstimator) -> u64 {
        let bw = self.bw_filter.max();
        if bw == 0 {
            // no bandwidth sample yet: pace off the initial window
            return crate::recovery::Pacer::rate_from_window(
                self.congestion_window,
                rtt.smoothed_rtt(),
                true,
            );
        }

        bw * self.pacing_gain_pct() / 100
    }

    pub fn on_packet_sent(
        &mut self,
        now: Timestamp,
        _bytes: usize,
        _bytes_in_flight: u32,
        _rtt: &RttEstimator,
    ) {
        if self.round_start_time.is_none() {
            self.round_start_time = Some(now);
        }
        if self.phase_start_time.is_none() {
            self.phase_start_time = Some(now);
        }
    }

    pub fn on_packet_acked(
        &mut self,
        _sent_time: Timestamp,
        bytes: usize,
        rtt: &RttEstimator,
        now: Timestamp,
        bytes_in_flight: u32,
    ) {
        self.bytes_acked_in_round += bytes as u64;

        self.update_min_rtt(rtt, now);
        let round_start = self.update_round(rtt, now);

        if round_start {
            self.check_full_pipe();
        }

        self.advance_state(now, bytes_in_flight, rtt);
        self.update_congestion_window(bytes, now);
    }

    fn update_round(&mut self, rtt: &RttEstimator, now: Timestamp) -> bool {
        let round_start_time = match self.round_start_time {
            Some(time) => time,
            None => {
                self.round_start_time = Some(now);
                return false;
            }
        };

        let round_trip = rtt.smoothed_rtt().max(Duration::from_micros(1));
        if now.saturating_duration_since(round_start_time) < round_trip {
            return false;
        }

        // one round ended; fold its delivery rate into the filter
        let elapsed = now.saturating_duration_since(round_start_time);
        let sample_bps =
            self.bytes_acked_in_round.saturating_mul(1_000_000) / elapsed.as_micros().max(1) as u64;

        self.round_count += 1;
        self.bw_filter.update(self.round_count, sample_bps);
        self.round_start_time = Some(now);
        self.bytes_acked_in_round = 0;

        true
    }

    fn update_min_rtt(&mut self, rtt: &RttEstimator, now: Timestamp) {
        let latest = rtt.latest_rtt();

        let expired = self
            .min_rtt_timestamp
            .map_or(true, |at| now.saturating_duration_since(at) > MIN_RTT_WINDOW);

        if expired || self.min_rtt.map_or(true, |min| latest <= min) {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
            //# min_rtt is the sender's estimate of the minimum RTT
            self.min_rtt = Some(latest);
            self.min_rtt_timestamp = Some(now);
        }

        if expired && !matches!(self.state, State::ProbeRtt) {
            self.enter_probe_rtt(now);
        }
    }

    fn enter_probe_rtt(&mut self, now: Timestamp) {
        self.state = State::ProbeRtt;
        self.prior_cwnd = self.congestion_window;
        self.probe_rtt_done_time = Some(now + PROBE_RTT_DURATION);
    }

    fn exit_probe_rtt(&mut self, now: Timestamp) {
        self.congestion_window = self.congestion_window.max(self.prior_cwnd);
        self.min_rtt_timestamp = Some(now);
        if self.filled_pipe {
            self.enter_probe_bw(now);
        } else {
            self.state = State::Startup;
        }
    }

    fn enter_probe_bw(&mut self, now: Timestamp) {
        self.state = State::ProbeBw(CyclePhase::Down);
        self.cycle_index = 0;
        self.phase_start_time = Some(now);
    }

    fn check_full_pipe(&mut self) {
        if self.filled_pipe {
            return;
        }

        let max_bw = self.bw_filter.max();
        if max_bw.saturating_mul(FULL_BW_GROWTH_DENOMINATOR)
            >= self.full_bw.saturating_mul(FULL_BW_GROWTH_NUMERATOR)
        {
            // still growing by at least 25% per round
            self.full_bw = max_bw;
            self.full_bw_count = 0;
            return;
        }

        self.full_bw_count += 1;
        if self.full_bw_count >= FULL_BW_ROUNDS {
            self.filled_pipe = true;
        }
    }

    fn advance_state(&mut self, now: Timestamp, bytes_in_flight: u32, rtt: &RttEstimator) {
        match self.state {
            State::Startup => {
                if self.filled_pipe {
                    self.state = State::Drain;
                }
            }
            State::Drain => {
                //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3
                //# a sender exits the drain state once in-flight data drops to
                //# the estimated bandwidth-delay product
                if (bytes_in_flight as u64) <= self.bdp() {
                    self.enter_probe_bw(now);
                }
            }
            State::ProbeBw(phase) => self.advance_probe_bw(phase, now, bytes_in_flight, rtt),
            State::ProbeRtt => {
                if self
                    .probe_rtt_done_time
                    .map_or(false, |done| done.has_elapsed(now))
                {
                    self.exit_probe_rtt(now);
                }
            }
        }
    }

    fn advance_probe_bw(
        &mut self,
        phase: CyclePhase,
        now: Timestamp,
        bytes_in_flight: u32,
        rtt: &RttEstimator,
    ) {
        let min_rtt = self
            .min_rtt
            .unwrap_or(rtt.smoothed_rtt())
            .max(Duration::from_micros(1));
        let phase_start = match self.phase_start_time {
            Some(time) => time,
            None => {
                self.phase_start_time = Some(now);
                return;
            }
        };
        let elapsed = now.saturating_duration_since(phase_start);

        if matches!(self.version, Version::V1) {
            // the classic 8-phase gain cycle, one phase per min_rtt;
            // leave the 0.75 phase as soon as the queue has drained
            let advance = if self.cycle_index == 1 {
                elapsed >= min_rtt || (bytes_in_flight as u64) <= self.bdp()
            } else {
                elapsed >= min_rtt
            };

            if advance {
                self.cycle_index = (self.cycle_index + 1) % V1_GAIN_CYCLE.len();
                self.phase_start_time = Some(now);
                self.state = State::ProbeBw(match self.cycle_index {
                    0 => CyclePhase::Up,
                    1 => CyclePhase::Down,
                    _ => CyclePhase::Cruise,
                });
            }
            return;
        }

        // v2/v3 sub-state machine
        let next = match phase {
            CyclePhase::Down => {
                if (bytes_in_flight as u64) <= self.bdp() || elapsed >= min_rtt {
                    Some(CyclePhase::Cruise)
                } else {
                    None
                }
            }
            CyclePhase::Cruise => {
                // cruise for a while before probing again
                if elapsed >= min_rtt * 4 {
                    Some(CyclePhase::Refill)
                } else {
                    None
                }
            }
            CyclePhase::Refill => {
                if elapsed >= min_rtt {
                    // refill complete; raise inflight_lo back up
                    self.inflight_lo = 0;
                    Some(CyclePhase::Up)
                } else {
                    None
                }
            }
            CyclePhase::Up => {
                if elapsed >= min_rtt && (bytes_in_flight as u64) >= self.inflight_target() {
                    Some(CyclePhase::Down)
                } else if elapsed >= min_rtt * 4 {
                    Some(CyclePhase::Down)
                } else {
                    None
                }
            }
        };

        if let Some(next) = next {
            self.state = State::ProbeBw(next);
            self.phase_start_time = Some(now);
        }
    }

    fn cwnd_gain_pct(&self) -> u64 {
        match self.state {
            State::Startup | State::Drain => STARTUP_CWND_GAIN_PCT,
            _ => PROBE_BW_CWND_GAIN_PCT,
        }
    }

    /// cwnd target: cwnd_gain * BDP, bounded by inflight_hi in v2/v3
    fn inflight_target(&self) -> u64 {
        let target = self.bdp().saturating_mul(self.cwnd_gain_pct()) / 100;
        match self.version {
            Version::V1 => target,
            _ => target.min(self.inflight_hi),
        }
    }

    fn update_congestion_window(&mut self, acked_bytes: usize, now: Timestamp) {
        if matches!(self.state, State::ProbeRtt) {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3
            //# ProbeRTT reduces in-flight data so queues drain and min_rtt
            //# samples reflect the propagation delay
            let floor = PROBE_RTT_CWND_PACKETS * self.max_datagram_size as u32;
            self.congestion_window = self.congestion_window.min(floor.max(self.minimum_window()));
            let _ = now;
            return;
        }

        let target = self.inflight_target();

        if self.filled_pipe {
            self.congestion_window = (self.congestion_window as u64)
                .saturating_add(acked_bytes as u64)
                .min(target)
                .max(self.minimum_window() as u64) as u32;
        } else {
            // startup: grow unconditionally, the full-pipe check will stop us
            self.congestion_window = self
                .congestion_window
                .saturating_add(acked_bytes as u32)
                .max(self.minimum_window());
        }
    }

    pub fn on_packet_lost(
        &mut self,
        bytes: usize,
        _sent_time: Timestamp,
        persistent_congestion: bool,
        _now: Timestamp,
        bytes_in_flight: u32,
    ) {
        if persistent_congestion {
            self.congestion_window = self.minimum_window();
            return;
        }

        if matches!(self.version, Version::V1) {
            // v1 reacts to loss only through its (simplified) recovery
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7
        //# loss is treated as a signal that the current inflight volume
        //# overshoots the path's capacity
        let current = self
            .inflight_hi
            .min(bytes_in_flight as u64 + bytes as u64)
            .max(self.bdp());
        self.inflight_hi = current.saturating_mul(BETA_LOSS_PCT) / 100;
        self.inflight_lo = self.inflight_lo.min(self.inflight_hi);

        // probing upward is over for this cycle
        if matches!(self.state, State::ProbeBw(CyclePhase::Up)) {
            self.state = State::ProbeBw(CyclePhase::Down);
        }

        self.congestion_window = self
            .congestion_window
            .min(self.inflight_hi.min(u32::MAX as u64) as u32)
            .max(self.minimum_window());
    }

    pub fn on_explicit_congestion(&mut self, ce_count: u64, _now: Timestamp) {
        if ce_count == 0 || matches!(self.version, Version::V1) {
            return;
        }

        let current = self.inflight_hi.min(self.congestion_window as u64);
        self.inflight_hi = current.saturating_mul(BETA_ECN_PCT) / 100;
        self.congestion_window = self
            .congestion_window
            .min(self.inflight_hi.min(u32::MAX as u64) as u32)
            .max(self.minimum_window());
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.version, self.max_datagram_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;

    const MDS: u16 = 1200;

    fn rtt_estimator(rtt_ms: u64) -> RttEstimator {
        let mut rtt = RttEstimator::default();
        rtt.update(
            now(0),
            now(rtt_ms * 1000),
            Duration::ZERO,
            crate::packet::number::PacketNumberSpace::ApplicationData,
            false,
        );
        rtt
    }

    /// Feeds `rounds` of acks at a steady rate
    fn drive(bbr: &mut Bbr, rtt: &RttEstimator, start_us: u64, rounds: u32, bytes_per_ack: usize) -> u64 {
        let mut time = start_us;
        for _ in 0..rounds {
            for _ in 0..10 {
                bbr.on_packet_sent(now(time), bytes_per_ack, 12_000, rtt);
                bbr.on_packet_acked(now(time), bytes_per_ack, rtt, now(time), 12_000);
                time += 3_000;
            }
        }
        time
    }

    #[test]
    fn startup_grows_and_fills_pipe() {
        for version in [Version::V1, Version::V2, Version::V3] {
            let mut bbr = Bbr::new(version, MDS);
            let rtt = rtt_estimator(30);
            let initial = bbr.congestion_window();

            assert_eq!(bbr.state(), State::Startup);
            assert!(bbr.is_slow_start());

            // steady delivery rate: growth stalls, the pipe fills, and
            // the state machine moves on from Startup
            drive(&mut bbr, &rtt, 0, 30, 1200);

            assert!(bbr.congestion_window() > initial);
            assert!(
                !matches!(bbr.state(), State::Startup),
                "{version:?} stuck in startup: {:?}",
                bbr.state()
            );
        }
    }

    #[test]
    fn probe_rtt_shrinks_the_window() {
        let mut bbr = Bbr::new(Version::V3, MDS);
        let rtt = rtt_estimator(30);

        let time = drive(&mut bbr, &rtt, 0, 40, 1200);

        // idle past the 10s min_rtt window to force ProbeRTT
        let late = time + 11_000_000;
        bbr.on_packet_sent(now(late), 1200, 1200, &rtt);
        bbr.on_packet_acked(now(late), 1200, &rtt, now(late), 1200);

        assert_eq!(bbr.state(), State::ProbeRtt);
        assert!(bbr.congestion_window() <= 4 * MDS as u32);

        // 200ms later ProbeRTT ends
        let done = late + 250_000;
        bbr.on_packet_acked(now(done), 1200, &rtt, now(done), 1200);
        assert_ne!(bbr.state(), State::ProbeRtt);
    }

    #[test]
    fn v2_loss_reduces_inflight_hi() {
        let mut bbr = Bbr::new(Version::V2, MDS);
        let rtt = rtt_estimator(30);

        drive(&mut bbr, &rtt, 0, 20, 1200);
        let before = bbr.inflight_hi;

        bbr.on_packet_lost(1200, now(0), false, now(1_000_000), 24_000);
        assert!(bbr.inflight_hi < before.max(25_200 + 1));
        assert!(bbr.inflight_hi >= bbr.bdp() * BETA_LOSS_PCT / 100);
    }

    #[test]
    fn v1_ignores_individual_losses() {
        let mut bbr = Bbr::new(Version::V1, MDS);
        let rtt = rtt_estimator(30);

        drive(&mut bbr, &rtt, 0, 20, 1200);
        let window = bbr.congestion_window();

        bbr.on_packet_lost(1200, now(0), false, now(1_000_000), 24_000);
        assert_eq!(bbr.congestion_window(), window);
        assert_eq!(bbr.inflight_hi, u64::MAX);
    }

    #[test]
    fn ecn_applies_deeper_reduction_than_loss() {
        let mut a = Bbr::new(Version::V3, MDS);
        let mut b = Bbr::new(Version::V3, MDS);
        let rtt = rtt_estimator(30);

        drive(&mut a, &rtt, 0, 20, 1200);
        drive(&mut b, &rtt, 0, 20, 1200);

        a.on_packet_lost(1200, now(0), false, now(1_000_000), 24_000);
        b.on_explicit_congestion(3, now(1_000_000));

        // beta_ecn (0.85) cuts deeper than beta_loss (0.9) from the same base
        assert!(BETA_ECN_PCT < BETA_LOSS_PCT);
        assert!(b.congestion_window() <= a.congestion_window());
    }

    #[test]
    fn v3_probe_bw_cycles_through_phases() {
        let mut bbr = Bbr::new(Version::V3, MDS);
        let rtt = rtt_estimator(30);

        let mut time = drive(&mut bbr, &rtt, 0, 40, 1200);
        let mut seen = [false; 4];

        for _ in 0..2_000 {
            bbr.on_packet_sent(now(time), 1200, 6_000, &rtt);
            bbr.on_packet_acked(now(time), 1200, &rtt, now(time), 6_000);
            if let State::ProbeBw(phase) = bbr.state() {
                seen[match phase {
                    CyclePhase::Down => 0,
                    CyclePhase::Cruise => 1,
                    CyclePhase::Refill => 2,
                    CyclePhase::Up => 3,
                }] = true;
            }
            time += 5_000;
        }

        assert!(seen.iter().all(|&phase| phase), "visited phases: {seen:?}");
    }

    #[test]
    fn persistent_congestion_collapses_to_minimum() {
        for version in [Version::V1, Version::V2, Version::V3] {
            let mut bbr = Bbr::new(version, MDS);
            let rtt = rtt_estimator(30);
            drive(&mut bbr, &rtt, 0, 10, 1200);

            bbr.on_packet_lost(1200, now(0), true, now(1_000_000), 12_000);
            assert_eq!(
                bbr.congestion_window(),
                crate::recovery::minimum_congestion_window(MDS)
            );
        }
    }
}
