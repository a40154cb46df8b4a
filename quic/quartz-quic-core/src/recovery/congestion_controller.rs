// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    recovery::{bbr::Bbr, cubic::Cubic, pacer::Pacer, reno::Reno, RttEstimator},
    time::Timestamp,
};

/// The congestion control algorithms this endpoint can run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Algorithm {
    Reno,
    #[default]
    Cubic,
    BbrV1,
    BbrV2,
    BbrV3,
}

/// The verdict on whether a packet may be sent now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanSend {
    Ok {
        /// Congestion window space remaining
        available: usize,
    },
    BlockedByCwnd,
    BlockedByPacer {
        next_send_time: Timestamp,
    },
}

impl CanSend {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// The interface the recovery manager drives.
///
/// Dispatch happens per ACK, not per byte, so the indirection is free in
/// practice; the variants themselves are a tagged union.
pub trait CongestionController: 'static + Send + core::fmt::Debug {
    fn congestion_window(&self) -> u32;

    fn bytes_in_flight(&self) -> u32;

    fn is_slow_start(&self) -> bool;

    fn on_packet_sent(&mut self, now: Timestamp, bytes: usize, rtt: &RttEstimator);

    /// `sent_time` is the send time of the largest newly acked packet
    fn on_packet_acked(
        &mut self,
        sent_time: Timestamp,
        bytes: usize,
        rtt: &RttEstimator,
        now: Timestamp,
    );

    /// `sent_time` is the send time of the lost packet; reductions are
    /// applied once per recovery episode
    fn on_packet_lost(
        &mut self,
        bytes: usize,
        sent_time: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    );

    /// Called when ACK_ECN reports new CE marks
    fn on_explicit_congestion(&mut self, ce_count: u64, now: Timestamp);

    /// A packet left flight without being acked or lost (space discard)
    fn on_packet_discarded(&mut self, bytes: usize);

    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.4
    //# On confirming a peer's ownership of its new address, an endpoint
    //# MUST immediately reset the congestion controller and round-trip
    //# time estimator for the new path to initial values
    fn on_path_migration(&mut self, now: Timestamp);

    fn can_send(&mut self, now: Timestamp) -> CanSend;

    fn pacing_rate_bps(&self, rtt: &RttEstimator) -> u64;

    fn next_send_time(&self) -> Option<Timestamp>;
}

#[derive(Debug)]
enum Variant {
    Reno(Reno),
    Cubic(Cubic),
    Bbr(Bbr),
}

macro_rules! dispatch {
    ($self:ident, $state:ident => $expr:expr) => {
        match &$self.variant {
            Variant::Reno($state) => $expr,
            Variant::Cubic($state) => $expr,
            Variant::Bbr($state) => $expr,
        }
    };
    (mut $self:ident, $state:ident => $expr:expr) => {
        match &mut $self.variant {
            Variant::Reno($state) => $expr,
            Variant::Cubic($state) => $expr,
            Variant::Bbr($state) => $expr,
        }
    };
}

/// The production controller: one algorithm variant plus the pacer and
/// in-flight accounting shared by all of them
#[derive(Debug)]
pub struct Controller {
    variant: Variant,
    pacer: Pacer,
    bytes_in_flight: u32,
    max_datagram_size: u16,
}

impl Controller {
    pub fn new(algorithm: Algorithm, max_datagram_size: u16) -> Self {
        let variant = match algorithm {
            Algorithm::Reno => Variant::Reno(Reno::new(max_datagram_size)),
            Algorithm::Cubic => Variant::Cubic(Cubic::new(max_datagram_size)),
            Algorithm::BbrV1 => Variant::Bbr(Bbr::new(crate::recovery::bbr::Version::V1, max_datagram_size)),
            Algorithm::BbrV2 => Variant::Bbr(Bbr::new(crate::recovery::bbr::Version::V2, max_datagram_size)),
            Algorithm::BbrV3 => Variant::Bbr(Bbr::new(crate::recovery::bbr::Version::V3, max_datagram_size)),
        };

        Self {
            variant,
            pacer: Pacer::default(),
            bytes_in_flight: 0,
            max_datagram_size,
        }
    }

    pub fn max_datagram_size(&self) -> u16 {
        self.max_datagram_size
    }
}

impl CongestionController for Controller {
    #[inline]
    fn congestion_window(&self) -> u32 {
        dispatch!(self, state => state.congestion_window())
    }

    #[inline]
    fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    #[inline]
    fn is_slow_start(&self) -> bool {
        dispatch!(self, state => state.is_slow_start())
    }

    fn on_packet_sent(&mut self, now: Timestamp, bytes: usize, rtt: &RttEstimator) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_add(bytes as u32);

        let rate = self.pacing_rate_bps(rtt);
        self.pacer
            .on_packet_sent(now, bytes, rate, self.max_datagram_size);

        let bytes_in_flight = self.bytes_in_flight;
        dispatch!(mut self, state => state.on_packet_sent(now, bytes, bytes_in_flight, rtt));
    }

    fn on_packet_acked(
        &mut self,
        sent_time: Timestamp,
        bytes: usize,
        rtt: &RttEstimator,
        now: Timestamp,
    ) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u32);
        let bytes_in_flight = self.bytes_in_flight;
        dispatch!(mut self, state => state.on_packet_acked(sent_time, bytes, rtt, now, bytes_in_flight));
    }

    fn on_packet_lost(
        &mut self,
        bytes: usize,
        sent_time: Timestamp,
        persistent_congestion: bool,
        now: Timestamp,
    ) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u32);
        let bytes_in_flight = self.bytes_in_flight;
        dispatch!(mut self, state => state.on_packet_lost(bytes, sent_time, persistent_congestion, now, bytes_in_flight));
    }

    fn on_explicit_congestion(&mut self, ce_count: u64, now: Timestamp) {
        dispatch!(mut self, state => state.on_explicit_congestion(ce_count, now));
    }

    fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u32);
    }

    fn on_path_migration(&mut self, now: Timestamp) {
        self.pacer.reset();
        self.bytes_in_flight = 0;
        let _ = now;
        dispatch!(mut self, state => state.reset());
    }

    fn can_send(&mut self, now: Timestamp) -> CanSend {
        if self.pacer.is_blocked(now) {
            let next_send_time = self
                .pacer
                .earliest_departure_time()
                .expect("a blocked pacer has a departure time");
            return CanSend::BlockedByPacer { next_send_time };
        }

        let cwnd = self.congestion_window();
        if self.bytes_in_flight >= cwnd {
            return CanSend::BlockedByCwnd;
        }

        CanSend::Ok {
            available: (cwnd - self.bytes_in_flight) as usize,
        }
    }

    fn pacing_rate_bps(&self, rtt: &RttEstimator) -> u64 {
        match &self.variant {
            // BBR computes its own rate from the bandwidth model
            Variant::Bbr(state) => state.pacing_rate_bps(rtt),
            _ => Pacer::rate_from_window(
                self.congestion_window(),
                rtt.smoothed_rtt(),
                self.is_slow_start(),
            ),
        }
    }

    fn next_send_time(&self) -> Option<Timestamp> {
        self.pacer.earliest_departure_time()
    }
}
