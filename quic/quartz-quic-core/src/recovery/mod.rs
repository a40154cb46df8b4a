// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod bbr;
pub mod congestion_controller;
pub mod cubic;
pub mod pacer;
pub mod reno;
pub mod rtt_estimator;
pub mod sent_packets;

pub use congestion_controller::{Algorithm, CanSend, CongestionController, Controller};
pub use pacer::Pacer;
pub use rtt_estimator::{RttEstimator, DEFAULT_INITIAL_RTT, K_GRANULARITY};
pub use sent_packets::SentPackets;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
//# The RECOMMENDED initial value for the packet reordering threshold
//# (kPacketThreshold) is 3, based on best practices for TCP loss
//# detection.

pub const K_PACKET_THRESHOLD: u64 = 3;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED time threshold (kTimeThreshold), expressed as an
//# RTT multiplier, is 9/8.

pub const K_TIME_THRESHOLD_NUMERATOR: u32 = 9;
pub const K_TIME_THRESHOLD_DENOMINATOR: u32 = 8;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.1
//# The RECOMMENDED value for kPersistentCongestionThreshold is 3

pub const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# Endpoints SHOULD use an initial congestion
//# window of ten times the maximum datagram size (max_datagram_size),
//# while limiting the window to the larger of 14,720 bytes or twice the
//# maximum datagram size.

pub const INITIAL_WINDOW_PACKETS: u32 = 10;
pub const INITIAL_WINDOW_LIMIT: u32 = 14_720;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# The RECOMMENDED
//# value is 2 * max_datagram_size.

pub const MINIMUM_WINDOW_PACKETS: u32 = 2;

/// The initial congestion window for a path
#[inline]
pub fn initial_congestion_window(max_datagram_size: u16) -> u32 {
    let mds = max_datagram_size as u32;
    (INITIAL_WINDOW_PACKETS * mds).min(INITIAL_WINDOW_LIMIT.max(MINIMUM_WINDOW_PACKETS * mds))
}

/// The floor the congestion window never drops below
#[inline]
pub fn minimum_congestion_window(max_datagram_size: u16) -> u32 {
    MINIMUM_WINDOW_PACKETS * max_datagram_size as u32
}
