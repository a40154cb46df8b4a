// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use quartz_quic_core::{
    ack::AckRanges,
    interval_set::Interval,
    recovery::Algorithm,
    time::testing::now,
    varint::VarInt,
};

const SPACE: PacketNumberSpace = PacketNumberSpace::ApplicationData;

fn pn(value: u64) -> PacketNumber {
    SPACE.new_packet_number(VarInt::new(value).unwrap())
}

fn details(sent_time: Timestamp) -> PacketDetails {
    PacketDetails {
        sent_time,
        sent_bytes: 1200,
        ack_eliciting: true,
        in_flight: true,
        manifest: Manifest::default(),
    }
}

fn ack_frame(ranges: &[(u64, u64)]) -> Ack {
    let mut ack_ranges = AckRanges::new(ranges.len());
    for &(start, end) in ranges {
        ack_ranges.insert(Interval::new(start, end));
    }
    Ack {
        ack_delay: VarInt::ZERO,
        ranges: ack_ranges,
        ecn_counts: None,
    }
}

struct Harness {
    manager: Manager,
    rtt: RttEstimator,
    cc: Controller,
    pto_backoff: u32,
    settings: Settings,
}

impl Harness {
    fn new() -> Self {
        Self {
            manager: Manager::new(SPACE),
            rtt: RttEstimator::default(),
            cc: Controller::new(Algorithm::Reno, 1200),
            pto_backoff: 1,
            settings: Settings::default(),
        }
    }

    fn send(&mut self, value: u64, at: Timestamp) {
        let details = details(at);
        self.manager.on_packet_sent(
            pn(value),
            details,
            at,
            self.pto_backoff,
            &self.rtt,
            &mut self.cc,
        );
    }

    fn ack(&mut self, ranges: &[(u64, u64)], at: Timestamp) -> AckOutcome {
        let frame = ack_frame(ranges);
        self.manager
            .on_ack_frame(
                &frame,
                at,
                &self.settings,
                true,
                &mut self.pto_backoff,
                &mut self.rtt,
                &mut self.cc,
            )
            .unwrap()
    }
}

#[test]
fn acked_packets_are_removed_and_reported() {
    let mut harness = Harness::new();
    for value in 0..5 {
        harness.send(value, now(value * 1_000));
    }

    let outcome = harness.ack(&[(1, 3)], now(50_000));
    let acked: Vec<_> = outcome
        .newly_acked
        .iter()
        .map(|(pn, _)| pn.as_u64())
        .collect();
    assert_eq!(acked, [1, 2, 3]);
    assert!(outcome.includes_ack_eliciting);

    // acking again reports nothing new
    let outcome = harness.ack(&[(1, 3)], now(60_000));
    assert!(outcome.newly_acked.is_empty());
}

#[test]
fn ack_for_unsent_packet_is_a_protocol_violation() {
    let mut harness = Harness::new();
    harness.send(0, now(0));

    let frame = ack_frame(&[(5, 5)]);
    let error = harness
        .manager
        .on_ack_frame(
            &frame,
            now(1_000),
            &harness.settings,
            true,
            &mut harness.pto_backoff,
            &mut harness.rtt,
            &mut harness.cc,
        )
        .unwrap_err();
    assert_eq!(
        error.code,
        quartz_quic_core::transport::Error::PROTOCOL_VIOLATION.code
    );
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
//# the packet was sent kPacketThreshold packets before an acknowledged
//# packet
#[test]
fn packet_threshold_loss() {
    let mut harness = Harness::new();
    for value in 0..5 {
        harness.send(value, now(value * 100));
    }

    // acking 4 leaves 0 and 1 at least 3 behind
    let outcome = harness.ack(&[(4, 4)], now(10_000));
    let lost: Vec<_> = outcome.lost.iter().map(|(pn, _)| pn.as_u64()).collect();
    assert_eq!(lost, [0, 1]);

    // 2 and 3 are within the threshold and still outstanding
    assert!(harness.manager.has_in_flight());
}

#[test]
fn time_threshold_loss() {
    let mut harness = Harness::new();
    harness.send(0, now(0));
    harness.send(1, now(1_000));

    // seed the RTT estimator with a 100ms sample
    harness.ack(&[(1, 1)], now(100_000));

    // packet 0 is within 9/8 * 100ms: the loss timer is armed
    assert!(harness.manager.has_in_flight());
    let deadline = harness.manager.next_expiration().unwrap();

    // once the timer fires past the threshold, packet 0 is lost
    let (lost, pto_expired) = harness.manager.on_timeout(
        deadline,
        &mut harness.pto_backoff,
        &mut harness.rtt,
        &mut harness.cc,
    );
    assert!(!pto_expired);
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].0.as_u64(), 0);
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
//# When a PTO timer expires, a sender MUST send at least one ack-
//# eliciting packet in the packet number space as a probe.
#[test]
fn pto_produces_probes_and_backs_off() {
    let mut harness = Harness::new();
    harness.send(0, now(0));

    let pto_deadline = harness.manager.next_expiration().unwrap();
    let (lost, pto_expired) = harness.manager.on_timeout(
        pto_deadline,
        &mut harness.pto_backoff,
        &mut harness.rtt,
        &mut harness.cc,
    );

    assert!(pto_expired);
    assert!(lost.is_empty(), "PTO does not declare loss");
    assert_eq!(harness.manager.probes_pending(), 2);
    assert_eq!(harness.pto_backoff, 2);

    // the next PTO doubles again
    let next_deadline = harness.manager.next_expiration().unwrap();
    assert!(next_deadline > pto_deadline);
    harness.manager.on_timeout(
        next_deadline,
        &mut harness.pto_backoff,
        &mut harness.rtt,
        &mut harness.cc,
    );
    assert_eq!(harness.pto_backoff, 4);
}

#[test]
fn ack_of_eliciting_packet_resets_backoff() {
    let mut harness = Harness::new();
    harness.send(0, now(0));

    let deadline = harness.manager.next_expiration().unwrap();
    harness.manager.on_timeout(
        deadline,
        &mut harness.pto_backoff,
        &mut harness.rtt,
        &mut harness.cc,
    );
    assert_eq!(harness.pto_backoff, 2);

    harness.send(1, deadline + core::time::Duration::from_millis(1));
    harness.ack(&[(1, 1)], deadline + core::time::Duration::from_millis(30));
    assert_eq!(harness.pto_backoff, 1);
    assert_eq!(harness.manager.probes_pending(), 0);
}

#[test]
fn rtt_sample_requires_largest_newly_acked() {
    let mut harness = Harness::new();
    harness.send(0, now(0));
    harness.send(1, now(0));

    harness.ack(&[(0, 1)], now(200_000));
    assert_eq!(
        harness.rtt.latest_rtt(),
        core::time::Duration::from_millis(200)
    );
}

#[test]
fn discard_returns_bytes_to_the_controller() {
    let mut harness = Harness::new();
    for value in 0..3 {
        harness.send(value, now(0));
    }
    assert_eq!(harness.cc.bytes_in_flight(), 3 * 1200);

    harness.manager.discard(&mut harness.cc);
    assert_eq!(harness.cc.bytes_in_flight(), 0);
    assert!(!harness.manager.has_in_flight());
    assert!(harness.manager.next_expiration().is_none());
}

#[test]
fn ecn_ce_feedback_reaches_the_controller() {
    let mut harness = Harness::new();
    harness.send(0, now(0));
    let window_before = harness.cc.congestion_window();

    let mut frame = ack_frame(&[(0, 0)]);
    frame.ecn_counts = Some(quartz_quic_core::inet::EcnCounts {
        ect_0_count: VarInt::from_u8(1),
        ect_1_count: VarInt::ZERO,
        ce_count: VarInt::from_u8(1),
    });

    harness
        .manager
        .on_ack_frame(
            &frame,
            now(30_000),
            &harness.settings,
            true,
            &mut harness.pto_backoff,
            &mut harness.rtt,
            &mut harness.cc,
        )
        .unwrap();

    assert!(harness.cc.congestion_window() < window_before);
}
