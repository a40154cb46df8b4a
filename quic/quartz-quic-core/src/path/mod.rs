// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::path_challenge::DATA_LEN,
    random,
    time::{Timer, Timestamp},
};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14
//# QUIC MUST NOT be used if the network path cannot support a
//# maximum datagram size of at least 1200 bytes.

pub const MINIMUM_MAX_DATAGRAM_SIZE: u16 = 1200;

//= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
//# Prior to validating the client address, servers MUST NOT send more
//# than three times as many bytes as the number of bytes they have
//# received.

pub const ANTI_AMPLIFICATION_MULTIPLIER: u64 = 3;

/// Attempts before a path validation is abandoned
pub const MAX_CHALLENGE_RETRIES: u8 = 5;

/// An in-flight PATH_CHALLENGE and its retransmission state
#[derive(Clone, Debug)]
pub struct Challenge {
    data: [u8; DATA_LEN],
    attempts: u8,
    retransmit_timer: Timer,
    abandoned: bool,
}

impl Challenge {
    /// Creates a challenge with fresh unpredictable data
    pub fn new<R: random::Generator + ?Sized>(random: &mut R) -> Self {
        let mut data = [0u8; DATA_LEN];
        random.secure_random_fill(&mut data);

        Self {
            data,
            attempts: 0,
            retransmit_timer: Timer::default(),
            abandoned: false,
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8; DATA_LEN] {
        &self.data
    }

    /// Whether a PATH_CHALLENGE frame should go out now
    #[inline]
    pub fn needs_transmission(&self, now: Timestamp) -> bool {
        !self.abandoned && (self.attempts == 0 || self.retransmit_timer.is_expired(now))
    }

    /// Records a transmission, arming the retransmit timer with
    /// exponential backoff
    pub fn on_transmit(&mut self, now: Timestamp, pto: Duration) {
        self.attempts = self.attempts.saturating_add(1);

        if self.attempts >= MAX_CHALLENGE_RETRIES {
            self.abandoned = true;
            self.retransmit_timer.cancel();
            return;
        }

        let backoff = 1u32 << (self.attempts - 1).min(10);
        self.retransmit_timer.set(now + pto * backoff);
    }

    /// Checks a PATH_RESPONSE against the challenge data
    #[inline]
    pub fn is_valid_response(&self, data: &[u8; DATA_LEN]) -> bool {
        !self.abandoned && &self.data == data
    }

    /// True once the retry cap was reached without a valid response
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    #[inline]
    pub fn next_expiration(&self) -> Option<Timestamp> {
        self.retransmit_timer.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;

    const PTO: Duration = Duration::from_millis(100);

    #[test]
    fn retries_back_off_and_abandon() {
        let mut random = crate::random::testing::Generator::default();
        let mut challenge = Challenge::new(&mut random);

        assert!(challenge.needs_transmission(now(0)));
        challenge.on_transmit(now(0), PTO);

        // timer armed with 1 PTO backoff
        assert!(!challenge.needs_transmission(now(50_000)));
        assert!(challenge.needs_transmission(now(100_000)));

        challenge.on_transmit(now(100_000), PTO);
        // second retry backs off to 2 PTO
        assert!(!challenge.needs_transmission(now(250_000)));
        assert!(challenge.needs_transmission(now(300_000)));

        for attempt in 2..MAX_CHALLENGE_RETRIES {
            challenge.on_transmit(now(1_000_000 * attempt as u64), PTO);
        }

        assert!(challenge.is_abandoned());
        assert!(!challenge.needs_transmission(now(10_000_000)));
    }

    #[test]
    fn response_must_match() {
        let mut random = crate::random::testing::Generator::default();
        let challenge = Challenge::new(&mut random);

        let mut data = *challenge.data();
        assert!(challenge.is_valid_response(&data));
        data[0] ^= 1;
        assert!(!challenge.is_valid_response(&data));
    }
}
