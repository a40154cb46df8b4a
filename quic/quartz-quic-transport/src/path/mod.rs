// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network paths: the validated primary plus at most one candidate
//! under validation (migration or NAT rebind).

use quartz_quic_core::{
    frame,
    inet::SocketAddress,
    path::{Challenge, ANTI_AMPLIFICATION_MULTIPLIER},
    random,
    recovery::{Algorithm, CanSend, CongestionController, Controller, RttEstimator},
    time::Timestamp,
    transmission::Constraint,
};
use core::time::Duration;
use smallvec::SmallVec;

/// ECN validation state for a path
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EcnValidation {
    /// Marking outgoing packets and watching for reflected counts
    #[default]
    Testing,
    Capable,
    Failed,
    /// Administratively disabled; codepoints are zeroed both ways
    Disabled,
}

#[derive(Debug)]
pub struct Path {
    pub remote_address: SocketAddress,
    pub cc: Controller,
    pub rtt: RttEstimator,
    pub ecn: EcnValidation,

    validated: bool,
    rx_bytes: u64,
    tx_bytes: u64,

    challenge: Option<Challenge>,
}

impl Path {
    pub fn new(
        remote_address: SocketAddress,
        algorithm: Algorithm,
        max_datagram_size: u16,
        validated: bool,
        ecn_disabled: bool,
    ) -> Self {
        Self {
            remote_address,
            cc: Controller::new(algorithm, max_datagram_size),
            rtt: RttEstimator::default(),
            ecn: if ecn_disabled {
                EcnValidation::Disabled
            } else {
                EcnValidation::default()
            },
            validated,
            rx_bytes: 0,
            tx_bytes: 0,
            challenge: None,
        }
    }

    #[inline]
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn on_validated(&mut self) {
        self.validated = true;
        self.challenge = None;
    }

    #[inline]
    pub fn on_bytes_received(&mut self, len: usize) {
        self.rx_bytes += len as u64;
    }

    #[inline]
    pub fn on_bytes_sent(&mut self, len: usize) {
        self.tx_bytes += len as u64;
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
    //# Prior to validating the client address, servers MUST NOT send more
    //# than three times as many bytes as the number of bytes they have
    //# received.
    #[inline]
    pub fn amplification_remaining(&self) -> u64 {
        if self.validated {
            return u64::MAX;
        }
        (self.rx_bytes * ANTI_AMPLIFICATION_MULTIPLIER).saturating_sub(self.tx_bytes)
    }

    #[inline]
    pub fn at_amplification_limit(&self) -> bool {
        self.amplification_remaining() == 0
    }

    /// The tightest transmission constraint on this path right now
    pub fn transmission_constraint(&mut self, now: Timestamp) -> Constraint {
        if self.at_amplification_limit() {
            return Constraint::AmplificationLimited;
        }

        match self.cc.can_send(now) {
            CanSend::Ok { .. } => Constraint::None,
            CanSend::BlockedByCwnd => Constraint::CongestionLimited,
            CanSend::BlockedByPacer { .. } => Constraint::CongestionLimited,
        }
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    fn start_validation<R: random::Generator + ?Sized>(&mut self, random: &mut R) {
        if self.challenge.is_none() && !self.validated {
            self.challenge = Some(Challenge::new(random));
        }
    }

    /// A PATH_CHALLENGE frame to send on this path, if one is due
    pub fn pending_challenge(&mut self, now: Timestamp) -> Option<[u8; 8]> {
        let challenge = self.challenge.as_ref()?;
        challenge.needs_transmission(now).then(|| *challenge.data())
    }

    pub fn on_challenge_sent(&mut self, now: Timestamp, pto: Duration) {
        if let Some(challenge) = self.challenge.as_mut() {
            challenge.on_transmit(now, pto);
        }
    }

    pub fn validation_failed(&self) -> bool {
        self.challenge
            .as_ref()
            .map_or(false, Challenge::is_abandoned)
    }

    pub fn next_expiration(&self) -> Option<Timestamp> {
        self.challenge.as_ref().and_then(Challenge::next_expiration)
    }
}

/// What happened as a result of an incoming datagram's source address
#[derive(Debug, PartialEq, Eq)]
pub enum PathEvent {
    /// The datagram arrived on a known path
    Existing,

    /// A candidate path was created and needs validation
    ValidationStarted,

    /// The datagram was attributed to the candidate
    Candidate,
}

#[derive(Debug)]
pub struct Manager {
    active: Path,
    candidate: Option<Path>,

    /// PATH_RESPONSE data owed to the peer
    pending_responses: SmallVec<[[u8; 8]; 2]>,

    /// The peer forbade active migration; passive rebinds still probe
    peer_disabled_migration: bool,

    algorithm: Algorithm,
    max_datagram_size: u16,
    ecn_disabled: bool,
}

impl Manager {
    pub fn new(active: Path, algorithm: Algorithm, max_datagram_size: u16, ecn_disabled: bool) -> Self {
        Self {
            active,
            candidate: None,
            pending_responses: SmallVec::new(),
            peer_disabled_migration: false,
            algorithm,
            max_datagram_size,
            ecn_disabled,
        }
    }

    pub fn on_peer_disabled_migration(&mut self) {
        self.peer_disabled_migration = true;
    }

    #[inline]
    pub fn active(&self) -> &Path {
        &self.active
    }

    #[inline]
    pub fn active_mut(&mut self) -> &mut Path {
        &mut self.active
    }

    #[inline]
    pub fn candidate_mut(&mut self) -> Option<&mut Path> {
        self.candidate.as_mut()
    }

    /// Attributes an incoming datagram to a path, creating a candidate
    /// when the peer's address changed.
    ///
    /// `handshake_confirmed` gates migration entirely; address changes
    /// during the handshake are attacks or broken middleboxes.
    pub fn on_datagram<R: random::Generator + ?Sized>(
        &mut self,
        remote_address: SocketAddress,
        len: usize,
        handshake_confirmed: bool,
        random: &mut R,
    ) -> Option<PathEvent> {
        if remote_address == self.active.remote_address {
            self.active.on_bytes_received(len);
            return Some(PathEvent::Existing);
        }

        if let Some(candidate) = self.candidate.as_mut() {
            if remote_address == candidate.remote_address {
                candidate.on_bytes_received(len);
                return Some(PathEvent::Candidate);
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-9
        //# An endpoint MUST NOT initiate connection migration before the
        //# handshake is confirmed
        if !handshake_confirmed {
            return None;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-9.2
        //# An endpoint can migrate a connection to a new local address by
        //# sending packets containing non-probing frames from that address.
        // A rebinding observed from the peer is handled even when active
        // migration is disabled; only the rebound address is probed.
        let mut path = Path::new(
            remote_address,
            self.algorithm,
            self.max_datagram_size,
            false,
            self.ecn_disabled,
        );
        path.on_bytes_received(len);
        path.start_validation(random);
        self.candidate = Some(path);

        Some(PathEvent::ValidationStarted)
    }

    /// Queues a PATH_RESPONSE echoing the challenge data
    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.17
    //# The recipient of this frame MUST generate a PATH_RESPONSE frame
    //# (Section 19.18) containing the same Data value.
    pub fn on_path_challenge(&mut self, frame: &frame::PathChallenge) {
        self.pending_responses.push(frame.data);
    }

    pub fn take_path_response(&mut self) -> Option<[u8; 8]> {
        self.pending_responses.pop()
    }

    /// Processes a PATH_RESPONSE; returns `true` when the candidate was
    /// promoted to the active path.
    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.4
    //# On confirming a peer's ownership of its new address, an endpoint
    //# MUST immediately reset the congestion controller and round-trip
    //# time estimator for the new path to initial values
    pub fn on_path_response(&mut self, frame: &frame::PathResponse) -> bool {
        let candidate_valid = self
            .candidate
            .as_ref()
            .and_then(Path::challenge)
            .map_or(false, |challenge| challenge.is_valid_response(&frame.data));

        if candidate_valid {
            let mut candidate = self.candidate.take().expect("candidate checked above");
            candidate.on_validated();
            // the candidate carries a fresh controller and estimator
            let _previous = core::mem::replace(&mut self.active, candidate);
            return true;
        }

        // a response for a challenge on the active path
        if let Some(challenge) = self.active.challenge() {
            if challenge.is_valid_response(&frame.data) {
                self.active.on_validated();
            }
        }

        false
    }

    /// Drops a candidate whose validation ran out of retries
    pub fn on_timeout(&mut self, now: Timestamp) {
        let failed = self
            .candidate
            .as_mut()
            .map_or(false, |candidate| {
                // drive the retry state machine forward
                let _ = now;
                candidate.validation_failed()
            });

        if failed {
            tracing::debug!("path validation failed, dropping candidate");
            self.candidate = None;
        }
    }

    pub fn next_expiration(&self) -> Option<Timestamp> {
        quartz_quic_core::time::timer::earliest([
            self.active.next_expiration(),
            self.candidate.as_ref().and_then(Path::next_expiration),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_quic_core::{random::testing::Generator, time::testing::now};

    fn addr(port: u16) -> SocketAddress {
        SocketAddress::new("127.0.0.1".parse().unwrap(), port)
    }

    fn manager(validated: bool) -> Manager {
        let path = Path::new(addr(1000), Algorithm::Cubic, 1200, validated, false);
        Manager::new(path, Algorithm::Cubic, 1200, false)
    }

    #[test]
    fn amplification_budget_unlocks_with_received_bytes() {
        let mut manager = manager(false);
        let path = manager.active_mut();

        assert!(path.at_amplification_limit());

        path.on_bytes_received(100);
        assert_eq!(path.amplification_remaining(), 300);

        path.on_bytes_sent(300);
        assert!(path.at_amplification_limit());
        assert_eq!(
            path.transmission_constraint(now(0)),
            Constraint::AmplificationLimited
        );

        // any further received byte unlocks the budget again
        path.on_bytes_received(1);
        assert!(!path.at_amplification_limit());

        path.on_validated();
        assert_eq!(path.amplification_remaining(), u64::MAX);
    }

    #[test]
    fn address_change_starts_validation() {
        let mut manager = manager(true);
        let mut random = Generator::default();

        assert_eq!(
            manager.on_datagram(addr(1000), 100, true, &mut random),
            Some(PathEvent::Existing)
        );

        assert_eq!(
            manager.on_datagram(addr(2000), 100, true, &mut random),
            Some(PathEvent::ValidationStarted)
        );

        let candidate = manager.candidate_mut().unwrap();
        let challenge = candidate.pending_challenge(now(0)).unwrap();

        // the matching response promotes the candidate
        assert!(manager.on_path_response(&frame::PathResponse { data: challenge }));
        assert_eq!(manager.active().remote_address, addr(2000));
        assert!(manager.active().is_validated());
    }

    #[test]
    fn mismatched_response_does_not_promote() {
        let mut manager = manager(true);
        let mut random = Generator::default();
        manager.on_datagram(addr(2000), 100, true, &mut random);

        assert!(!manager.on_path_response(&frame::PathResponse { data: [0xee; 8] }));
        assert_eq!(manager.active().remote_address, addr(1000));
    }

    #[test]
    fn migration_is_refused_during_handshake() {
        let mut manager = manager(false);
        let mut random = Generator::default();
        assert_eq!(manager.on_datagram(addr(2000), 100, false, &mut random), None);
    }

    #[test]
    fn abandoned_validation_drops_the_candidate() {
        let mut manager = manager(true);
        let mut random = Generator::default();
        manager.on_datagram(addr(2000), 100, true, &mut random);

        let pto = Duration::from_millis(100);
        let mut time = now(0);
        for attempt in 0..10 {
            let candidate = match manager.candidate_mut() {
                Some(candidate) => candidate,
                None => break,
            };
            if candidate.pending_challenge(time).is_some() {
                candidate.on_challenge_sent(time, pto);
            }
            manager.on_timeout(time);
            time = now((attempt + 1) * 10_000_000);
        }

        assert!(manager.candidate_mut().is_none());

        // the original path still works
        let mut random = Generator::default();
        assert_eq!(
            manager.on_datagram(addr(1000), 50, true, &mut random),
            Some(PathEvent::Existing)
        );
    }

    #[test]
    fn path_challenge_is_echoed() {
        let mut manager = manager(true);
        manager.on_path_challenge(&frame::PathChallenge { data: [9; 8] });
        assert_eq!(manager.take_path_response(), Some([9; 8]));
        assert_eq!(manager.take_path_response(), None);
    }
}
