// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    crypto::{packet_protection, OneRttKey},
    packet::KeyPhase,
    time::{Timer, Timestamp},
};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9001#section-6
//# The Key Phase bit is initially set to 0 for the
//# first set of 1-RTT packets and toggled to signal each subsequent key
//# update.

/// The two 1-RTT key generations in use at any moment.
///
/// The next-phase key is always pre-derived so a peer-initiated key
/// update can be answered without a timing side channel. After a
/// rotation the previous-phase key is retained for a reordering window
/// before the following generation replaces it.
pub struct KeySet<K> {
    key_phase: KeyPhase,
    keys: [K; 2],
    generation: u16,
    /// While armed, the inactive slot still holds the previous
    /// generation for delayed packets
    derivation_timer: Timer,
    /// Time of the last locally initiated update
    last_local_update: Option<Timestamp>,
    decryption_failures: u64,
    integrity_limit: u64,
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-6.5
//# An endpoint SHOULD retain old read keys for no more than three times
//# the PTO after having received a packet protected using the new keys.

const RETIRE_PRIOR_KEY_PTO_FACTOR: u32 = 3;

/// Locally initiated updates are spaced at least this many PTOs apart
const LOCAL_UPDATE_PTO_FACTOR: u32 = 3;

impl<K: OneRttKey> KeySet<K> {
    pub fn new(key: K) -> Self {
        let integrity_limit = key.aead_integrity_limit();
        let next_key = key.derive_next_key();

        Self {
            key_phase: KeyPhase::Zero,
            keys: [key, next_key],
            generation: 0,
            derivation_timer: Timer::default(),
            last_local_update: None,
            decryption_failures: 0,
            integrity_limit,
        }
    }

    #[inline]
    pub fn key_phase(&self) -> KeyPhase {
        self.key_phase
    }

    #[inline]
    pub fn generation(&self) -> u16 {
        self.generation
    }

    #[inline]
    fn slot(&self, phase: KeyPhase) -> usize {
        phase as usize
    }

    #[inline]
    pub fn active_key(&self) -> &K {
        &self.keys[self.slot(self.key_phase)]
    }

    #[inline]
    pub fn active_key_mut(&mut self) -> &mut K {
        let slot = self.slot(self.key_phase);
        &mut self.keys[slot]
    }

    fn rotate_phase(&mut self, now: Timestamp, pto: Duration) {
        self.generation += 1;
        self.key_phase = self.key_phase.next();
        self.derivation_timer
            .set(now + pto * RETIRE_PRIOR_KEY_PTO_FACTOR);
    }

    /// Decrypts a packet tagged with `phase`, rotating the active phase
    /// when the peer initiated a key update.
    ///
    /// Returns `true` if a rotation occurred.
    pub fn decrypt_packet(
        &mut self,
        phase: KeyPhase,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
        now: Timestamp,
        pto: Duration,
    ) -> Result<bool, packet_protection::Error> {
        let slot = self.slot(phase);

        let result = self.keys[slot].decrypt(packet_number, header, payload);

        if result.is_err() {
            self.on_decryption_failure();
            return result.map(|_| false);
        }

        if phase != self.key_phase && !self.derivation_timer.is_armed() {
            //= https://www.rfc-editor.org/rfc/rfc9001#section-6.2
            //# The endpoint MUST update its
            //# send keys to the corresponding key phase in response, as described
            //# in Section 6.1.
            self.rotate_phase(now, pto);
            return Ok(true);
        }

        Ok(false)
    }

    /// Initiates a key update from this endpoint.
    ///
    /// Updates are rate-limited to one per `3 * PTO`; returns whether the
    /// update was performed.
    pub fn initiate_key_update(&mut self, now: Timestamp, pto: Duration) -> bool {
        //= https://www.rfc-editor.org/rfc/rfc9001#section-6.1
        //# An endpoint MUST NOT initiate a subsequent key update unless it
        //# has received an acknowledgment for a packet that was sent protected
        //# with keys from the current key phase.
        if self.derivation_timer.is_armed() {
            return false;
        }

        if let Some(last) = self.last_local_update {
            if now.saturating_duration_since(last) < pto * LOCAL_UPDATE_PTO_FACTOR {
                return false;
            }
        }

        self.last_local_update = Some(now);
        self.rotate_phase(now, pto);
        true
    }

    /// Replaces the retired generation once the reordering window closes
    pub fn on_timeout(&mut self, now: Timestamp) {
        if self.derivation_timer.poll_expiration(now) {
            let next_key = self.active_key().derive_next_key();
            let slot = self.slot(self.key_phase.next());
            self.keys[slot] = next_key;
        }
    }

    #[inline]
    pub fn next_expiration(&self) -> Option<Timestamp> {
        self.derivation_timer.deadline()
    }

    fn on_decryption_failure(&mut self) {
        self.decryption_failures += 1;
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
    //# If the total number of received packets that fail
    //# authentication within the connection, across all keys, exceeds the
    //# integrity limit for the selected AEAD, the endpoint MUST immediately
    //# close the connection with a connection error of type
    //# AEAD_LIMIT_REACHED and not process any more packets.
    #[inline]
    pub fn integrity_limit_exceeded(&self) -> bool {
        self.decryption_failures > self.integrity_limit
    }
}
