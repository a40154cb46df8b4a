// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection ID state for one connection: the IDs we issued to the
//! peer (local) and the IDs the peer gave us to send with (remote).

use quartz_quic_core::{
    connection::id::{LocalId, PeerId},
    frame,
    random,
    stateless_reset,
    transport,
    varint::VarInt,
};
use siphasher::sip128::{Hasher128, SipHasher24};
use smallvec::SmallVec;

/// Stateless reset tokens are a keyed hash of the connection ID so the
/// dispatch layer can regenerate them without per-connection state
pub fn derive_reset_token(key: &[u8; 16], connection_id: &[u8]) -> stateless_reset::Token {
    let k0 = u64::from_le_bytes(key[..8].try_into().expect("length checked"));
    let k1 = u64::from_le_bytes(key[8..].try_into().expect("length checked"));

    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    core::hash::Hasher::write(&mut hasher, connection_id);
    let hash = hasher.finish128();

    let mut token = [0u8; 16];
    token[..8].copy_from_slice(&hash.h1.to_le_bytes());
    token[8..].copy_from_slice(&hash.h2.to_le_bytes());
    stateless_reset::Token::new(token)
}

/// How many local connection IDs we keep issued to the peer, bounded by
/// the peer's `active_connection_id_limit`
const LOCAL_POOL_TARGET: u64 = 3;

pub const LOCAL_ID_LEN: usize = 8;

#[derive(Clone, Debug)]
struct LocalEntry {
    id: LocalId,
    sequence: u64,
    reset_token: stateless_reset::Token,
    retired: bool,
}

#[derive(Clone, Debug)]
struct RemoteEntry {
    id: PeerId,
    sequence: u64,
    reset_token: Option<stateless_reset::Token>,
    retired: bool,
}

/// Emitted so the dispatch layer can keep its routing map current
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingEvent {
    Added(LocalId),
    Removed(LocalId),
}

#[derive(Debug)]
pub struct IdManager {
    local: SmallVec<[LocalEntry; 4]>,
    next_local_sequence: u64,
    /// The peer's active_connection_id_limit
    peer_active_limit: u64,
    /// Our own advertised active_connection_id_limit
    local_active_limit: u64,
    /// Sequences whose NEW_CONNECTION_ID frame needs (re)transmission
    pending_new: SmallVec<[u64; 2]>,

    remote: SmallVec<[RemoteEntry; 4]>,
    current_remote: u64,
    /// Largest Retire Prior To seen
    retire_prior_to: u64,
    /// Sequences whose RETIRE_CONNECTION_ID frame needs (re)transmission
    pending_retire: SmallVec<[u64; 2]>,

    routing_events: SmallVec<[RoutingEvent; 2]>,
}

impl IdManager {
    /// `initial_local` and `initial_remote` are the IDs the handshake
    /// established with sequence number zero.
    pub fn new(initial_local: LocalId, initial_remote: PeerId, local_active_limit: u64) -> Self {
        let local = LocalEntry {
            id: initial_local,
            sequence: 0,
            // the seq-0 token travels in transport parameters, not here
            reset_token: stateless_reset::Token::ZEROED,
            retired: false,
        };
        let remote = RemoteEntry {
            id: initial_remote,
            sequence: 0,
            reset_token: None,
            retired: false,
        };

        Self {
            local: SmallVec::from_iter([local]),
            next_local_sequence: 1,
            peer_active_limit: 2,
            local_active_limit,
            pending_new: SmallVec::new(),
            remote: SmallVec::from_iter([remote]),
            current_remote: 0,
            retire_prior_to: 0,
            pending_retire: SmallVec::new(),
            routing_events: SmallVec::new(),
        }
    }

    /// Replaces the provisional sequence-0 remote ID with the server's
    /// actual source connection ID from its first Initial packet
    //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
    //# Once a client has received a valid Initial packet from the server,
    //# it MUST discard any packet it receives with a different Source
    //# Connection ID.
    pub fn update_initial_remote_id(&mut self, id: PeerId) {
        if let Some(entry) = self.remote.iter_mut().find(|entry| entry.sequence == 0) {
            entry.id = id;
        }
    }

    pub fn on_peer_parameters(
        &mut self,
        active_connection_id_limit: VarInt,
        stateless_reset_token: Option<[u8; 16]>,
    ) {
        self.peer_active_limit = active_connection_id_limit.as_u64();
        if let (Some(token), Some(entry)) = (
            stateless_reset_token,
            self.remote.iter_mut().find(|entry| entry.sequence == 0),
        ) {
            entry.reset_token = Some(stateless_reset::Token::new(token));
        }
    }

    /// The local ID established during the handshake, used as the SCID
    /// of outgoing long headers
    pub fn handshake_local_id(&self) -> LocalId {
        self.local
            .first()
            .map(|entry| entry.id)
            .expect("the handshake id is never removed")
    }

    /// The connection ID to put in outgoing short headers
    pub fn active_remote_id(&self) -> PeerId {
        self.remote
            .iter()
            .find(|entry| entry.sequence == self.current_remote)
            .map(|entry| entry.id)
            .expect("a current remote id always exists")
    }

    /// The reset token associated with the active remote ID, used to
    /// detect stateless resets from the peer
    pub fn active_reset_token(&self) -> Option<stateless_reset::Token> {
        self.remote
            .iter()
            .find(|entry| entry.sequence == self.current_remote)
            .and_then(|entry| entry.reset_token)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
    //# An endpoint SHOULD ensure that its peer has a sufficient number of
    //# available and unused connection IDs.
    pub fn replenish_local<R: random::Generator + ?Sized>(
        &mut self,
        random: &mut R,
        reset_token_key: &[u8; 16],
    ) {
        let target = LOCAL_POOL_TARGET.min(self.peer_active_limit);

        while (self.local.iter().filter(|entry| !entry.retired).count() as u64) < target {
            let mut id_bytes = [0u8; LOCAL_ID_LEN];
            random.secure_random_fill(&mut id_bytes);
            let id = LocalId::try_from_bytes(&id_bytes).expect("generated length is valid");

            let sequence = self.next_local_sequence;
            self.next_local_sequence += 1;

            self.local.push(LocalEntry {
                id,
                sequence,
                reset_token: derive_reset_token(reset_token_key, id.as_bytes()),
                retired: false,
            });
            self.pending_new.push(sequence);
            self.routing_events.push(RoutingEvent::Added(id));
        }
    }

    /// Frames to transmit, as (sequence, id, token) triples
    pub fn take_new_id_frame(&mut self) -> Option<(VarInt, LocalId, stateless_reset::Token)> {
        loop {
            let sequence = self.pending_new.pop()?;
            if let Some(entry) = self
                .local
                .iter()
                .find(|entry| entry.sequence == sequence && !entry.retired)
            {
                return Some((
                    VarInt::new(sequence).ok()?,
                    entry.id,
                    entry.reset_token,
                ));
            }
        }
    }

    pub fn take_retire_frame(&mut self) -> Option<VarInt> {
        let sequence = self.pending_retire.pop()?;
        VarInt::new(sequence).ok()
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.pending_new.is_empty() || !self.pending_retire.is_empty()
    }

    /// Re-queues frames reported lost
    pub fn on_new_id_frame_lost(&mut self, sequence: VarInt) {
        let sequence = sequence.as_u64();
        if self
            .local
            .iter()
            .any(|entry| entry.sequence == sequence && !entry.retired)
        {
            self.pending_new.push(sequence);
        }
    }

    pub fn on_retire_frame_lost(&mut self, sequence: VarInt) {
        self.pending_retire.push(sequence.as_u64());
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
    //# Receipt of the same frame multiple times MUST NOT be treated as a
    //# connection error.
    pub fn on_new_connection_id(
        &mut self,
        frame: &frame::NewConnectionId,
    ) -> Result<(), transport::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
        //# An endpoint that is sending packets with a zero-length
        //# Destination Connection ID MUST treat receipt of a
        //# NEW_CONNECTION_ID frame as a connection error of type
        //# PROTOCOL_VIOLATION.
        if self.active_remote_id().is_empty() {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("NEW_CONNECTION_ID with zero-length ids in use"));
        }

        let sequence = frame.sequence_number.as_u64();
        let id = PeerId::try_from_bytes(frame.connection_id)
            .ok_or(transport::Error::FRAME_ENCODING_ERROR)?;
        let token = stateless_reset::Token::new(*frame.stateless_reset_token);

        if let Some(existing) = self.remote.iter().find(|entry| entry.sequence == sequence) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# if a sequence number is used for different connection IDs,
            //# the endpoint MAY treat that receipt as a connection error of
            //# type PROTOCOL_VIOLATION.
            if existing.id != id {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("sequence number reused for a different connection id"));
            }
            return Ok(());
        }

        let retired = sequence < self.retire_prior_to.max(frame.retire_prior_to.as_u64());
        self.remote.push(RemoteEntry {
            id,
            sequence,
            reset_token: Some(token),
            retired,
        });
        if retired {
            self.pending_retire.push(sequence);
        }

        self.process_retire_prior_to(frame.retire_prior_to.as_u64())?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and adding and
        //# retiring active connection IDs, if the number of active
        //# connection IDs exceeds the value advertised in its
        //# active_connection_id_limit transport parameter, an endpoint MUST
        //# close the connection with an error of type
        //# CONNECTION_ID_LIMIT_ERROR.
        let active = self.remote.iter().filter(|entry| !entry.retired).count() as u64;
        if active > self.local_active_limit {
            return Err(transport::Error::CONNECTION_ID_LIMIT_ERROR);
        }

        Ok(())
    }

    fn process_retire_prior_to(&mut self, retire_prior_to: u64) -> Result<(), transport::Error> {
        if retire_prior_to <= self.retire_prior_to {
            return Ok(());
        }
        self.retire_prior_to = retire_prior_to;

        for entry in self.remote.iter_mut() {
            if entry.sequence < retire_prior_to && !entry.retired {
                entry.retired = true;
                self.pending_retire.push(entry.sequence);
            }
        }

        // the active id may itself have been retired
        if self
            .remote
            .iter()
            .find(|entry| entry.sequence == self.current_remote)
            .map_or(true, |entry| entry.retired)
        {
            let replacement = self
                .remote
                .iter()
                .filter(|entry| !entry.retired)
                .map(|entry| entry.sequence)
                .min()
                .ok_or(
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.2
                    //# An endpoint that selects a zero-length connection ID during
                    //# the handshake cannot issue a new connection ID.
                    transport::Error::PROTOCOL_VIOLATION
                        .with_reason("no usable connection ids remain"),
                )?;
            self.current_remote = replacement;
        }

        Ok(())
    }

    /// Rotates to a fresh remote ID, e.g. after a path migration.
    ///
    /// Returns `false` when the pool has no unused ID; sending continues
    /// with the current one.
    pub fn rotate_remote(&mut self) -> bool {
        let next = self
            .remote
            .iter()
            .filter(|entry| !entry.retired && entry.sequence != self.current_remote)
            .map(|entry| entry.sequence)
            .min();

        match next {
            Some(next) => {
                let old = self.current_remote;
                self.current_remote = next;
                if let Some(entry) = self.remote.iter_mut().find(|entry| entry.sequence == old) {
                    entry.retired = true;
                }
                self.pending_retire.push(old);
                true
            }
            None => false,
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
    //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence
    //# number greater than any previously sent to the peer MUST be
    //# treated as a connection error of type PROTOCOL_VIOLATION.
    pub fn on_retire_connection_id(
        &mut self,
        frame: &frame::RetireConnectionId,
        datagram_dcid: &[u8],
    ) -> Result<(), transport::Error> {
        let sequence = frame.sequence_number.as_u64();

        if sequence >= self.next_local_sequence {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("retirement of an unissued connection id"));
        }

        let entry = match self
            .local
            .iter_mut()
            .find(|entry| entry.sequence == sequence)
        {
            Some(entry) => entry,
            // already retired and removed
            None => return Ok(()),
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# The sequence number specified in a RETIRE_CONNECTION_ID frame MUST
        //# NOT refer to the Destination Connection ID field of the packet in
        //# which the frame is contained.
        if entry.id.as_bytes() == datagram_dcid {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("peer retired the connection id it sent with"));
        }

        if !entry.retired {
            entry.retired = true;
            let id = entry.id;
            self.routing_events.push(RoutingEvent::Removed(id));
        }

        Ok(())
    }

    /// Routing updates for the dispatch layer
    pub fn take_routing_events(&mut self) -> SmallVec<[RoutingEvent; 2]> {
        core::mem::take(&mut self.routing_events)
    }

    /// Remote IDs available for sending
    pub fn usable_remote_ids(&self) -> usize {
        self.remote.iter().filter(|entry| !entry.retired).count()
    }
}
