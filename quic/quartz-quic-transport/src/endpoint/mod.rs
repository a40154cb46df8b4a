// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The dispatch layer.
//!
//! The Master owns the connection-ID routing map and performs the
//! stateless work: version negotiation, Retry admission, stateless
//! resets, and routing datagrams to the Worker that owns the
//! connection. Everything per-connection happens on a single Worker
//! loop; cross-worker effects travel as [`worker::Task`] messages.

use crate::connection::id_manager::{self, derive_reset_token};
use core::marker::PhantomData;
use hashbrown::HashMap;
use quartz_codec::{Encoder as _, EncoderBuffer};
use quartz_quic_core::{
    connection::id::InitialId,
    crypto::RetryKey,
    inet::SocketAddress,
    packet::{self, encoder::encode_version_negotiation, version, Packet},
    path::MINIMUM_MAX_DATAGRAM_SIZE,
    random,
    stateless_reset,
    time::Timestamp,
    token::{self, Format as _},
};
use std::hash::BuildHasherDefault;

pub mod worker;

pub use worker::{Task, Worker, WorkerId};

/// The routing map hashes untrusted connection IDs; a keyed hasher
/// keeps attackers from grinding collisions
type RoutingMap = HashMap<Vec<u8>, WorkerId, BuildHasherDefault<siphasher::sip::SipHasher13>>;

/// What the Master decided about one datagram
#[derive(Debug)]
pub enum Disposition {
    /// Forward to the worker owning the connection
    Route { worker: WorkerId },

    /// Accept as a new connection on the given worker
    Accept {
        worker: WorkerId,
        original_destination_id: InitialId,
        retry_token: Vec<u8>,
    },

    /// Answer with a stateless packet (VN, Retry, stateless reset)
    Transmit(Vec<u8>),

    Drop(&'static str),
}

pub struct Config {
    /// Send Retry packets before accepting new connections
    pub use_retry: bool,
    pub worker_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_retry: false,
            worker_count: 1,
        }
    }
}

/// The server-side dispatcher.
///
/// `K` supplies the Retry integrity tag; production wires in the crypto
/// crate's implementation, tests use the null key.
pub struct Master<T: token::Format, K: RetryKey> {
    routing: RoutingMap,
    config: Config,
    token_format: T,
    /// Round-robin assignment of new connections
    next_worker: usize,
    /// Endpoint-wide key for stateless reset tokens
    reset_token_key: [u8; 16],
    retry_key: PhantomData<K>,
}

impl<T: token::Format, K: RetryKey> Master<T, K> {
    pub fn new<R: random::Generator>(config: Config, token_format: T, random: &mut R) -> Self {
        let mut reset_token_key = [0u8; 16];
        random.secure_random_fill(&mut reset_token_key);

        Self {
            routing: RoutingMap::default(),
            config,
            token_format,
            next_worker: 0,
            reset_token_key,
            retry_key: PhantomData,
        }
    }

    #[inline]
    pub fn reset_token_key(&self) -> [u8; 16] {
        self.reset_token_key
    }

    /// Adds a routing entry, e.g. when a worker issues a new local ID
    pub fn add_connection_id(&mut self, id: &[u8], worker: WorkerId) {
        self.routing.insert(id.to_vec(), worker);
    }

    pub fn retire_connection_id(&mut self, id: &[u8]) {
        self.routing.remove(id);
    }

    #[inline]
    pub fn routed_connections(&self) -> usize {
        self.routing.len()
    }

    /// Classifies one incoming datagram
    pub fn on_datagram(
        &mut self,
        now: Timestamp,
        remote_address: &SocketAddress,
        payload: &mut [u8],
    ) -> Disposition {
        let datagram_len = payload.len();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-6
        //# The Version Negotiation packet is a response to a client packet
        //# that contains a version that is not supported by the server.
        // a long header with an unknown version cannot be parsed further;
        // answer before attempting a structured decode
        if let Some(disposition) = self.check_version(datagram_len, payload) {
            return disposition;
        }

        let (packet, _) =
            match Packet::decode(
                quartz_codec::DecoderBufferMut::new(payload),
                id_manager::LOCAL_ID_LEN,
            ) {
                Ok(decoded) => decoded,
                Err(_) => return drop_datagram("undecodable header"),
            };

        let dcid = packet.destination_connection_id().to_vec();
        if let Some(worker) = self.routing.get(dcid.as_slice()) {
            return Disposition::Route { worker: *worker };
        }

        match packet {
            Packet::Protected(packet) if matches!(packet.kind(), packet::PacketKind::Initial) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
                //# A server MUST discard an Initial packet that is carried in a
                //# UDP datagram with a payload that is smaller than the
                //# smallest allowed maximum datagram size of 1200 bytes.
                if datagram_len < MINIMUM_MAX_DATAGRAM_SIZE as usize {
                    return drop_datagram("initial datagram below 1200 bytes");
                }

                let original_destination_id =
                    match InitialId::try_from_bytes(packet.destination_connection_id()) {
                        Some(id) => id,
                        None => return drop_datagram("initial dcid too short"),
                    };

                let token = packet.token();
                if !token.is_empty() {
                    match self.token_format.validate_token(
                        now,
                        remote_address,
                        original_destination_id.as_bytes(),
                        token::Source::RetryPacket,
                        token,
                    ) {
                        token::Outcome::Valid => {}
                        token::Outcome::Invalid => {
                            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1.3
                            //# If the token is invalid, then the server SHOULD
                            //# proceed as if the client did not have a validated
                            //# address, including potentially sending a Retry
                            return drop_datagram("invalid retry token");
                        }
                    }
                } else if self.config.use_retry {
                    return self.retry(now, remote_address, &packet);
                }

                let worker = WorkerId(self.next_worker % self.config.worker_count.max(1));
                self.next_worker = self.next_worker.wrapping_add(1);
                self.routing.insert(dcid, worker);

                Disposition::Accept {
                    worker,
                    original_destination_id,
                    retry_token: token.to_vec(),
                }
            }
            Packet::Protected(packet) if matches!(packet.kind(), packet::PacketKind::OneRtt) => {
                self.stateless_reset(datagram_len, packet.destination_connection_id())
            }
            _ => drop_datagram("unroutable packet"),
        }
    }

    /// Answers long-header packets carrying an unsupported version
    fn check_version(&self, datagram_len: usize, payload: &[u8]) -> Option<Disposition> {
        if payload.len() < 7 || payload[0] & 0x80 == 0 {
            return None;
        }

        let packet_version =
            u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        if version::is_supported(packet_version)
            || packet_version == version::VERSION_NEGOTIATION
        {
            return None;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.2.2
        //# If a server receives a packet that indicates an unsupported
        //# version and if the packet is large enough to initiate a new
        //# connection for any supported version, the server SHOULD send
        //# a Version Negotiation packet
        if datagram_len < MINIMUM_MAX_DATAGRAM_SIZE as usize {
            return Some(drop_datagram("unsupported version in a small datagram"));
        }

        let dcid_len = payload[5] as usize;
        let dcid_end = 6 + dcid_len;
        let scid_len = *payload.get(dcid_end)? as usize;
        let scid_end = dcid_end + 1 + scid_len;
        if dcid_len > 20 || scid_len > 20 || payload.len() < scid_end {
            return Some(drop_datagram("malformed unsupported-version packet"));
        }
        let dcid = &payload[6..dcid_end];
        let scid = &payload[dcid_end + 1..scid_end];

        let mut datagram = vec![0u8; 256];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut datagram);
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
            //# The server MUST include the value from the Source Connection ID
            //# field of the packet it receives in the Destination Connection
            //# ID field.
            encode_version_negotiation(&mut encoder, scid, dcid, &version::SUPPORTED_VERSIONS);
            encoder.len()
        };
        datagram.truncate(len);
        Some(Disposition::Transmit(datagram))
    }

    fn retry(
        &mut self,
        now: Timestamp,
        remote_address: &SocketAddress,
        packet: &packet::ProtectedPacket,
    ) -> Disposition {
        let mut token = vec![0u8; T::TOKEN_LEN];
        let Some(token_len) = self.token_format.generate_retry_token(
            now,
            remote_address,
            packet.destination_connection_id(),
            &mut token,
        ) else {
            return drop_datagram("token generation failed");
        };
        token.truncate(token_len);

        // a server-chosen connection id becomes the client's new
        // destination; the follow-up Initial carries the token, so the
        // id never needs a routing entry
        let new_scid = derive_reset_token(&self.reset_token_key, packet.destination_connection_id());

        let mut datagram = vec![0u8; 512];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut datagram);
            packet::encoder::encode_retry::<K>(
                &mut encoder,
                packet.version(),
                packet.source_connection_id(),
                &new_scid.as_bytes()[..id_manager::LOCAL_ID_LEN],
                packet.destination_connection_id(),
                &token,
            );
            encoder.len()
        };
        datagram.truncate(len);
        Disposition::Transmit(datagram)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
    //# An endpoint that receives packets that it cannot process sends a
    //# packet in the following layout
    fn stateless_reset(&self, received_len: usize, dcid: &[u8]) -> Disposition {
        if received_len < stateless_reset::MIN_DATAGRAM_LEN + 1 {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
            //# An endpoint MUST NOT send a Stateless Reset that is three times
            //# or more larger than the packet it receives
            return drop_datagram("too short for a stateless reset");
        }

        let token = derive_reset_token(&self.reset_token_key, dcid);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
        //# An endpoint that sends a Stateless Reset in response to a packet
        //# that is 43 bytes or shorter SHOULD send a Stateless Reset that is
        //# one byte shorter than the packet it responds to.
        let reset_len = (received_len - 1).min(64).max(stateless_reset::MIN_DATAGRAM_LEN);
        let mut datagram = vec![0u8; reset_len];

        // unpredictable bits with a short-header pattern up front
        let filler = derive_reset_token(&self.reset_token_key, &datagram.len().to_le_bytes());
        for (index, byte) in datagram.iter_mut().enumerate() {
            *byte = filler.as_bytes()[index % 16] ^ (index as u8).wrapping_mul(53);
        }
        datagram[0] = 0b0100_0000 | (datagram[0] & 0b0011_1111);

        let token_start = reset_len - 16;
        datagram[token_start..].copy_from_slice(token.as_bytes());

        Disposition::Transmit(datagram)
    }
}

fn drop_datagram(reason: &'static str) -> Disposition {
    tracing::trace!(reason, "datagram dropped");
    Disposition::Drop(reason)
}

#[cfg(test)]
mod tests;
