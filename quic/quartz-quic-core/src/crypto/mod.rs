// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Traits binding an AEAD implementation to packet protection.
//!
//! The concrete cipher suites live in `quartz-quic-crypto`; everything
//! here is expressed against these traits so the connection machinery can
//! run under test with null keys.

use crate::packet::number::{PacketNumberSpace, TruncatedPacketNumber};
use quartz_codec::{DecoderBuffer, DecoderError};

pub mod application;
pub mod initial;
pub mod packet_protection;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use application::KeySet;

/// The encryption level of a packet or of handshake data
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl Level {
    /// The packet number space protected by keys of this level
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        match self {
            Self::Initial => PacketNumberSpace::Initial,
            Self::Handshake => PacketNumberSpace::Handshake,
            Self::ZeroRtt | Self::OneRtt => PacketNumberSpace::ApplicationData,
        }
    }
}

/// A pair of AEAD keys protecting packet payloads at one level
pub trait Key: Send {
    /// Decrypts `payload` (ciphertext followed by the AEAD tag) in place.
    ///
    /// On success the plaintext occupies `payload[..payload.len() - tag_len()]`.
    fn decrypt(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), packet_protection::Error>;

    /// Encrypts `payload` in place.
    ///
    /// The final `tag_len()` bytes of `payload` are reserved for the tag
    /// and overwritten.
    fn encrypt(
        &mut self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), packet_protection::Error>;

    /// Length of the appended tag
    fn tag_len(&self) -> usize;

    //= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
    //# Endpoints MUST count the number of encrypted packets for each set of
    //# keys.
    fn aead_confidentiality_limit(&self) -> u64;

    fn aead_integrity_limit(&self) -> u64;
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# The output of this algorithm is a 5-byte mask that is applied to the
//# protected header fields using exclusive OR.

pub const HEADER_PROTECTION_MASK_LEN: usize = 5;
pub type HeaderProtectionMask = [u8; HEADER_PROTECTION_MASK_LEN];

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
//# in sampling packet ciphertext for header protection, the Packet Number field is
//# assumed to be 4 bytes long (its maximum possible encoded length).

pub const HEADER_PROTECTION_SAMPLE_LEN: usize = 16;

/// Computes header protection masks from a ciphertext sample
pub trait HeaderKey: Send {
    fn opening_header_protection_mask(&self, ciphertext_sample: &[u8]) -> HeaderProtectionMask;

    fn opening_sample_len(&self) -> usize;

    fn sealing_header_protection_mask(&self, ciphertext_sample: &[u8]) -> HeaderProtectionMask;

    fn sealing_sample_len(&self) -> usize;
}

/// Initial-level keys, derived from the client's first Destination
/// Connection ID
pub trait InitialKey: Key + Sized {
    type HeaderKey: HeaderKey;

    fn new_server(connection_id: &[u8]) -> (Self, Self::HeaderKey);
    fn new_client(connection_id: &[u8]) -> (Self, Self::HeaderKey);
}

pub trait HandshakeKey: Key {}

pub trait ZeroRttKey: Key {}

pub trait OneRttKey: Key {
    /// Derives the key for the next key phase
    fn derive_next_key(&self) -> Self;
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# Retry packets (see Section 17.2.5 of [QUIC-TRANSPORT]) carry a Retry
//# Integrity Tag that provides two properties: it allows the discarding
//# of packets that have accidentally been corrupted by the network, and
//# only an entity that observes an Initial packet can send a valid Retry
//# packet.

pub trait RetryKey {
    fn generate_tag(pseudo_packet: &[u8]) -> [u8; 16];

    fn validate(pseudo_packet: &[u8], tag: &[u8; 16]) -> Result<(), packet_protection::Error>;
}

/// The full set of key types a TLS implementation provides
pub trait CryptoSuite {
    type InitialKey: InitialKey<HeaderKey = Self::InitialHeaderKey>;
    type InitialHeaderKey: HeaderKey;
    type HandshakeKey: HandshakeKey;
    type HandshakeHeaderKey: HeaderKey;
    type ZeroRttKey: ZeroRttKey;
    type ZeroRttHeaderKey: HeaderKey;
    type OneRttKey: OneRttKey;
    type OneRttHeaderKey: HeaderKey;
    type RetryKey: RetryKey;
}

const LONG_HEADER_TAG: u8 = 0x80;
pub(crate) const LONG_HEADER_MASK: u8 = 0x0f;
pub(crate) const SHORT_HEADER_MASK: u8 = 0x1f;

#[inline(always)]
fn mask_from_packet_tag(tag: u8) -> u8 {
    if tag & LONG_HEADER_TAG == LONG_HEADER_TAG {
        LONG_HEADER_MASK
    } else {
        SHORT_HEADER_MASK
    }
}

#[inline(always)]
fn xor_mask(packet_number_bytes: &mut [u8], mask: &HeaderProtectionMask) {
    for (byte, mask_byte) in packet_number_bytes.iter_mut().zip(&mask[1..]) {
        *byte ^= mask_byte;
    }
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# mask = header_protection(hp_key, sample)
//#
//# pn_length = (packet[0] & 0x03) + 1
//# if (packet[0] & 0x80) == 0x80:
//#    # Long header: 4 bits masked
//#    packet[0] ^= mask[0] & 0x0f
//# else:
//#    # Short header: 5 bits masked
//#    packet[0] ^= mask[0] & 0x1f
//#
//# # pn_offset is the start of the Packet Number field.
//# packet[pn_offset:pn_offset+pn_length] ^= mask[1:1+pn_length]

/// Protects the tag bits and packet number bytes of an encrypted packet
#[inline]
pub(crate) fn apply_header_protection(
    mask: HeaderProtectionMask,
    packet: &mut [u8],
    header_len: usize,
    packet_number_len: usize,
) {
    packet[0] ^= mask[0] & mask_from_packet_tag(packet[0]);
    xor_mask(&mut packet[header_len..header_len + packet_number_len], &mask);
}

/// Removes header protection, returning the truncated packet number
#[inline]
pub(crate) fn remove_header_protection(
    space: PacketNumberSpace,
    mask: HeaderProtectionMask,
    packet: &mut [u8],
    header_len: usize,
) -> Result<TruncatedPacketNumber, DecoderError> {
    packet[0] ^= mask[0] & mask_from_packet_tag(packet[0]);
    let packet_number_len = space.new_packet_number_len(packet[0]);

    let pn_end = header_len
        .checked_add(packet_number_len.bytesize())
        .ok_or(DecoderError::UnexpectedEof(header_len))?;
    let packet_number_bytes = packet
        .get_mut(header_len..pn_end)
        .ok_or(DecoderError::UnexpectedEof(pn_end))?;
    xor_mask(packet_number_bytes, &mask);

    let (packet_number, _) = packet_number_len
        .decode_truncated_packet_number(DecoderBuffer::new(&packet[header_len..pn_end]), space)?;

    Ok(packet_number)
}
