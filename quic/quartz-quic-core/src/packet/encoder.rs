// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet sealing: header encoding, AEAD encryption and header
//! protection, writing directly into the outgoing datagram buffer.

use crate::{
    crypto::{self, packet_protection, HeaderKey, Key, RetryKey},
    packet::{number::PacketNumber, KeyPhase, PacketKind},
    varint::VarInt,
};
use quartz_codec::{Encoder as _, EncoderBuffer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The datagram buffer cannot hold the packet
    InsufficientSpace,

    /// The packet number cannot be truncated against the largest
    /// acknowledged value
    PacketNumberTruncation,

    /// The AEAD rejected the payload
    Protection(packet_protection::Error),
}

impl From<packet_protection::Error> for Error {
    fn from(error: packet_protection::Error) -> Self {
        Self::Protection(error)
    }
}

/// Long headers always encode their Length field on 2 bytes so the
/// payload can be written before the final length is known
const LENGTH_FIELD_LEN: usize = 2;
const MAX_LENGTH_FIELD_VALUE: usize = 16383;

#[derive(Clone, Copy, Debug)]
pub struct LongHeader<'a> {
    pub kind: PacketKind,
    pub version: u32,
    pub destination_connection_id: &'a [u8],
    pub source_connection_id: &'a [u8],
    /// Only encoded for Initial packets
    pub token: &'a [u8],
}

#[derive(Clone, Copy, Debug)]
pub struct ShortHeader<'a> {
    pub destination_connection_id: &'a [u8],
    pub spin_bit: bool,
    pub key_phase: KeyPhase,
}

impl<'a> LongHeader<'a> {
    /// Bytes occupied before the Packet Number field
    pub fn len(&self) -> usize {
        let mut len = 1 + 4;
        len += 1 + self.destination_connection_id.len();
        len += 1 + self.source_connection_id.len();
        if matches!(self.kind, PacketKind::Initial) {
            len += VarInt::try_from(self.token.len())
                .map_or(8, |token_len| token_len.encoding_size());
            len += self.token.len();
        }
        len += LENGTH_FIELD_LEN;
        len
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<'a> ShortHeader<'a> {
    pub fn len(&self) -> usize {
        1 + self.destination_connection_id.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Seals a long-header packet into `encoder`.
///
/// `pad_packet_to` grows the plaintext with PADDING so the finished
/// packet reaches at least the given size. Returns the packet length.
pub fn seal_long_packet<K: Key, H: HeaderKey>(
    encoder: &mut EncoderBuffer,
    header: LongHeader,
    packet_number: PacketNumber,
    largest_acked: Option<PacketNumber>,
    payload: &[u8],
    pad_packet_to: Option<usize>,
    key: &mut K,
    header_key: &H,
) -> Result<usize, Error> {
    debug_assert!(!matches!(header.kind, PacketKind::OneRtt));

    let space = header.kind.space();
    let truncated = packet_number
        .truncate(largest_acked.unwrap_or_else(|| space.new_packet_number(VarInt::ZERO)))
        .ok_or(Error::PacketNumberTruncation)?;
    let pn_len = truncated.bytesize();

    let header_len = header.len();
    let tag_len = key.tag_len();
    let sample_len = header_key.sealing_sample_len();

    let padding = padding_len(
        header_len,
        pn_len,
        payload.len(),
        tag_len,
        sample_len,
        pad_packet_to,
    );

    let packet_len = header_len + pn_len + payload.len() + padding + tag_len;
    if packet_len > encoder.remaining_capacity() {
        return Err(Error::InsufficientSpace);
    }

    let length_value = pn_len + payload.len() + padding + tag_len;
    if length_value > MAX_LENGTH_FIELD_VALUE {
        return Err(Error::InsufficientSpace);
    }

    let start = encoder.len();

    let mut first: u8 = 0b1100_0000;
    first |= header.kind.long_type_bits() << 4;
    first |= truncated.len().into_tag_bits();
    encoder.encode(&first);
    encoder.encode(&header.version);
    encoder.encode_with_len_prefix::<u8, _>(&header.destination_connection_id);
    encoder.encode_with_len_prefix::<u8, _>(&header.source_connection_id);

    if matches!(header.kind, PacketKind::Initial) {
        encoder.encode_with_len_prefix::<VarInt, _>(&header.token);
    }

    // 2-byte varint form
    encoder.encode(&((length_value as u16) | 0x4000u16));
    encoder.encode(&truncated);
    encoder.write_slice(payload);
    encoder.write_repeated(padding, 0);
    encoder.write_repeated(tag_len, 0);

    protect_in_place(
        encoder,
        start,
        header_len,
        pn_len,
        packet_number,
        key,
        header_key,
    )?;

    Ok(packet_len)
}

/// Seals a 1-RTT short-header packet into `encoder`
pub fn seal_short_packet<K: Key, H: HeaderKey>(
    encoder: &mut EncoderBuffer,
    header: ShortHeader,
    packet_number: PacketNumber,
    largest_acked: Option<PacketNumber>,
    payload: &[u8],
    key: &mut K,
    header_key: &H,
) -> Result<usize, Error> {
    let space = crate::packet::number::PacketNumberSpace::ApplicationData;
    let truncated = packet_number
        .truncate(largest_acked.unwrap_or_else(|| space.new_packet_number(VarInt::ZERO)))
        .ok_or(Error::PacketNumberTruncation)?;
    let pn_len = truncated.bytesize();

    let header_len = header.len();
    let tag_len = key.tag_len();
    let sample_len = header_key.sealing_sample_len();

    let padding = padding_len(header_len, pn_len, payload.len(), tag_len, sample_len, None);

    let packet_len = header_len + pn_len + payload.len() + padding + tag_len;
    if packet_len > encoder.remaining_capacity() {
        return Err(Error::InsufficientSpace);
    }

    let start = encoder.len();

    let mut first: u8 = 0b0100_0000;
    if header.spin_bit {
        first |= 0b0010_0000;
    }
    if matches!(header.key_phase, KeyPhase::One) {
        first |= 0b0000_0100;
    }
    first |= truncated.len().into_tag_bits();
    encoder.encode(&first);
    encoder.write_slice(header.destination_connection_id);
    encoder.encode(&truncated);
    encoder.write_slice(payload);
    encoder.write_repeated(padding, 0);
    encoder.write_repeated(tag_len, 0);

    protect_in_place(
        encoder,
        start,
        header_len,
        pn_len,
        packet_number,
        key,
        header_key,
    )?;

    Ok(packet_len)
}

/// Plaintext padding needed to satisfy the header-protection sample and
/// any caller-requested minimum packet size
fn padding_len(
    header_len: usize,
    pn_len: usize,
    payload_len: usize,
    tag_len: usize,
    sample_len: usize,
    pad_packet_to: Option<usize>,
) -> usize {
    //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
    //# An endpoint MUST adjust the size of packets it sends to ensure
    //# that there are at least 4 bytes beyond the sample offset for
    //# sampling.
    let min_ciphertext = 4 - pn_len + sample_len;
    let mut padding = min_ciphertext.saturating_sub(payload_len + tag_len);

    if let Some(target) = pad_packet_to {
        let unpadded = header_len + pn_len + payload_len + tag_len;
        padding = padding.max(target.saturating_sub(unpadded));
    }

    padding
}

fn protect_in_place<K: Key, H: HeaderKey>(
    encoder: &mut EncoderBuffer,
    start: usize,
    header_len: usize,
    pn_len: usize,
    packet_number: PacketNumber,
    key: &mut K,
    header_key: &H,
) -> Result<(), Error> {
    let (written, _remaining) = encoder.split_mut();
    let packet = &mut written[start..];

    let payload_start = header_len + pn_len;
    {
        let (aad, payload) = packet.split_at_mut(payload_start);
        key.encrypt(packet_number.as_u64(), aad, payload)?;
    }

    let sample_start = header_len + 4;
    let sample_len = header_key.sealing_sample_len();
    let sample = packet
        .get(sample_start..sample_start + sample_len)
        .ok_or(Error::InsufficientSpace)?;
    let mask = header_key.sealing_header_protection_mask(sample);

    crypto::apply_header_protection(mask, packet, header_len, pn_len);

    Ok(())
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
//# The layout of a Version Negotiation packet is:
//#
//# Version Negotiation Packet {
//#   Header Form (1) = 1,
//#   Unused (7),
//#   Version (32) = 0,
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..2040),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..2040),
//#   Supported Version (32) ...,
//# }
pub fn encode_version_negotiation(
    encoder: &mut EncoderBuffer,
    destination_connection_id: &[u8],
    source_connection_id: &[u8],
    supported_versions: &[u32],
) {
    encoder.encode(&0b1000_0000u8);
    encoder.encode(&crate::packet::version::VERSION_NEGOTIATION);
    encoder.encode_with_len_prefix::<u8, _>(&destination_connection_id);
    encoder.encode_with_len_prefix::<u8, _>(&source_connection_id);
    for version in supported_versions {
        encoder.encode(version);
    }
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The Retry Integrity Tag is computed as the output of AEAD_AES_128_GCM
//# with ... the Retry Pseudo-Packet described in Figure 8 as the
//# associated data.
#[cfg(feature = "alloc")]
pub fn encode_retry<R: RetryKey>(
    encoder: &mut EncoderBuffer,
    version: u32,
    destination_connection_id: &[u8],
    source_connection_id: &[u8],
    original_destination_connection_id: &[u8],
    token: &[u8],
) {
    let start = encoder.len();

    // type 0b11, unused bits zero
    encoder.encode(&0b1111_0000u8);
    encoder.encode(&version);
    encoder.encode_with_len_prefix::<u8, _>(&destination_connection_id);
    encoder.encode_with_len_prefix::<u8, _>(&source_connection_id);
    encoder.write_slice(token);

    let tag = {
        let (written, _) = encoder.split_mut();
        let packet = &written[start..];

        let mut pseudo_packet =
            alloc::vec::Vec::with_capacity(1 + original_destination_connection_id.len() + packet.len());
        pseudo_packet.push(original_destination_connection_id.len() as u8);
        pseudo_packet.extend_from_slice(original_destination_connection_id);
        pseudo_packet.extend_from_slice(packet);

        R::generate_tag(&pseudo_packet)
    };

    encoder.write_slice(&tag);
}

/// Rebuilds the pseudo-packet for validating a received Retry
#[cfg(feature = "alloc")]
pub fn retry_pseudo_packet(
    original_destination_connection_id: &[u8],
    retry_packet_without_tag: &[u8],
) -> alloc::vec::Vec<u8> {
    let mut pseudo_packet = alloc::vec::Vec::with_capacity(
        1 + original_destination_connection_id.len() + retry_packet_without_tag.len(),
    );
    pseudo_packet.push(original_destination_connection_id.len() as u8);
    pseudo_packet.extend_from_slice(original_destination_connection_id);
    pseudo_packet.extend_from_slice(retry_packet_without_tag);
    pseudo_packet
}
