// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet parsing and protection.
//!
//! A received datagram is split into packets with [`Packet::decode`];
//! protected packets then pass through header-protection removal
//! ([`ProtectedPacket::unprotect`]) and AEAD decryption
//! ([`EncryptedPacket::decrypt`]). The sealing direction lives in
//! [`encoder`].
//!
//! The deep packet-class hierarchy of classical implementations is
//! flattened here: one struct per protection stage, tagged by
//! [`PacketKind`], holding byte ranges into a single packet buffer.

use crate::{
    crypto::{self, packet_protection, HeaderKey, Key},
    packet::number::{PacketNumber, PacketNumberLen, PacketNumberSpace},
    varint::VarInt,
};
use core::ops::Range;
use quartz_codec::{DecoderBuffer, DecoderBufferMut, DecoderError};

pub mod encoder;
pub mod number;
pub mod version;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Header Form:  The most significant bit (0x80) of byte 0 (the first
//#    byte) is set to 1 for long headers.

const LONG_HEADER_FORM: u8 = 0x80;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1, unless the
//#    packet is a Version Negotiation packet.

const FIXED_BIT: u8 = 0x40;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# Key Phase:  The next bit (0x04) of byte 0 indicates the key phase,
//#    which allows a recipient of a packet to identify the packet
//#    protection keys that are used to protect the packet.

const KEY_PHASE_BIT: u8 = 0x04;

const SPIN_BIT: u8 = 0x20;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# In QUIC version 1, this value MUST NOT exceed 20 bytes.

pub const DESTINATION_CONNECTION_ID_MAX_LEN: usize = 20;

/// The phase of the 1-RTT packet protection keys
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyPhase {
    #[default]
    Zero = 0,
    One = 1,
}

impl KeyPhase {
    #[inline]
    pub fn next(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    #[inline]
    fn from_tag(tag: u8) -> Self {
        if tag & KEY_PHASE_BIT == KEY_PHASE_BIT {
            Self::One
        } else {
            Self::Zero
        }
    }
}

/// The kind of a protected packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl PacketKind {
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        match self {
            Self::Initial => PacketNumberSpace::Initial,
            Self::Handshake => PacketNumberSpace::Handshake,
            Self::ZeroRtt | Self::OneRtt => PacketNumberSpace::ApplicationData,
        }
    }

    #[inline]
    pub fn level(self) -> crypto::Level {
        match self {
            Self::Initial => crypto::Level::Initial,
            Self::ZeroRtt => crypto::Level::ZeroRtt,
            Self::Handshake => crypto::Level::Handshake,
            Self::OneRtt => crypto::Level::OneRtt,
        }
    }

    /// The long-header packet type bits for this kind
    #[inline]
    fn long_type_bits(self) -> u8 {
        match self {
            Self::Initial => 0b00,
            Self::ZeroRtt => 0b01,
            Self::Handshake => 0b10,
            Self::OneRtt => unreachable!("1-RTT packets use the short header"),
        }
    }
}

/// A packet whose header protection is still in place
pub struct ProtectedPacket<'a> {
    kind: PacketKind,
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token: Range<usize>,
    /// Offset of the protected packet number field
    header_len: usize,
    packet: &'a mut [u8],
}

/// A packet with its packet number recovered but its payload still sealed
pub struct EncryptedPacket<'a> {
    kind: PacketKind,
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token: Range<usize>,
    header_len: usize,
    packet_number: PacketNumber,
    packet_number_len: PacketNumberLen,
    key_phase: KeyPhase,
    packet: &'a mut [u8],
}

/// A fully decrypted packet
pub struct CleartextPacket<'a> {
    kind: PacketKind,
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token: Range<usize>,
    packet_number: PacketNumber,
    key_phase: KeyPhase,
    payload: Range<usize>,
    packet: &'a [u8],
}

/// A Retry packet (never protected; carries an integrity tag)
pub struct Retry<'a> {
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token: Range<usize>,
    packet: &'a [u8],
}

/// A Version Negotiation packet
pub struct VersionNegotiation<'a> {
    dcid: Range<usize>,
    scid: Range<usize>,
    versions: Range<usize>,
    packet: &'a [u8],
}

/// Any packet decoded out of a datagram
pub enum Packet<'a> {
    Protected(ProtectedPacket<'a>),
    Retry(Retry<'a>),
    VersionNegotiation(VersionNegotiation<'a>),
}

struct ParsedHeader {
    kind: PacketKind,
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token: Range<usize>,
    header_len: usize,
    packet_len: usize,
}

enum Parsed {
    Protected(ParsedHeader),
    Retry {
        version: u32,
        dcid: Range<usize>,
        scid: Range<usize>,
        token: Range<usize>,
    },
    VersionNegotiation {
        dcid: Range<usize>,
        scid: Range<usize>,
        versions: Range<usize>,
    },
}

impl<'a> Packet<'a> {
    /// Splits one packet off the front of `buffer`.
    ///
    /// `local_dcid_len` is the length this endpoint encodes in the
    /// connection IDs it issues; short headers carry no explicit length.
    pub fn decode(
        buffer: DecoderBufferMut<'a>,
        local_dcid_len: usize,
    ) -> Result<(Packet<'a>, DecoderBufferMut<'a>), DecoderError> {
        let bytes = buffer.into_less_safe_slice();

        let parsed = parse_header(&bytes[..], local_dcid_len)?;

        match parsed {
            Parsed::Protected(header) => {
                let (packet, remaining) = bytes.split_at_mut(header.packet_len);
                Ok((
                    Packet::Protected(ProtectedPacket {
                        kind: header.kind,
                        version: header.version,
                        dcid: header.dcid,
                        scid: header.scid,
                        token: header.token,
                        header_len: header.header_len,
                        packet,
                    }),
                    DecoderBufferMut::new(remaining),
                ))
            }
            Parsed::Retry {
                version,
                dcid,
                scid,
                token,
            } => {
                let packet_len = bytes.len();
                let (packet, remaining) = bytes.split_at_mut(packet_len);
                Ok((
                    Packet::Retry(Retry {
                        version,
                        dcid,
                        scid,
                        token,
                        packet,
                    }),
                    DecoderBufferMut::new(remaining),
                ))
            }
            Parsed::VersionNegotiation {
                dcid,
                scid,
                versions,
            } => {
                let packet_len = bytes.len();
                let (packet, remaining) = bytes.split_at_mut(packet_len);
                Ok((
                    Packet::VersionNegotiation(VersionNegotiation {
                        dcid,
                        scid,
                        versions,
                        packet,
                    }),
                    DecoderBufferMut::new(remaining),
                ))
            }
        }
    }

    /// The Destination Connection ID, used by the dispatch layer to route
    /// the packet before any crypto runs
    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        match self {
            Packet::Protected(packet) => packet.destination_connection_id(),
            Packet::Retry(packet) => &packet.packet[packet.dcid.clone()],
            Packet::VersionNegotiation(packet) => &packet.packet[packet.dcid.clone()],
        }
    }
}

fn parse_header(bytes: &[u8], local_dcid_len: usize) -> Result<Parsed, DecoderError> {
    let buffer = DecoderBuffer::new(bytes);
    let (tag, _) = buffer.decode::<u8>()?;

    if tag & LONG_HEADER_FORM == 0 {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
        //# Packets containing a zero value for this bit are not valid packets
        //# in this version and MUST be discarded.
        quartz_codec::decoder_invariant!(tag & FIXED_BIT == FIXED_BIT, "fixed bit not set");

        let header_len = 1 + local_dcid_len;
        buffer.ensure_len(header_len)?;

        return Ok(Parsed::Protected(ParsedHeader {
            kind: PacketKind::OneRtt,
            version: 0,
            dcid: 1..header_len,
            scid: 0..0,
            token: 0..0,
            header_len,
            packet_len: bytes.len(),
        }));
    }

    let buffer = buffer.skip(1)?;
    let (version, buffer) = buffer.decode::<u32>()?;

    let dcid_start = 1 + 4 + 1;
    let (dcid_len, buffer) = buffer.decode::<u8>()?;
    quartz_codec::decoder_invariant!(
        dcid_len as usize <= DESTINATION_CONNECTION_ID_MAX_LEN,
        "destination connection id too long"
    );
    let buffer = buffer.skip(dcid_len as usize)?;
    let dcid = dcid_start..dcid_start + dcid_len as usize;

    let scid_start = dcid.end + 1;
    let (scid_len, buffer) = buffer.decode::<u8>()?;
    quartz_codec::decoder_invariant!(
        scid_len as usize <= DESTINATION_CONNECTION_ID_MAX_LEN,
        "source connection id too long"
    );
    let buffer = buffer.skip(scid_len as usize)?;
    let scid = scid_start..scid_start + scid_len as usize;

    if version == version::VERSION_NEGOTIATION {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
        //# The Version Negotiation packet does not include the Packet Number
        //# and Length fields present in other packets that use the long
        //# header form.
        quartz_codec::decoder_invariant!(
            buffer.len() % 4 == 0 && !buffer.is_empty(),
            "malformed version negotiation packet"
        );
        let versions_start = scid.end;
        return Ok(Parsed::VersionNegotiation {
            dcid,
            scid,
            versions: versions_start..bytes.len(),
        });
    }

    quartz_codec::decoder_invariant!(tag & FIXED_BIT == FIXED_BIT, "fixed bit not set");

    let kind = match (tag >> 4) & 0b11 {
        0b00 => PacketKind::Initial,
        0b01 => PacketKind::ZeroRtt,
        0b10 => PacketKind::Handshake,
        _ => {
            //= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
            //# A Retry Integrity Tag spans the final 16 bytes of the packet.
            let token_start = scid.end;
            quartz_codec::decoder_invariant!(buffer.len() >= 16, "retry packet too short");
            let token = token_start..bytes.len() - 16;
            return Ok(Parsed::Retry {
                version,
                dcid,
                scid,
                token,
            });
        }
    };

    let (token, buffer) = if matches!(kind, PacketKind::Initial) {
        let (token_len, buffer) = buffer.decode::<VarInt>()?;
        let token_len =
            usize::try_from(token_len).map_err(|_| DecoderError::LengthCapacityExceeded)?;
        let token_start = bytes.len() - buffer.len();
        let buffer = buffer.skip(token_len)?;
        (token_start..token_start + token_len, buffer)
    } else {
        (0..0, buffer)
    };

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
    //# Length:  The length of the remainder of the packet (that is, the
    //#    Packet Number and Payload fields) in bytes, encoded as a
    //#    variable-length integer (Section 16).
    let (length, buffer) = buffer.decode::<VarInt>()?;
    let length = usize::try_from(length).map_err(|_| DecoderError::LengthCapacityExceeded)?;
    buffer.ensure_len(length)?;

    let header_len = bytes.len() - buffer.len();

    Ok(Parsed::Protected(ParsedHeader {
        kind,
        version,
        dcid,
        scid,
        token,
        header_len,
        packet_len: header_len + length,
    }))
}

impl<'a> ProtectedPacket<'a> {
    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.kind.space()
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.dcid.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.packet[self.scid.clone()]
    }

    #[inline]
    pub fn token(&self) -> &[u8] {
        &self.packet[self.token.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Removes header protection and recovers the full packet number.
    ///
    /// `largest_pn` is the largest packet number received so far in this
    /// packet's space.
    pub fn unprotect<H: HeaderKey>(
        self,
        header_key: &H,
        largest_pn: Option<PacketNumber>,
    ) -> Result<EncryptedPacket<'a>, packet_protection::Error> {
        let space = self.space();

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
        //# in sampling packet ciphertext for header protection, the Packet
        //# Number field is assumed to be 4 bytes long
        let sample_start = self.header_len + 4;
        let sample_len = header_key.opening_sample_len();
        let sample = self
            .packet
            .get(sample_start..sample_start + sample_len)
            .ok_or(packet_protection::Error::DECRYPT_ERROR)?;

        let mask = header_key.opening_header_protection_mask(sample);

        let truncated =
            crypto::remove_header_protection(space, mask, self.packet, self.header_len)
                .map_err(|_| packet_protection::Error::DECRYPT_ERROR)?;

        let packet_number = match largest_pn {
            Some(largest_pn) => truncated.expand(largest_pn),
            None => truncated.expand_from_zero(),
        };

        let key_phase = if matches!(self.kind, PacketKind::OneRtt) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
            //# An endpoint MUST treat receipt of a packet that has a non-zero
            //# value for these bits, after removing both packet and header
            //# protection, as a connection error of type PROTOCOL_VIOLATION.
            if self.packet[0] & 0b1_1000 != 0 {
                return Err(packet_protection::Error::new("reserved bits set"));
            }
            KeyPhase::from_tag(self.packet[0])
        } else {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
            //# An endpoint MUST treat receipt of a packet that has a non-zero
            //# value for these bits after removing both packet and header
            //# protection as a connection error of type PROTOCOL_VIOLATION.
            if self.packet[0] & 0b1100 != 0 {
                return Err(packet_protection::Error::new("reserved bits set"));
            }
            KeyPhase::Zero
        };

        Ok(EncryptedPacket {
            kind: self.kind,
            version: self.version,
            dcid: self.dcid,
            scid: self.scid,
            token: self.token,
            header_len: self.header_len,
            packet_number,
            packet_number_len: truncated.len(),
            key_phase,
            packet: self.packet,
        })
    }
}

impl<'a> EncryptedPacket<'a> {
    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    #[inline]
    pub fn packet_number(&self) -> PacketNumber {
        self.packet_number
    }

    #[inline]
    pub fn key_phase(&self) -> KeyPhase {
        self.key_phase
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.dcid.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.packet[self.scid.clone()]
    }

    /// AEAD-opens the payload in place
    pub fn decrypt<K: Key>(self, key: &K) -> Result<CleartextPacket<'a>, packet_protection::Error> {
        let tag_len = key.tag_len();
        let packet_number = self.packet_number.as_u64();
        self.decrypt_with(tag_len, |pn, header, payload| {
            debug_assert_eq!(pn, packet_number);
            key.decrypt(pn, header, payload)
        })
    }

    /// AEAD-opens the payload through a caller-supplied function.
    ///
    /// Lets the 1-RTT key set pick the key generation by phase while
    /// this type keeps the header/payload bookkeeping.
    pub fn decrypt_with<F>(
        self,
        tag_len: usize,
        decrypt: F,
    ) -> Result<CleartextPacket<'a>, packet_protection::Error>
    where
        F: FnOnce(u64, &[u8], &mut [u8]) -> Result<(), packet_protection::Error>,
    {
        let payload_start = self.header_len + self.packet_number_len.bytesize();
        let (header, payload) = self.packet.split_at_mut(payload_start);

        decrypt(self.packet_number.as_u64(), header, payload)?;

        let plaintext_len = payload
            .len()
            .checked_sub(tag_len)
            .ok_or(packet_protection::Error::DECRYPT_ERROR)?;

        Ok(CleartextPacket {
            kind: self.kind,
            version: self.version,
            dcid: self.dcid,
            scid: self.scid,
            token: self.token,
            packet_number: self.packet_number,
            key_phase: self.key_phase,
            payload: payload_start..payload_start + plaintext_len,
            packet: self.packet,
        })
    }
}

impl<'a> CleartextPacket<'a> {
    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn packet_number(&self) -> PacketNumber {
        self.packet_number
    }

    #[inline]
    pub fn key_phase(&self) -> KeyPhase {
        self.key_phase
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.dcid.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.packet[self.scid.clone()]
    }

    #[inline]
    pub fn token(&self) -> &[u8] {
        &self.packet[self.token.clone()]
    }

    /// The decrypted frame bytes
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.packet[self.payload.clone()]
    }
}

impl<'a> Retry<'a> {
    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.packet[self.scid.clone()]
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.dcid.clone()]
    }

    #[inline]
    pub fn retry_token(&self) -> &[u8] {
        &self.packet[self.token.clone()]
    }

    #[inline]
    pub fn integrity_tag(&self) -> &[u8] {
        &self.packet[self.packet.len() - 16..]
    }
}

impl<'a> VersionNegotiation<'a> {
    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.packet[self.dcid.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.packet[self.scid.clone()]
    }

    /// The versions the peer supports
    pub fn supported_versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.packet[self.versions.clone()]
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

#[cfg(test)]
mod tests;
