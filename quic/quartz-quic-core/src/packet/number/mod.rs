// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet numbers, their spaces, and their truncated wire encoding

use crate::varint::VarInt;
use quartz_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

mod sliding_window;
pub use sliding_window::{SlidingWindow, SlidingWindowError};

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# Packet numbers are divided into three spaces in QUIC:
//#
//# Initial space:  All Initial packets (Section 17.2.2) are in this
//#    space.
//#
//# Handshake space:  All Handshake packets (Section 17.2.4) are in this
//#    space.
//#
//# Application data space:  All 0-RTT (Section 17.2.3) and 1-RTT
//#    (Section 17.3) packets are in this space.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::ApplicationData];

    #[inline]
    pub fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake)
    }

    #[inline]
    pub fn is_application_data(self) -> bool {
        matches!(self, Self::ApplicationData)
    }

    #[inline]
    pub fn new_packet_number(self, value: VarInt) -> PacketNumber {
        PacketNumber { space: self, value }
    }

    /// Reads the packet number length out of an unprotected packet tag
    #[inline]
    pub fn new_packet_number_len(self, tag: u8) -> PacketNumberLen {
        PacketNumberLen::from_tag(tag)
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# The packet number is an integer in the range 0 to 2^62-1.  This
//# number is used in determining the cryptographic nonce for packet
//# protection.  Each endpoint maintains a separate packet number for
//# sending and receiving.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber {
    space: PacketNumberSpace,
    value: VarInt,
}

impl PacketNumber {
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.value.as_u64()
    }

    #[inline]
    pub fn as_varint(self) -> VarInt {
        self.value
    }

    /// The next packet number in the space, if representable
    #[inline]
    pub fn next(self) -> Option<Self> {
        Some(Self {
            space: self.space,
            value: self.value.checked_add(VarInt::from_u8(1))?,
        })
    }

    #[inline]
    pub fn checked_distance(self, rhs: Self) -> Option<u64> {
        debug_assert_eq!(self.space, rhs.space);
        self.as_u64().checked_sub(rhs.as_u64())
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
    //# the sender MUST use a packet number size able to represent more than
    //# twice as large a range as the difference between the largest
    //# acknowledged packet and the packet number being sent.
    #[inline]
    pub fn truncate(self, largest_acknowledged: Self) -> Option<TruncatedPacketNumber> {
        debug_assert_eq!(self.space, largest_acknowledged.space);

        let range = self
            .as_u64()
            .checked_sub(largest_acknowledged.as_u64())?
            .checked_mul(2)?;
        let len = PacketNumberLen::for_range(range)?;

        Some(TruncatedPacketNumber {
            space: self.space,
            value: (self.as_u64() & len.mask()) as u32,
            len,
        })
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
//# When present in long or short packet headers, they are encoded in 1
//# to 4 bytes.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketNumberLen {
    Len1,
    Len2,
    Len3,
    Len4,
}

/// The packet number length occupies the two least significant bits of
/// the packet tag
pub(crate) const PACKET_NUMBER_LEN_MASK: u8 = 0b11;

impl PacketNumberLen {
    #[inline]
    pub fn from_tag(tag: u8) -> Self {
        match tag & PACKET_NUMBER_LEN_MASK {
            0b00 => Self::Len1,
            0b01 => Self::Len2,
            0b10 => Self::Len3,
            _ => Self::Len4,
        }
    }

    /// Smallest length able to represent `range` values
    #[inline]
    pub fn for_range(range: u64) -> Option<Self> {
        match range {
            r if r <= 0xff => Some(Self::Len1),
            r if r <= 0xffff => Some(Self::Len2),
            r if r <= 0xff_ffff => Some(Self::Len3),
            r if r <= 0xffff_ffff => Some(Self::Len4),
            _ => None,
        }
    }

    #[inline]
    pub fn bytesize(self) -> usize {
        match self {
            Self::Len1 => 1,
            Self::Len2 => 2,
            Self::Len3 => 3,
            Self::Len4 => 4,
        }
    }

    #[inline]
    pub fn bitsize(self) -> usize {
        self.bytesize() * 8
    }

    #[inline]
    pub fn mask(self) -> u64 {
        (1u64 << self.bitsize()) - 1
    }

    /// The tag bits announcing this length
    #[inline]
    pub fn into_tag_bits(self) -> u8 {
        (self.bytesize() - 1) as u8
    }

    /// Decodes a truncated packet number of this length
    #[inline]
    pub fn decode_truncated_packet_number<'a>(
        self,
        buffer: DecoderBuffer<'a>,
        space: PacketNumberSpace,
    ) -> DecoderBufferResult<'a, TruncatedPacketNumber> {
        let (bytes, buffer) = buffer.decode_slice(self.bytesize())?;
        let bytes = bytes.into_less_safe_slice();

        let mut value = 0u32;
        for byte in bytes {
            value = (value << 8) | *byte as u32;
        }

        Ok((
            TruncatedPacketNumber {
                space,
                value,
                len: self,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPacketNumber {
    space: PacketNumberSpace,
    value: u32,
    len: PacketNumberLen,
}

impl TruncatedPacketNumber {
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn len(self) -> PacketNumberLen {
        self.len
    }

    #[inline]
    pub fn bytesize(self) -> usize {
        self.len.bytesize()
    }

    #[inline]
    pub fn bitsize(self) -> usize {
        self.len.bitsize()
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.value as u64
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# DecodePacketNumber(largest_pn, truncated_pn, pn_nbits):
    //#    expected_pn  = largest_pn + 1
    //#    pn_win       = 1 << pn_nbits
    //#    pn_hwin      = pn_win / 2
    //#    pn_mask      = pn_win - 1
    //#    candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //#    if candidate_pn <= expected_pn - pn_hwin and
    //#       candidate_pn < (1 << 62) - pn_win:
    //#       candidate_pn += pn_win
    //#    else if candidate_pn > expected_pn + pn_hwin and
    //#            candidate_pn >= pn_win:
    //#       candidate_pn -= pn_win
    //#    return candidate_pn
    #[inline]
    pub fn expand(self, largest_pn: PacketNumber) -> PacketNumber {
        debug_assert_eq!(self.space, largest_pn.space());

        let expected_pn = largest_pn.as_u64() + 1;
        let pn_win = 1u64 << self.bitsize();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let mut candidate_pn = (expected_pn & !pn_mask) | self.as_u64();

        if expected_pn.checked_sub(pn_hwin).map_or(false, |edge| candidate_pn <= edge)
            && candidate_pn < (1u64 << 62) - pn_win
        {
            candidate_pn += pn_win;
        } else if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
            candidate_pn -= pn_win;
        }

        self.space
            .new_packet_number(VarInt::new(candidate_pn).unwrap_or(VarInt::MAX))
    }

    /// Expands a packet number when nothing has been received in the
    /// space yet
    #[inline]
    pub fn expand_from_zero(self) -> PacketNumber {
        self.space.new_packet_number(
            VarInt::new(self.as_u64()).expect("truncated packet numbers fit in a varint"),
        )
    }
}

impl EncoderValue for TruncatedPacketNumber {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let bytesize = self.bytesize();
        encoder.write_sized(bytesize, |bytes| {
            let mut value = self.value;
            for byte in bytes.iter_mut().rev() {
                *byte = (value & 0xff) as u8;
                value >>= 8;
            }
        });
    }
}
