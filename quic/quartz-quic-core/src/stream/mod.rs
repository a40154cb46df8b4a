// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint, varint::VarInt};

pub mod state;

pub use state::{ReceiveState, SendState};

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# Streams can be unidirectional or bidirectional.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Bidirectional,
    Unidirectional,
}

impl StreamType {
    #[inline]
    pub fn is_bidirectional(self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The least significant bit (0x01) of the stream ID identifies the
//# initiator of the stream.  Client-initiated streams have even-numbered
//# stream IDs (with the bit set to 0), and server-initiated streams have
//# odd-numbered stream IDs (with the bit set to 1).

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The second least significant bit (0x02) of the stream ID
//# distinguishes between bidirectional streams (with the bit set to 0)
//# and unidirectional streams (with the bit set to 1).

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(VarInt);

impl core::fmt::Debug for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("StreamId")
            .field("id", &self.0.as_u64())
            .field("initiator", &self.initiator())
            .field("stream_type", &self.stream_type())
            .finish()
    }
}

impl StreamId {
    #[inline]
    pub const fn from_varint(value: VarInt) -> Self {
        Self(value)
    }

    /// The first stream id for the given initiator and type
    #[inline]
    pub fn initial(initiator: endpoint::Type, stream_type: StreamType) -> Self {
        let mut bits = 0;
        if initiator.is_server() {
            bits |= 0b01;
        }
        if !stream_type.is_bidirectional() {
            bits |= 0b10;
        }
        Self(VarInt::from_u8(bits))
    }

    /// The `nth` stream id (zero-based) for the given initiator and type
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<Self> {
        let base = Self::initial(initiator, stream_type);
        let value = VarInt::new(n.checked_mul(4)?).ok()?;
        Some(Self(base.0.checked_add(value)?))
    }

    /// The next stream id of the same initiator and type
    #[inline]
    pub fn next_of_type(self) -> Option<Self> {
        Some(Self(self.0.checked_add(VarInt::from_u8(4))?))
    }

    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        if self.0.as_u64() & 0b01 == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0.as_u64() & 0b10 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    /// Zero-based index of the stream within its initiator/type sequence
    #[inline]
    pub fn ordinal(self) -> u64 {
        self.0.as_u64() >> 2
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    /// Whether this endpoint may receive STREAM data on the stream
    #[inline]
    pub fn is_receivable_by(self, local: endpoint::Type) -> bool {
        self.stream_type().is_bidirectional() || self.initiator() != local
    }

    /// Whether this endpoint may send STREAM data on the stream
    #[inline]
    pub fn is_sendable_by(self, local: endpoint::Type) -> bool {
        self.stream_type().is_bidirectional() || self.initiator() == local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint::Type::{Client, Server};

    #[test]
    fn low_bits_encode_initiator_and_type() {
        for (initiator, stream_type, expected) in [
            (Client, StreamType::Bidirectional, 0u64),
            (Server, StreamType::Bidirectional, 1),
            (Client, StreamType::Unidirectional, 2),
            (Server, StreamType::Unidirectional, 3),
        ] {
            let id = StreamId::initial(initiator, stream_type);
            assert_eq!(id.as_varint().as_u64(), expected);
            assert_eq!(id.initiator(), initiator);
            assert_eq!(id.stream_type(), stream_type);
        }
    }

    #[test]
    fn nth_and_ordinal_are_inverse() {
        for n in [0u64, 1, 2, 100, 10_000] {
            let id = StreamId::nth(Server, StreamType::Unidirectional, n).unwrap();
            assert_eq!(id.ordinal(), n);
            assert_eq!(id.initiator(), Server);
            assert_eq!(id.stream_type(), StreamType::Unidirectional);
        }
    }

    #[test]
    fn directionality() {
        let uni = StreamId::initial(Client, StreamType::Unidirectional);
        assert!(uni.is_sendable_by(Client));
        assert!(!uni.is_sendable_by(Server));
        assert!(uni.is_receivable_by(Server));
        assert!(!uni.is_receivable_by(Client));

        let bidi = StreamId::initial(Client, StreamType::Bidirectional);
        assert!(bidi.is_sendable_by(Client));
        assert!(bidi.is_sendable_by(Server));
    }
}
