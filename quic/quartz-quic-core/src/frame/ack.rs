// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ack::AckRanges,
    inet::EcnCounts,
    interval_set::Interval,
    varint::VarInt,
};
use quartz_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.  The ACK frame contains one
//# or more ACK Ranges.  ACK Ranges identify acknowledged packets.  If
//# the frame type is 0x03, ACK frames also contain the cumulative count
//# of QUIC packets with associated ECN marks received on the connection
//# up until this point.

macro_rules! ack_tag {
    () => {
        0x02u8..=0x03u8
    };
}

const ACK_TAG: u8 = 0x02;
const ACK_ECN_TAG: u8 = 0x03;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//#   [ECN Counts (..)],
//# }

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// The ACK Delay field, in raw (unscaled) wire units
    pub ack_delay: VarInt,

    /// The acknowledged packet numbers
    pub ranges: AckRanges,

    /// ECN counts, present when the tag is 0x03
    pub ecn_counts: Option<EcnCounts>,
}

impl Ack {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.ecn_counts.is_some() {
            ACK_ECN_TAG
        } else {
            ACK_TAG
        }
    }

    /// The largest packet number acknowledged by the frame
    #[inline]
    pub fn largest_acknowledged(&self) -> VarInt {
        VarInt::new(self.ranges.largest().unwrap_or(0)).unwrap_or(VarInt::MAX)
    }
}

quartz_codec::decoder_parameterized_value!(
    impl<'a> Ack {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (largest_acknowledged, buffer) = buffer.decode::<VarInt>()?;
            let (ack_delay, buffer) = buffer.decode::<VarInt>()?;
            let (range_count, buffer) = buffer.decode::<VarInt>()?;
            let (first_ack_range, buffer) = buffer.decode::<VarInt>()?;

            quartz_codec::decoder_invariant!(
                first_ack_range <= largest_acknowledged,
                "first ack range exceeds largest acknowledged"
            );

            // hold every range the peer encoded; pruning to our own limit
            // happens at the processing layer
            let range_count_usize = usize::try_from(*range_count)
                .map_err(|_| quartz_codec::DecoderError::LengthCapacityExceeded)?;
            let mut ranges = AckRanges::new(range_count_usize.saturating_add(1));

            let mut smallest = *largest_acknowledged - *first_ack_range;
            ranges.insert(Interval::new(smallest, *largest_acknowledged));

            let mut buffer = buffer;
            for _ in 0..range_count_usize {
                let (gap, rest) = buffer.decode::<VarInt>()?;
                let (ack_range, rest) = rest.decode::<VarInt>()?;
                buffer = rest;

                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
                //# If any computed packet number is negative, an endpoint MUST generate
                //# a connection error of type FRAME_ENCODING_ERROR.
                let largest = smallest
                    .checked_sub(*gap)
                    .and_then(|v| v.checked_sub(2))
                    .ok_or(quartz_codec::DecoderError::InvariantViolation(
                        "negative packet number in ack range",
                    ))?;
                smallest = largest.checked_sub(*ack_range).ok_or(
                    quartz_codec::DecoderError::InvariantViolation(
                        "negative packet number in ack range",
                    ),
                )?;

                ranges.insert(Interval::new(smallest, largest));
            }

            let (ecn_counts, buffer) = if tag == ACK_ECN_TAG {
                let (ect_0_count, rest) = buffer.decode()?;
                let (ect_1_count, rest) = rest.decode()?;
                let (ce_count, rest) = rest.decode()?;
                (
                    Some(EcnCounts {
                        ect_0_count,
                        ect_1_count,
                        ce_count,
                    }),
                    rest,
                )
            } else {
                (None, buffer)
            };

            let frame = Ack {
                ack_delay,
                ranges,
                ecn_counts,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for Ack {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        debug_assert!(!self.ranges.is_empty(), "ack frame must cover a packet");

        buffer.encode(&self.tag());

        let mut descending = self.ranges.iter_descending();

        let first = match descending.next() {
            Some(first) => first,
            None => return,
        };

        buffer.encode(&unchecked_varint(first.end));
        buffer.encode(&self.ack_delay);
        buffer.encode(&unchecked_varint(self.ranges.interval_len() as u64 - 1));
        buffer.encode(&unchecked_varint(first.end - first.start));

        let mut previous_smallest = first.start;
        for range in descending {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
            //# Gap:  A variable-length integer indicating the number of contiguous
            //#    unacknowledged packets preceding the packet number one lower than
            //#    the smallest in the preceding ACK Range.
            let gap = previous_smallest - range.end - 2;
            buffer.encode(&unchecked_varint(gap));
            buffer.encode(&unchecked_varint(range.end - range.start));
            previous_smallest = range.start;
        }

        if let Some(ecn_counts) = &self.ecn_counts {
            buffer.encode(&ecn_counts.ect_0_count);
            buffer.encode(&ecn_counts.ect_1_count);
            buffer.encode(&ecn_counts.ce_count);
        }
    }
}

// ack range arithmetic stays within the varint range by construction
#[inline]
fn unchecked_varint(value: u64) -> VarInt {
    VarInt::new(value).expect("value exceeds varint range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_codec::{DecoderBuffer, EncoderBuffer};

    fn round_trip(frame: &Ack) -> Ack {
        let mut storage = [0u8; 512];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut storage);
            encoder.encode(frame);
            encoder.len()
        };

        let buffer = DecoderBuffer::new(&storage[..len]);
        let (decoded, buffer) = crate::frame::Frame::decode(buffer).unwrap();
        assert!(buffer.is_empty());

        match decoded {
            crate::frame::Frame::Ack(ack) => ack,
            other => panic!("decoded unexpected frame {other:?}"),
        }
    }

    fn ranges(intervals: &[(u64, u64)]) -> AckRanges {
        let mut ranges = AckRanges::new(intervals.len().max(1));
        for &(start, end) in intervals {
            ranges.insert(Interval::new(start, end));
        }
        ranges
    }

    #[test]
    fn single_range_round_trip() {
        let frame = Ack {
            ack_delay: VarInt::from_u8(20),
            ranges: ranges(&[(3, 7)]),
            ecn_counts: None,
        };
        assert_eq!(round_trip(&frame), frame);
        assert_eq!(frame.largest_acknowledged(), VarInt::from(7u32));
    }

    #[test]
    fn multi_range_round_trip() {
        let frame = Ack {
            ack_delay: VarInt::from_u8(0),
            ranges: ranges(&[(0, 0), (2, 4), (10, 20), (25, 25)]),
            ecn_counts: None,
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn ecn_round_trip() {
        let frame = Ack {
            ack_delay: VarInt::from_u8(5),
            ranges: ranges(&[(1, 2)]),
            ecn_counts: Some(EcnCounts {
                ect_0_count: VarInt::from_u8(4),
                ect_1_count: VarInt::ZERO,
                ce_count: VarInt::from_u8(1),
            }),
        };
        let decoded = round_trip(&frame);
        assert_eq!(decoded, frame);
        assert_eq!(decoded.tag(), 0x03);
    }

    #[test]
    fn negative_packet_number_is_rejected() {
        // largest=2, delay=0, range_count=1, first_range=2, gap=10, len=0
        let bytes = [0x02u8, 2, 0, 1, 2, 10, 0];
        let buffer = DecoderBuffer::new(&bytes);
        assert!(crate::frame::Frame::decode(buffer).is_err());
    }
}
