// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::{convert::TryFrom, mem::size_of};
use quartz_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# STREAM frames implicitly create a stream and carry stream data.  The
//# Type field in the STREAM frame takes the form 0b00001XXX (or the set
//# of values from 0x08 to 0x0f).

macro_rules! stream_tag {
    () => {
        0x08u8..=0x0fu8
    };
}

const STREAM_TAG: u8 = 0x08;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The OFF bit (0x04) in the frame type is set to indicate that there
//#    is an Offset field present.

const OFF_BIT: u8 = 0x04;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The LEN bit (0x02) in the frame type is set to indicate that there
//#    is a Length field present.

const LEN_BIT: u8 = 0x02;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The FIN bit (0x01) indicates that the frame marks the end of the
//#    stream.

const FIN_BIT: u8 = 0x01;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    /// A variable-length integer indicating the stream ID of the stream
    pub stream_id: VarInt,

    /// The byte offset in the stream for the data in this frame
    pub offset: VarInt,

    /// If true, the frame extends to the end of the packet and omits its
    /// length field
    pub is_last_frame: bool,

    /// If true, the frame marks the end of the stream
    pub is_fin: bool,

    /// The bytes from the designated stream to be delivered
    pub data: &'a [u8],
}

impl<'a> Stream<'a> {
    #[inline]
    pub fn tag(&self) -> u8 {
        let mut tag: u8 = STREAM_TAG;

        if *self.offset != 0 {
            tag |= OFF_BIT;
        }

        if !self.is_last_frame {
            tag |= LEN_BIT;
        }

        if self.is_fin {
            tag |= FIN_BIT;
        }

        tag
    }

    /// Tries to fit the frame into `capacity` bytes, updating
    /// `is_last_frame`.
    ///
    /// On success, returns the number of data bytes that fit.
    #[inline]
    pub fn try_fit(&mut self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = 0;
        fixed_len += size_of::<Tag>();
        fixed_len += self.stream_id.encoding_size();

        if *self.offset != 0 {
            fixed_len += self.offset.encoding_size();
        }

        let remaining_capacity = capacity.checked_sub(fixed_len).ok_or(FitError)?;

        let data_len = self.data.len();
        let max_data_len = remaining_capacity.min(data_len);

        // data that fills the rest of the packet omits its length prefix
        if max_data_len == remaining_capacity {
            self.is_last_frame = true;
            return Ok(max_data_len);
        }

        self.is_last_frame = false;

        let len_prefix_size = VarInt::try_from(max_data_len)
            .map_err(|_| FitError)?
            .encoding_size();

        let prefixed_data_len = remaining_capacity
            .checked_sub(len_prefix_size)
            .ok_or(FitError)?;

        let data_len = prefixed_data_len.min(data_len);

        Ok(data_len)
    }
}

quartz_codec::decoder_parameterized_value!(
    impl<'a> Stream<'a> {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let has_offset = tag & 0x04 == 0x04;
            let is_last_frame = tag & 0x02 != 0x02;
            let is_fin = tag & 0x01 == 0x01;

            let (stream_id, buffer) = buffer.decode()?;

            let (offset, buffer) = if has_offset {
                buffer.decode::<VarInt>()?
            } else {
                (Default::default(), buffer)
            };

            let (data, buffer) = if !is_last_frame {
                buffer.decode_slice_with_len_prefix::<VarInt>()?
            } else {
                let len = buffer.len();
                buffer.decode_slice(len)?
            };

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
            //# The largest offset delivered on a stream -- the sum of the offset and
            //# data length -- cannot exceed 2^62-1, as it is not possible to provide
            //# flow control credit for that data.
            quartz_codec::decoder_invariant!(
                offset.checked_add_usize(data.len()).is_some(),
                "stream data exceeds maximum offset"
            );

            let data = data.into_less_safe_slice();

            let frame = Stream {
                stream_id,
                offset,
                is_last_frame,
                is_fin,
                data: &*data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<'a> EncoderValue for Stream<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.stream_id);

        if *self.offset != 0 {
            buffer.encode(&self.offset);
        }

        if self.is_last_frame {
            buffer.encode(&self.data);
        } else {
            buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_codec::EncoderLenEstimator;

    fn fit_case(data_len: usize, capacity: usize) {
        let data = vec![0u8; data_len];
        let mut frame = Stream {
            stream_id: VarInt::from_u8(3),
            offset: VarInt::from_u16(1000),
            is_last_frame: false,
            is_fin: false,
            data: &data,
        };

        if let Ok(fit_len) = frame.try_fit(capacity) {
            frame.data = &data[..fit_len];
            let mut estimator = EncoderLenEstimator::new(capacity);
            frame.encode(&mut estimator);
            assert!(
                estimator.len() <= capacity,
                "encoded {} into capacity {capacity}",
                estimator.len()
            );

            if frame.is_last_frame {
                assert_eq!(estimator.len(), capacity);
            }
        }
    }

    #[test]
    fn try_fit_never_exceeds_capacity() {
        for data_len in [0usize, 1, 10, 63, 64, 1000, 5000] {
            for capacity in 0..=70 {
                fit_case(data_len, capacity);
            }
        }
    }
}
