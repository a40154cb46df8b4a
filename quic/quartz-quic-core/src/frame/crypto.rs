// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::{convert::TryFrom, mem::size_of};
use quartz_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# A CRYPTO frame (type=0x06) is used to transmit cryptographic
//# handshake messages.

macro_rules! crypto_tag {
    () => {
        0x06u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Crypto<'a> {
    /// The byte offset in the handshake byte stream
    pub offset: VarInt,

    /// The cryptographic message data
    pub data: &'a [u8],
}

impl<'a> Crypto<'a> {
    pub const fn tag(&self) -> u8 {
        crypto_tag!()
    }

    /// Tries to fit the frame into `capacity` bytes.
    ///
    /// On success, returns the number of data bytes that fit.
    #[inline]
    pub fn try_fit(&self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = 0;
        fixed_len += size_of::<Tag>();
        fixed_len += self.offset.encoding_size();

        let remaining_capacity = capacity.checked_sub(fixed_len).ok_or(FitError)?;

        let data_len = self.data.len().min(remaining_capacity);
        let len_prefix_size = VarInt::try_from(data_len)
            .map_err(|_| FitError)?
            .encoding_size();

        let data_len = remaining_capacity
            .checked_sub(len_prefix_size)
            .ok_or(FitError)?
            .min(self.data.len());

        Ok(data_len)
    }
}

quartz_codec::decoder_parameterized_value!(
    impl<'a> Crypto<'a> {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (offset, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
            //# The largest offset delivered on a stream -- the sum of the offset and
            //# data length -- cannot exceed 2^62-1
            let (data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            quartz_codec::decoder_invariant!(
                offset
                    .checked_add_usize(data.len())
                    .is_some(),
                "crypto data exceeds maximum offset"
            );

            let data = data.into_less_safe_slice();

            let frame = Crypto {
                offset,
                data: &*data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<'a> EncoderValue for Crypto<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.offset);
        buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}
