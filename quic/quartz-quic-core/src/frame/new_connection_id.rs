// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quartz_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

macro_rules! new_connection_id_tag {
    () => {
        0x18u8
    };
}

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# NEW_CONNECTION_ID Frame {
//#   Type (i) = 0x18,
//#   Sequence Number (i),
//#   Retire Prior To (i),
//#   Length (8),
//#   Connection ID (8..160),
//#   Stateless Reset Token (128),
//# }

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NewConnectionId<'a> {
    /// The sequence number assigned to the connection ID by the sender
    pub sequence_number: VarInt,

    /// Connection IDs with sequence numbers below this value are
    /// implicitly retired
    pub retire_prior_to: VarInt,

    /// The new connection ID, 1 to 20 bytes
    pub connection_id: &'a [u8],

    /// A token to use in a stateless reset for this connection ID
    pub stateless_reset_token: &'a [u8; STATELESS_RESET_TOKEN_LEN],
}

impl<'a> NewConnectionId<'a> {
    pub const fn tag(&self) -> u8 {
        new_connection_id_tag!()
    }
}

quartz_codec::decoder_parameterized_value!(
    impl<'a> NewConnectionId<'a> {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
            let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Receiving a value in the Retire Prior To field that is greater than
            //# that in the Sequence Number field MUST be treated as a connection
            //# error of type FRAME_ENCODING_ERROR.
            quartz_codec::decoder_invariant!(
                retire_prior_to <= sequence_number,
                "retire_prior_to exceeds sequence_number"
            );

            let (connection_id, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Values less than 1 and greater than 20 are invalid and MUST be
            //# treated as a connection error of type FRAME_ENCODING_ERROR.
            quartz_codec::decoder_invariant!(
                (1..=20).contains(&connection_id.len()),
                "invalid connection id length"
            );
            let connection_id = connection_id.into_less_safe_slice();

            let (token, buffer) = buffer.decode_slice(STATELESS_RESET_TOKEN_LEN)?;
            let token = token.into_less_safe_slice();
            let stateless_reset_token = (&*token)
                .try_into()
                .map_err(|_| quartz_codec::DecoderError::InvariantViolation("invalid token"))?;

            let frame = NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id: &*connection_id,
                stateless_reset_token,
            };

            Ok((frame, buffer))
        }
    }
);

impl<'a> EncoderValue for NewConnectionId<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.sequence_number);
        buffer.encode(&self.retire_prior_to);
        buffer.encode_with_len_prefix::<u8, _>(&self.connection_id);
        buffer.write_slice(self.stateless_reset_token);
    }
}
