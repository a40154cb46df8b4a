// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quartz_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE frame with a type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

macro_rules! connection_close_tag {
    () => {
        0x1cu8..=0x1du8
    };
}

const TRANSPORT_TAG: u8 = 0x1c;
const APPLICATION_TAG: u8 = 0x1d;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    /// The error code, from the transport or application space depending
    /// on the frame type
    pub error_code: VarInt,

    /// The type of the frame that triggered the error.
    ///
    /// Present only for transport-level closes (type 0x1c).
    pub frame_type: Option<VarInt>,

    /// A human-readable explanation, not guaranteed to be UTF-8
    pub reason: Option<&'a [u8]>,
}

impl<'a> ConnectionClose<'a> {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.frame_type.is_some() {
            TRANSPORT_TAG
        } else {
            APPLICATION_TAG
        }
    }

    #[inline]
    pub fn is_application_close(&self) -> bool {
        self.frame_type.is_none()
    }
}

quartz_codec::decoder_parameterized_value!(
    impl<'a> ConnectionClose<'a> {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (error_code, buffer) = buffer.decode()?;

            let (frame_type, buffer) = if tag == TRANSPORT_TAG {
                let (frame_type, buffer) = buffer.decode::<VarInt>()?;
                (Some(frame_type), buffer)
            } else {
                (None, buffer)
            };

            let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            let reason = if reason.is_empty() {
                None
            } else {
                let reason = reason.into_less_safe_slice();
                Some(&*reason)
            };

            let frame = ConnectionClose {
                error_code,
                frame_type,
                reason,
            };

            Ok((frame, buffer))
        }
    }
);

impl<'a> EncoderValue for ConnectionClose<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.error_code);

        if let Some(frame_type) = self.frame_type {
            buffer.encode(&frame_type);
        }

        if let Some(reason) = self.reason {
            buffer.encode_with_len_prefix::<VarInt, _>(&reason);
        } else {
            buffer.encode(&VarInt::ZERO);
        }
    }
}
