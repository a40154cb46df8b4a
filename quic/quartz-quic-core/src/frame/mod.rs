// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quartz_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

pub mod ack_elicitation;
pub use ack_elicitation::AckElicitation;

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
//# As described in Section 12.4, packets contain one or more frames.
//# This section describes the format and semantics of the core QUIC
//# frame types.

pub(crate) type Tag = u8;

/// Returned by `try_fit` when a frame cannot fit in the remaining
/// packet capacity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitError;

// This implements a codec for a frame that contains simple values that
// don't vary based on the tag
macro_rules! simple_frame_codec {
    ($name:ident {
        $(
            $field:ident
        ),*
    }, $tag:expr) => {
        quartz_codec::decoder_parameterized_value!(
            impl<'a> $name {
                fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
                    $(
                        let ($field, buffer) = buffer.decode()?;
                    )*

                    let frame = $name { $($field),* };

                    Ok((frame, buffer))
                }
            }
        );

        impl quartz_codec::EncoderValue for $name {
            fn encode<E: quartz_codec::Encoder>(&self, buffer: &mut E) {
                buffer.encode(&$tag);
                $(
                    buffer.encode(&self.$field);
                )*
            }
        }
    };
}

macro_rules! frames {
    ($($tag_macro:ident => $module:ident, $ty:ident $([$($generics:tt)+])?;)*) => {
        $(
            #[macro_use]
            pub mod $module;
            pub use $module::$ty;
        )*

        /// A tagged union over every frame this implementation understands
        #[derive(Debug, PartialEq, Eq)]
        pub enum Frame<'a> {
            $(
                $ty($module::$ty $(<$($generics)*>)?),
            )*
        }

        impl<'a> Frame<'a> {
            /// Returns the wire tag of the frame
            #[inline]
            pub fn tag(&self) -> Tag {
                match self {
                    $(
                        Frame::$ty(frame) => frame.tag(),
                    )*
                }
            }

            /// Decodes a single frame from the front of `buffer`
            pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Frame<'a>> {
                let tag = buffer.peek_byte(0)?;
                match tag {
                    // frame types above 0x3f would occupy multiple varint
                    // bytes; none are defined by RFC 9000
                    0b0100_0000..=0xff => {
                        Err(DecoderError::InvariantViolation("unknown frame type"))
                    }
                    $(
                        $tag_macro!() => {
                            let buffer = buffer.skip(core::mem::size_of::<Tag>())?;
                            let (frame, buffer) = buffer.decode_parameterized(tag)?;
                            Ok((Frame::$ty(frame), buffer))
                        },
                    )*
                    _ => Err(DecoderError::InvariantViolation("unknown frame type")),
                }
            }
        }

        $(
            impl<'a> From<$module::$ty $(<$($generics)*>)?> for Frame<'a> {
                #[inline]
                fn from(frame: $module::$ty $(<$($generics)*>)?) -> Self {
                    Frame::$ty(frame)
                }
            }
        )*

        impl<'a> EncoderValue for Frame<'a> {
            #[inline]
            fn encode<E: Encoder>(&self, buffer: &mut E) {
                match self {
                    $(
                        Frame::$ty(frame) => buffer.encode(frame),
                    )*
                }
            }
        }
    };
}

frames! {
    padding_tag => padding, Padding;
    ping_tag => ping, Ping;
    ack_tag => ack, Ack;
    reset_stream_tag => reset_stream, ResetStream;
    stop_sending_tag => stop_sending, StopSending;
    crypto_tag => crypto, Crypto['a];
    new_token_tag => new_token, NewToken['a];
    stream_tag => stream, Stream['a];
    max_data_tag => max_data, MaxData;
    max_stream_data_tag => max_stream_data, MaxStreamData;
    max_streams_tag => max_streams, MaxStreams;
    data_blocked_tag => data_blocked, DataBlocked;
    stream_data_blocked_tag => stream_data_blocked, StreamDataBlocked;
    streams_blocked_tag => streams_blocked, StreamsBlocked;
    new_connection_id_tag => new_connection_id, NewConnectionId['a];
    retire_connection_id_tag => retire_connection_id, RetireConnectionId;
    path_challenge_tag => path_challenge, PathChallenge;
    path_response_tag => path_response, PathResponse;
    connection_close_tag => connection_close, ConnectionClose['a];
    handshake_done_tag => handshake_done, HandshakeDone;
}

impl<'a> Frame<'a> {
    //= https://www.rfc-editor.org/rfc/rfc9002#section-2
    //# Packets that contain ack-eliciting frames elicit an ACK from the
    //# receiver within the maximum acknowledgment delay and are called
    //# ack-eliciting packets.
    #[inline]
    pub fn ack_elicitation(&self) -> AckElicitation {
        match self {
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_) => {
                AckElicitation::NonEliciting
            }
            _ => AckElicitation::Eliciting,
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.1
    //# PATH_CHALLENGE, PATH_RESPONSE, NEW_CONNECTION_ID, and PADDING frames
    //# are "probing frames", and all other frames are "non-probing frames".
    #[inline]
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Frame::Padding(_)
                | Frame::NewConnectionId(_)
                | Frame::PathChallenge(_)
                | Frame::PathResponse(_)
        )
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
    //# The "Pkts" column in Table 3 lists the types of packets that each
    //# frame type could appear in
    #[inline]
    pub fn is_allowed_in(&self, level: crate::crypto::Level) -> bool {
        use crate::crypto::Level::*;
        match self {
            Frame::Padding(_) | Frame::Ping(_) => true,
            Frame::Ack(_) | Frame::Crypto(_) => level != ZeroRtt,
            Frame::NewToken(_) | Frame::PathResponse(_) | Frame::HandshakeDone(_) => {
                level == OneRtt
            }
            Frame::ConnectionClose(close) => {
                if close.is_application_close() {
                    matches!(level, ZeroRtt | OneRtt)
                } else {
                    true
                }
            }
            _ => matches!(level, ZeroRtt | OneRtt),
        }
    }
}

#[cfg(test)]
mod tests;
