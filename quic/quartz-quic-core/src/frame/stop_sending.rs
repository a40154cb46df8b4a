// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.5
//# An endpoint uses a STOP_SENDING frame (type=0x05) to communicate that
//# incoming data is being discarded on receipt per application request.

macro_rules! stop_sending_tag {
    () => {
        0x05u8
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StopSending {
    /// The stream being ignored
    pub stream_id: VarInt,

    /// The application-level reason the sender is being asked to stop
    pub application_error_code: VarInt,
}

impl StopSending {
    pub const fn tag(&self) -> u8 {
        stop_sending_tag!()
    }
}

simple_frame_codec!(
    StopSending {
        stream_id,
        application_error_code
    },
    stop_sending_tag!()
);
