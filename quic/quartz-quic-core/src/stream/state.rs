// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream state machines, straight out of RFC 9000 section 3.

use crate::transport;

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.1
//#        o
//#        | Create Stream (Sending)
//#        | Peer Creates Bidirectional Stream
//#        v
//#    +-------+
//#    | Ready | Send RESET_STREAM
//#    |       |-----------------------.
//#    +-------+                       |
//#        |                           |
//#        | Send STREAM /             |
//#        |      STREAM_DATA_BLOCKED  |
//#        v                           |
//#    +-------+                       |
//#    | Send  | Send RESET_STREAM     |
//#    |       |---------------------->|
//#    +-------+                       |
//#        |                           |
//#        | Send STREAM + FIN         |
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  | Send RESET_STREAM | Reset |
//#    | Sent  |------------------>| Sent  |
//#    +-------+                   +-------+
//#        |                           |
//#        | Recv All ACKs             | Recv ACK
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Recvd |                   | Recvd |
//#    +-------+                   +-------+

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendState {
    #[default]
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl SendState {
    #[inline]
    pub fn on_send_data(&mut self) {
        if matches!(self, Self::Ready) {
            *self = Self::Send;
        }
    }

    #[inline]
    pub fn on_send_fin(&mut self) {
        if matches!(self, Self::Ready | Self::Send) {
            *self = Self::DataSent;
        }
    }

    #[inline]
    pub fn on_send_reset(&mut self) {
        if matches!(self, Self::Ready | Self::Send | Self::DataSent) {
            *self = Self::ResetSent;
        }
    }

    /// All data up to the final size was acknowledged
    #[inline]
    pub fn on_all_data_acked(&mut self) {
        if matches!(self, Self::DataSent) {
            *self = Self::DataRecvd;
        }
    }

    #[inline]
    pub fn on_reset_acked(&mut self) {
        if matches!(self, Self::ResetSent) {
            *self = Self::ResetRecvd;
        }
    }

    #[inline]
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::ResetSent | Self::ResetRecvd)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DataRecvd | Self::ResetRecvd)
    }

    /// Whether the application may still submit data
    #[inline]
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Ready | Self::Send)
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
//#        o
//#        | Recv STREAM / STREAM_DATA_BLOCKED / RESET_STREAM
//#        | Create Bidirectional Stream (Sending)
//#        | Recv MAX_STREAM_DATA / STOP_SENDING (Bidirectional)
//#        | Create Higher-Numbered Stream
//#        v
//#    +-------+
//#    | Recv  | Recv RESET_STREAM
//#    |       |-----------------------.
//#    +-------+                       |
//#        |                           |
//#        | Recv STREAM + FIN         |
//#        v                           |
//#    +-------+                       |
//#    | Size  | Recv RESET_STREAM     |
//#    | Known |---------------------->|
//#    +-------+                       |
//#        |                           |
//#        | Recv All Data             |
//#        v                           v
//#    +-------+ Recv RESET_STREAM +-------+
//#    | Data  |--- (optional) --->| Reset |
//#    | Recvd |  Recv All Data    | Recvd |
//#    +-------+<-- (optional) ----+-------+
//#        |                           |
//#        | App Read All Data         | App Read Reset
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Read  |                   | Read  |
//#    +-------+                   +-------+

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiveState {
    #[default]
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl ReceiveState {
    #[inline]
    pub fn on_fin_received(&mut self) {
        if matches!(self, Self::Recv) {
            *self = Self::SizeKnown;
        }
    }

    #[inline]
    pub fn on_all_data_received(&mut self) {
        if matches!(self, Self::SizeKnown) {
            *self = Self::DataRecvd;
        }
    }

    #[inline]
    pub fn on_all_data_read(&mut self) {
        if matches!(self, Self::DataRecvd) {
            *self = Self::DataRead;
        }
    }

    #[inline]
    pub fn on_reset_received(&mut self) -> Result<(), transport::Error> {
        match self {
            Self::Recv | Self::SizeKnown => {
                *self = Self::ResetRecvd;
                Ok(())
            }
            // data was already fully received; the reset is a no-op
            Self::DataRecvd | Self::DataRead => Ok(()),
            Self::ResetRecvd | Self::ResetRead => Ok(()),
        }
    }

    #[inline]
    pub fn on_reset_read(&mut self) {
        if matches!(self, Self::ResetRecvd) {
            *self = Self::ResetRead;
        }
    }

    #[inline]
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::ResetRecvd | Self::ResetRead)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DataRead | Self::ResetRead)
    }

    /// Whether new STREAM data may still arrive
    #[inline]
    pub fn accepts_data(&self) -> bool {
        matches!(self, Self::Recv | Self::SizeKnown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_side_happy_path() {
        let mut state = SendState::default();
        state.on_send_data();
        assert_eq!(state, SendState::Send);
        state.on_send_fin();
        assert_eq!(state, SendState::DataSent);
        state.on_all_data_acked();
        assert_eq!(state, SendState::DataRecvd);
        assert!(state.is_terminal());
    }

    #[test]
    fn send_side_reset_path() {
        let mut state = SendState::default();
        state.on_send_data();
        state.on_send_reset();
        assert_eq!(state, SendState::ResetSent);
        assert!(!state.can_send());

        // acking data after a reset does not resurrect the stream
        state.on_all_data_acked();
        assert_eq!(state, SendState::ResetSent);

        state.on_reset_acked();
        assert_eq!(state, SendState::ResetRecvd);
        assert!(state.is_terminal());
    }

    #[test]
    fn receive_side_happy_path() {
        let mut state = ReceiveState::default();
        state.on_fin_received();
        assert_eq!(state, ReceiveState::SizeKnown);
        state.on_all_data_received();
        assert_eq!(state, ReceiveState::DataRecvd);
        state.on_all_data_read();
        assert!(state.is_terminal());
    }

    #[test]
    fn receive_side_reset_after_data_recvd_is_noop() {
        let mut state = ReceiveState::default();
        state.on_fin_received();
        state.on_all_data_received();
        state.on_reset_received().unwrap();
        assert_eq!(state, ReceiveState::DataRecvd);
    }
}
