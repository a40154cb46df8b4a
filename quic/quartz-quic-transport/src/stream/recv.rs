// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receiving half of a stream: interval reassembly, final-size
//! accounting and the stream-level receive window.

use crate::buffer::Assembler;
use quartz_quic_core::{
    frame,
    stream::{ReceiveState, StreamId},
    transport,
    varint::VarInt,
};

/// The result of reading from the stream
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were copied into the buffer
    Data(usize),

    /// The stream finished cleanly and every byte was read
    Finished,

    /// The peer reset the stream
    Reset(VarInt),

    /// Nothing to read right now
    Blocked,
}

#[derive(Debug)]
pub struct ReceiveStream {
    id: StreamId,
    state: ReceiveState,
    assembler: Assembler,

    /// Highest offset seen, for connection flow-control accounting
    highest_received: u64,
    final_size: Option<u64>,

    /// The stream-level limit we advertised
    advertised: u64,
    window: u64,
    update_pending: bool,

    /// A STOP_SENDING frame queued for transmission
    stop_sending: Option<VarInt>,
    stop_sending_pending: bool,

    reset_error: Option<VarInt>,
}

impl ReceiveStream {
    pub fn new(id: StreamId, window: u64) -> Self {
        Self {
            id,
            state: ReceiveState::default(),
            assembler: Assembler::default(),
            highest_received: 0,
            final_size: None,
            advertised: window,
            window,
            update_pending: false,
            stop_sending: None,
            stop_sending_pending: false,
            reset_error: None,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ReceiveState {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.assembler.is_readable()
            || self.state.is_reset()
            || matches!(self.state, ReceiveState::DataRecvd)
    }

    /// Processes a STREAM frame.
    ///
    /// Returns the number of bytes beyond the previous highest offset,
    /// which the caller charges against connection flow control.
    pub fn on_data(&mut self, frame: &frame::Stream) -> Result<u64, transport::Error> {
        let offset = frame.offset.as_u64();
        let end = offset
            .checked_add(frame.data.len() as u64)
            .ok_or(transport::Error::FLOW_CONTROL_ERROR)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
        //# Once a final size for a stream is known, it cannot change.  If a
        //# RESET_STREAM or STREAM frame is received indicating a change in the
        //# final size for the stream, an endpoint SHOULD respond with an error
        //# of type FINAL_SIZE_ERROR
        if let Some(final_size) = self.final_size {
            if end > final_size || (frame.is_fin && end != final_size) {
                return Err(transport::Error::FINAL_SIZE_ERROR);
            }
        }

        if frame.is_fin {
            if end < self.highest_received {
                return Err(transport::Error::FINAL_SIZE_ERROR);
            }
            self.final_size = Some(end);
            self.state.on_fin_received();
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised connection
        //# or stream data limits
        if end > self.advertised {
            return Err(transport::Error::FLOW_CONTROL_ERROR
                .with_reason("peer exceeded stream flow control"));
        }

        let newly_received = end.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(end);

        if self.state.accepts_data() {
            self.assembler.insert(offset, frame.data)?;
        }

        self.check_fully_received();
        Ok(newly_received)
    }

    /// Processes a RESET_STREAM frame; returns the flow-control delta
    pub fn on_reset(&mut self, frame: &frame::ResetStream) -> Result<u64, transport::Error> {
        let final_size = frame.final_size.as_u64();

        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(transport::Error::FINAL_SIZE_ERROR);
            }
        }
        if final_size < self.highest_received {
            return Err(transport::Error::FINAL_SIZE_ERROR);
        }
        if final_size > self.advertised {
            return Err(transport::Error::FLOW_CONTROL_ERROR);
        }

        let newly_received = final_size.saturating_sub(self.highest_received);
        self.highest_received = final_size;
        self.final_size = Some(final_size);

        self.state.on_reset_received()?;
        if self.state.is_reset() {
            self.reset_error = Some(frame.application_error_code);
        }

        Ok(newly_received)
    }

    /// Asks the peer to stop sending
    pub fn stop_sending(&mut self, error_code: VarInt) {
        if self.state.accepts_data() && self.stop_sending.is_none() {
            self.stop_sending = Some(error_code);
            self.stop_sending_pending = true;
        }
    }

    pub fn take_stop_sending(&mut self) -> Option<VarInt> {
        if !self.stop_sending_pending {
            return None;
        }
        self.stop_sending_pending = false;
        self.stop_sending
    }

    pub fn on_stop_sending_lost(&mut self) {
        if self.stop_sending.is_some() && self.state.accepts_data() {
            self.stop_sending_pending = true;
        }
    }

    /// Reads into `buf`. The returned byte count feeds both the stream
    /// and connection windows via [`Self::take_max_stream_data`]
    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if let Some(error_code) = self.reset_error {
            self.state.on_reset_read();
            return ReadOutcome::Reset(error_code);
        }

        let n = self.assembler.read(buf);
        if n > 0 {
            self.on_consumed(n as u64);
            return ReadOutcome::Data(n);
        }

        if matches!(self.state, ReceiveState::DataRecvd) {
            self.state.on_all_data_read();
            return ReadOutcome::Finished;
        }

        ReadOutcome::Blocked
    }

    fn on_consumed(&mut self, bytes: u64) {
        // no window movement once the final size is known
        if self.final_size.is_some() {
            self.check_fully_received();
            let _ = bytes;
            return;
        }

        let target = self.assembler.read_offset() + self.window;
        if target.saturating_sub(self.advertised) >= self.window / 2 {
            self.update_pending = true;
        }
    }

    /// Takes a MAX_STREAM_DATA update, if one is due
    pub fn take_max_stream_data(&mut self) -> Option<VarInt> {
        if !self.update_pending || self.final_size.is_some() {
            self.update_pending = false;
            return None;
        }
        self.update_pending = false;
        self.advertised = self.assembler.read_offset() + self.window;
        VarInt::new(self.advertised).ok()
    }

    pub fn on_max_stream_data_lost(&mut self) {
        if self.final_size.is_none() {
            self.update_pending = true;
        }
    }

    fn check_fully_received(&mut self) {
        if let Some(final_size) = self.final_size {
            let complete = self.assembler.read_offset() + self.assembler.buffered_len() as u64
                == final_size;
            if complete {
                self.state.on_all_data_received();
            }
        }
    }
}
