// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-level flow control.
//!
//! The send side tracks the cumulative stream offset placed on the wire
//! against the peer's MAX_DATA; the receive side advances its own
//! window in half-window steps as the application consumes data.

use quartz_quic_core::{transport, varint::VarInt};

/// Credit the peer granted us for sending
#[derive(Debug)]
pub struct TxController {
    /// Sum of bytes committed to STREAM frames across all streams
    total_sent: u64,
    /// The peer's cumulative MAX_DATA
    maximum_data: u64,
    /// A DATA_BLOCKED frame is queued
    blocked_pending: Option<u64>,
    /// The limit the last DATA_BLOCKED was sent for
    blocked_sent_at: Option<u64>,
}

impl TxController {
    pub fn new(initial_max_data: VarInt) -> Self {
        Self {
            total_sent: 0,
            maximum_data: initial_max_data.as_u64(),
            blocked_pending: None,
            blocked_sent_at: None,
        }
    }

    #[inline]
    pub fn available(&self) -> u64 {
        self.maximum_data - self.total_sent
    }

    #[inline]
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Commits `len` bytes of new stream data to the wire.
    ///
    /// Callers must stay within [`Self::available`].
    pub fn on_data_sent(&mut self, len: u64) {
        debug_assert!(len <= self.available());
        self.total_sent += len;
    }

    /// Notes that a sender wanted to send but had no connection credit
    pub fn on_blocked(&mut self) {
        if self.available() == 0 && self.blocked_sent_at != Some(self.maximum_data) {
            self.blocked_pending = Some(self.maximum_data);
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.9
    //# MAX_DATA frames carry only increases; out-of-order frames with a
    //# smaller limit are ignored
    pub fn on_max_data(&mut self, maximum_data: VarInt) {
        if maximum_data.as_u64() > self.maximum_data {
            self.maximum_data = maximum_data.as_u64();
            self.blocked_pending = None;
        }
    }

    /// Takes the DATA_BLOCKED frame to transmit, if one is due.
    ///
    /// Stale blocked signals are dropped rather than retransmitted.
    pub fn take_blocked(&mut self) -> Option<VarInt> {
        let limit = self.blocked_pending.take()?;
        if limit != self.maximum_data {
            return None;
        }
        self.blocked_sent_at = Some(limit);
        VarInt::new(limit).ok()
    }
}

/// Credit we grant the peer for receiving
#[derive(Debug)]
pub struct RxController {
    /// Highest received offset sum across all streams
    total_received: u64,
    /// Bytes the application has consumed
    total_consumed: u64,
    /// The cumulative limit we last advertised
    advertised: u64,
    /// The receive window size
    window: u64,
    /// A MAX_DATA update is queued
    update_pending: bool,
}

impl RxController {
    pub fn new(window: u64) -> Self {
        Self {
            total_received: 0,
            total_consumed: 0,
            advertised: window,
            window,
            update_pending: false,
        }
    }

    #[inline]
    pub fn advertised(&self) -> u64 {
        self.advertised
    }

    /// Accounts for newly received stream data.
    //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
    //# A receiver MUST close the connection with an error of type
    //# FLOW_CONTROL_ERROR if the sender violates the advertised connection
    //# or stream data limits
    pub fn on_data_received(&mut self, new_bytes: u64) -> Result<(), transport::Error> {
        let total = self
            .total_received
            .checked_add(new_bytes)
            .ok_or(transport::Error::FLOW_CONTROL_ERROR)?;

        if total > self.advertised {
            return Err(transport::Error::FLOW_CONTROL_ERROR
                .with_reason("peer exceeded connection flow control"));
        }

        self.total_received = total;
        Ok(())
    }

    /// Accounts for data handed to the application, opening the window
    /// once half of it is consumed
    pub fn on_data_consumed(&mut self, bytes: u64) {
        self.total_consumed += bytes;

        let target = self.total_consumed + self.window;
        if target.saturating_sub(self.advertised) >= self.window / 2 {
            self.update_pending = true;
        }
    }

    /// Takes the MAX_DATA value to transmit, if an update is due
    pub fn take_max_data(&mut self) -> Option<VarInt> {
        if !self.update_pending {
            return None;
        }
        self.update_pending = false;
        self.advertised = self.total_consumed + self.window;
        VarInt::new(self.advertised).ok()
    }

    /// Re-queues the update after the frame carrying it was lost
    pub fn on_frame_lost(&mut self) {
        self.update_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_enforces_peer_limit() {
        let mut tx = TxController::new(VarInt::from_u16(1000));
        assert_eq!(tx.available(), 1000);

        tx.on_data_sent(600);
        assert_eq!(tx.available(), 400);

        tx.on_max_data(VarInt::from_u16(2000));
        assert_eq!(tx.available(), 1400);

        // regressions are ignored
        tx.on_max_data(VarInt::from_u16(500));
        assert_eq!(tx.available(), 1400);
    }

    #[test]
    fn tx_blocked_signal_is_deduplicated() {
        let mut tx = TxController::new(VarInt::from_u16(100));
        tx.on_data_sent(100);

        tx.on_blocked();
        assert_eq!(tx.take_blocked(), Some(VarInt::from_u8(100)));
        // the same limit does not produce another frame
        tx.on_blocked();
        assert_eq!(tx.take_blocked(), None);

        // a raised limit re-arms the signal
        tx.on_max_data(VarInt::from_u16(200));
        tx.on_data_sent(100);
        tx.on_blocked();
        assert_eq!(tx.take_blocked(), Some(VarInt::from_u8(200)));
    }

    #[test]
    fn rx_rejects_excess_data() {
        let mut rx = RxController::new(1000);
        assert!(rx.on_data_received(1000).is_ok());
        assert!(rx.on_data_received(1).is_err());
    }

    #[test]
    fn rx_window_advances_at_half_consumption() {
        let mut rx = RxController::new(1000);
        rx.on_data_received(700).unwrap();

        rx.on_data_consumed(400);
        assert!(rx.take_max_data().is_none());

        rx.on_data_consumed(100);
        assert_eq!(rx.take_max_data(), Some(VarInt::from_u16(1500)));
        assert_eq!(rx.advertised(), 1500);
    }
}
