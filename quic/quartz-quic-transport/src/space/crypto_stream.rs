// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The handshake byte stream at one encryption level.
//!
//! Outgoing bytes from the TLS engine accumulate here until they are
//! packed into CRYPTO frames; incoming CRYPTO frames reassemble into
//! the byte stream the engine consumes.

use crate::buffer::Assembler;
use bytes::Bytes;
use quartz_quic_core::{
    interval_set::{Interval, IntervalSet},
    transport,
    varint::VarInt,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
//# Implementations MUST support buffering at least 4096 bytes of data
//# received in out-of-order CRYPTO frames.

const RX_BUFFER_LIMIT: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct CryptoStream {
    rx: Assembler,

    /// Every handshake byte queued at this level, by stream offset
    tx_buffer: Vec<u8>,
    /// Offsets that need (re)transmission
    tx_pending: IntervalSet,
}

impl CryptoStream {
    /// Queues outgoing handshake bytes from the TLS engine
    pub fn push_tx(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let start = self.tx_buffer.len() as u64;
        self.tx_buffer.extend_from_slice(&data);
        self.tx_pending
            .insert(Interval::new(start, start + data.len() as u64 - 1));
    }

    #[inline]
    pub fn has_tx_pending(&self) -> bool {
        !self.tx_pending.is_empty()
    }

    /// Takes the next range to transmit, up to `max_len` bytes.
    ///
    /// The range leaves the pending set; loss notifications put it back.
    pub fn pop_tx(&mut self, max_len: usize) -> Option<(VarInt, &[u8])> {
        if max_len == 0 {
            return None;
        }

        let range = self.tx_pending.iter().next()?;
        let len = range.len().min(max_len as u64);
        let taken = Interval::new(range.start, range.start + len - 1);
        self.tx_pending.remove(taken);

        let offset = VarInt::new(range.start).ok()?;
        let data = &self.tx_buffer[range.start as usize..(range.start + len) as usize];
        Some((offset, data))
    }

    /// Returns a lost range to the pending set
    pub fn on_frame_lost(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.tx_pending.insert(Interval::new(offset, offset + len - 1));
    }

    /// Buffers an incoming CRYPTO frame
    pub fn on_rx_frame(&mut self, offset: VarInt, data: &[u8]) -> Result<(), transport::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
        //# If an endpoint does not expand its buffer, it MUST close the
        //# connection with a CRYPTO_BUFFER_EXCEEDED error code.
        if self.rx.buffered_len() + data.len() > RX_BUFFER_LIMIT {
            return Err(transport::Error::CRYPTO_BUFFER_EXCEEDED);
        }

        self.rx.insert(offset.as_u64(), data)
    }

    /// Pops contiguous handshake bytes for the TLS engine
    pub fn pop_rx(&mut self, max_len: Option<usize>) -> Option<Bytes> {
        self.rx.pop(max_len.unwrap_or(usize::MAX))
    }

    #[inline]
    pub fn has_rx_ready(&self) -> bool {
        self.rx.is_readable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_ranges_round_trip_through_loss() {
        let mut stream = CryptoStream::default();
        stream.push_tx(Bytes::from_static(b"client hello bytes"));
        assert!(stream.has_tx_pending());

        let (offset, data) = stream.pop_tx(6).unwrap();
        assert_eq!(offset, VarInt::ZERO);
        assert_eq!(data, b"client");
        assert!(stream.has_tx_pending());

        let (offset, data) = stream.pop_tx(1000).unwrap();
        assert_eq!(offset.as_u64(), 6);
        assert_eq!(data, b" hello bytes");
        assert!(!stream.has_tx_pending());

        // the first frame is lost and gets retransmitted
        stream.on_frame_lost(0, 6);
        let (offset, data) = stream.pop_tx(1000).unwrap();
        assert_eq!(offset, VarInt::ZERO);
        assert_eq!(data, b"client");
    }

    #[test]
    fn rx_reassembles_out_of_order() {
        let mut stream = CryptoStream::default();
        stream
            .on_rx_frame(VarInt::from_u8(5), b" world")
            .unwrap();
        assert!(!stream.has_rx_ready());

        stream.on_rx_frame(VarInt::ZERO, b"hello").unwrap();
        assert!(stream.has_rx_ready());

        assert_eq!(stream.pop_rx(None).unwrap().as_ref(), b"hello");
        assert_eq!(stream.pop_rx(None).unwrap().as_ref(), b" world");
    }

    #[test]
    fn rx_buffer_limit_is_enforced() {
        let mut stream = CryptoStream::default();
        let chunk = vec![0u8; 32 * 1024];
        // out-of-order chunks accumulate
        stream.on_rx_frame(VarInt::from_u32(100_000), &chunk).unwrap();
        stream.on_rx_frame(VarInt::from_u32(200_000), &chunk).unwrap();
        let error = stream
            .on_rx_frame(VarInt::from_u32(300_000), &chunk)
            .unwrap_err();
        assert_eq!(
            error.code,
            quartz_quic_core::transport::Error::CRYPTO_BUFFER_EXCEEDED.code
        );
    }
}
