// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The sending half of a stream: an ordered buffer of unacknowledged
//! data plus the ranges that still need a (re)transmission.

use bytes::Bytes;
use quartz_quic_core::{
    interval_set::{Interval, IntervalSet},
    stream::{SendState, StreamId},
    varint::VarInt,
};
use std::collections::VecDeque;

/// A range handed to the packet builder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendSlice {
    pub offset: u64,
    pub len: u64,
    pub fin: bool,
}

#[derive(Debug)]
pub struct SendStream {
    id: StreamId,
    state: SendState,

    /// Bytes from `storage_base` up to `write_offset`, oldest first
    storage: VecDeque<Bytes>,
    storage_base: u64,
    write_offset: u64,

    /// Offsets needing (re)transmission
    pending: IntervalSet,
    acked: IntervalSet,

    /// The peer's MAX_STREAM_DATA
    max_stream_data: u64,
    blocked_pending: Option<u64>,
    blocked_sent_at: Option<u64>,

    fin_offset: Option<u64>,
    fin_pending: bool,
    fin_acked: bool,

    reset: Option<(VarInt, u64)>,
    reset_pending: bool,
    reset_acked: bool,
}

impl SendStream {
    pub fn new(id: StreamId, max_stream_data: u64) -> Self {
        Self {
            id,
            state: SendState::default(),
            storage: VecDeque::new(),
            storage_base: 0,
            write_offset: 0,
            pending: IntervalSet::new(),
            acked: IntervalSet::new(),
            max_stream_data,
            blocked_pending: None,
            blocked_sent_at: None,
            fin_offset: None,
            fin_pending: false,
            fin_acked: false,
            reset: None,
            reset_pending: false,
            reset_acked: false,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> SendState {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Stream-level credit remaining
    #[inline]
    pub fn available_credit(&self) -> u64 {
        self.max_stream_data.saturating_sub(self.write_offset)
    }

    /// Appends application data, limited by stream and connection
    /// credit. Returns the number of bytes accepted.
    pub fn send(&mut self, data: &[u8], connection_credit: u64) -> usize {
        if !self.state.can_send() || self.fin_offset.is_some() {
            return 0;
        }

        let budget = self
            .available_credit()
            .min(connection_credit)
            .min(data.len() as u64) as usize;

        if budget == 0 {
            if self.available_credit() == 0 {
                self.queue_blocked();
            }
            return 0;
        }

        let start = self.write_offset;
        self.storage.push_back(Bytes::copy_from_slice(&data[..budget]));
        self.write_offset += budget as u64;
        self.pending
            .insert(Interval::new(start, self.write_offset - 1));
        self.state.on_send_data();

        budget
    }

    /// Marks the end of the stream
    pub fn finish(&mut self) {
        if self.fin_offset.is_none() && self.state.can_send() {
            self.fin_offset = Some(self.write_offset);
            self.fin_pending = true;
        }
    }

    /// Abruptly terminates the sending side
    pub fn reset(&mut self, error_code: VarInt) {
        if self.reset.is_some() || self.state.is_terminal() {
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.4
        //# Final Size:  A variable-length integer indicating the final size
        //#    of the stream by the RESET_STREAM sender, in units of bytes
        self.reset = Some((error_code, self.write_offset));
        self.reset_pending = true;
        self.state.on_send_reset();

        // nothing else needs retransmission any more
        self.pending.clear();
        self.fin_pending = false;
        self.storage.clear();
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-3.5
    //# A sender that receives a STOP_SENDING frame MUST send a
    //# RESET_STREAM frame if the stream is in the "Ready" or "Send"
    //# state.
    pub fn on_stop_sending(&mut self, error_code: VarInt) {
        self.reset(error_code);
    }

    pub fn on_max_stream_data(&mut self, maximum: VarInt) {
        if maximum.as_u64() > self.max_stream_data {
            self.max_stream_data = maximum.as_u64();
            self.blocked_pending = None;
        }
    }

    fn queue_blocked(&mut self) {
        if self.blocked_sent_at != Some(self.max_stream_data) {
            self.blocked_pending = Some(self.max_stream_data);
        }
    }

    /// Takes a queued STREAM_DATA_BLOCKED limit, dropping stale ones
    pub fn take_blocked(&mut self) -> Option<VarInt> {
        let limit = self.blocked_pending.take()?;
        if limit != self.max_stream_data {
            return None;
        }
        self.blocked_sent_at = Some(limit);
        VarInt::new(limit).ok()
    }

    /// Takes a queued RESET_STREAM frame
    pub fn take_reset(&mut self) -> Option<(VarInt, u64)> {
        if !self.reset_pending {
            return None;
        }
        self.reset_pending = false;
        self.reset
    }

    pub fn has_pending_data(&self) -> bool {
        if self.reset.is_some() {
            return self.reset_pending;
        }
        !self.pending.is_empty() || self.fin_pending
    }

    /// Picks the next range to transmit, up to `max_len` bytes.
    ///
    /// The range leaves the pending set; the recovery manifest brings it
    /// back on loss.
    pub fn pop_transmission(&mut self, max_len: usize) -> Option<SendSlice> {
        if self.reset.is_some() {
            return None;
        }

        let next_range = self.pending.iter().next();
        if let Some(range) = next_range {
            if max_len == 0 {
                return None;
            }
            let len = range.len().min(max_len as u64);
            let taken = Interval::new(range.start, range.start + len - 1);
            self.pending.remove(taken);

            let fin = self.fin_offset == Some(taken.end + 1) && self.pending.is_empty();
            if fin {
                self.fin_pending = false;
                self.state.on_send_fin();
            }

            return Some(SendSlice {
                offset: taken.start,
                len,
                fin,
            });
        }

        if self.fin_pending {
            self.fin_pending = false;
            self.state.on_send_fin();
            return Some(SendSlice {
                offset: self.fin_offset.expect("fin_pending requires an offset"),
                len: 0,
                fin: true,
            });
        }

        None
    }

    /// Copies the bytes of a transmission range into `out`
    pub fn copy_range(&self, offset: u64, len: u64, out: &mut Vec<u8>) {
        debug_assert!(offset >= self.storage_base);

        let mut remaining = len as usize;
        let mut skip = (offset - self.storage_base) as usize;

        for chunk in &self.storage {
            if remaining == 0 {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }

            let take = (chunk.len() - skip).min(remaining);
            out.extend_from_slice(&chunk[skip..skip + take]);
            skip = 0;
            remaining -= take;
        }

        debug_assert_eq!(remaining, 0, "range not backed by storage");
    }

    /// Processes an acknowledgment for a previously sent range
    pub fn on_range_acked(&mut self, offset: u64, len: u64, fin: bool) {
        if len > 0 {
            self.acked.insert(Interval::new(offset, offset + len - 1));
            self.release_acked_prefix();
        }
        if fin {
            self.fin_acked = true;
        }

        if self.reset.is_none() && self.all_data_acked() {
            self.state.on_all_data_acked();
        }
    }

    /// Re-queues a lost range unless it was acknowledged elsewhere
    pub fn on_range_lost(&mut self, offset: u64, len: u64, fin: bool) {
        if self.reset.is_some() {
            return;
        }

        if len > 0 {
            self.pending.insert(Interval::new(offset, offset + len - 1));
            for acked in self.acked.iter() {
                self.pending.remove(acked);
            }
        }

        if fin && !self.fin_acked {
            self.fin_pending = true;
        }
    }

    pub fn on_reset_acked(&mut self) {
        if self.reset.is_some() {
            self.reset_acked = true;
            self.state.on_reset_acked();
        }
    }

    pub fn on_reset_lost(&mut self) {
        if self.reset.is_some() && !self.reset_acked {
            self.reset_pending = true;
        }
    }

    fn all_data_acked(&self) -> bool {
        match self.fin_offset {
            Some(0) => self.fin_acked,
            Some(final_size) => {
                self.fin_acked
                    && self
                        .acked
                        .contains_interval(Interval::new(0, final_size - 1))
            }
            None => false,
        }
    }

    fn release_acked_prefix(&mut self) {
        // drop storage covered by the contiguous acked prefix
        let prefix_end = match self.acked.iter().next() {
            Some(interval) if interval.start == 0 => interval.end + 1,
            _ => return,
        };

        while let Some(front) = self.storage.front() {
            let front_end = self.storage_base + front.len() as u64;
            if front_end <= prefix_end {
                self.storage_base = front_end;
                self.storage.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_quic_core::{endpoint, stream::StreamType};

    fn stream(credit: u64) -> SendStream {
        SendStream::new(
            StreamId::initial(endpoint::Type::Client, StreamType::Bidirectional),
            credit,
        )
    }

    #[test]
    fn send_respects_stream_and_connection_credit() {
        let mut stream = stream(10);
        assert_eq!(stream.send(b"hello world!", u64::MAX), 10);
        assert_eq!(stream.send(b"more", u64::MAX), 0);
        assert_eq!(stream.take_blocked(), Some(VarInt::from_u8(10)));

        stream.on_max_stream_data(VarInt::from_u8(20));
        assert_eq!(stream.send(b"abcdef", 3), 3);
    }

    #[test]
    fn transmission_round_trip() {
        let mut stream = stream(1000);
        stream.send(b"hello world", u64::MAX);
        stream.finish();

        let slice = stream.pop_transmission(5).unwrap();
        assert_eq!(slice, SendSlice { offset: 0, len: 5, fin: false });

        let mut out = Vec::new();
        stream.copy_range(slice.offset, slice.len, &mut out);
        assert_eq!(out, b"hello");

        let slice = stream.pop_transmission(1000).unwrap();
        assert_eq!(slice, SendSlice { offset: 5, len: 6, fin: true });
        assert!(!stream.has_pending_data());

        stream.on_range_acked(0, 5, false);
        assert!(!stream.is_terminal());
        stream.on_range_acked(5, 6, true);
        assert_eq!(stream.state(), SendState::DataRecvd);
    }

    #[test]
    fn lost_ranges_are_retransmitted() {
        let mut stream = stream(1000);
        stream.send(b"0123456789", u64::MAX);

        let first = stream.pop_transmission(4).unwrap();
        let second = stream.pop_transmission(100).unwrap();
        assert!(!stream.has_pending_data());

        // the second frame is acked, the first is lost
        stream.on_range_acked(second.offset, second.len, false);
        stream.on_range_lost(first.offset, first.len, false);

        let retransmit = stream.pop_transmission(100).unwrap();
        assert_eq!(retransmit.offset, 0);
        assert_eq!(retransmit.len, 4);

        let mut out = Vec::new();
        stream.copy_range(retransmit.offset, retransmit.len, &mut out);
        assert_eq!(out, b"0123");
    }

    #[test]
    fn acked_prefix_releases_storage() {
        let mut stream = stream(1000);
        stream.send(b"aaaa", u64::MAX);
        stream.send(b"bbbb", u64::MAX);

        stream.pop_transmission(100).unwrap();
        stream.on_range_acked(0, 4, false);
        assert_eq!(stream.storage_base, 4);

        // out-of-order ack keeps later storage until the gap closes
        let mut stream = stream_pair();
        stream.on_range_acked(4, 4, false);
        assert_eq!(stream.storage_base, 0);
        stream.on_range_acked(0, 4, false);
        assert_eq!(stream.storage_base, 8);
    }

    fn stream_pair() -> SendStream {
        let mut stream = stream(1000);
        stream.send(b"aaaa", u64::MAX);
        stream.send(b"bbbb", u64::MAX);
        stream.pop_transmission(100).unwrap();
        stream.pop_transmission(100).unwrap();
        stream
    }

    #[test]
    fn stop_sending_turns_into_reset() {
        let mut stream = stream(1000);
        stream.send(b"data", u64::MAX);

        stream.on_stop_sending(VarInt::from_u8(42));
        assert_eq!(stream.take_reset(), Some((VarInt::from_u8(42), 4)));
        assert!(stream.pop_transmission(100).is_none());

        stream.on_reset_acked();
        assert_eq!(stream.state(), SendState::ResetRecvd);
        assert!(stream.is_terminal());
    }

    #[test]
    fn empty_stream_fin() {
        let mut stream = stream(1000);
        stream.finish();

        let slice = stream.pop_transmission(100).unwrap();
        assert_eq!(slice, SendSlice { offset: 0, len: 0, fin: true });

        stream.on_range_acked(0, 0, true);
        assert_eq!(stream.state(), SendState::DataRecvd);
    }
}
