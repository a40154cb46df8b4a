// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ordered reassembly of a byte stream from out-of-order chunks.
//!
//! Used by CRYPTO streams and by every receive stream. Overlapping
//! chunks are tolerated only when the overlapping bytes are identical;
//! a sender changing data it already sent is a protocol violation.

use bytes::Bytes;
use quartz_quic_core::transport;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Assembler {
    /// Pending chunks, keyed by start offset, non-overlapping
    chunks: BTreeMap<u64, Bytes>,
    /// Everything below this offset was handed to the reader
    read_offset: u64,
}

impl Assembler {
    #[inline]
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// The highest offset for which data has been buffered or read
    pub fn highest_offset(&self) -> u64 {
        self.chunks
            .iter()
            .next_back()
            .map(|(offset, chunk)| offset + chunk.len() as u64)
            .unwrap_or(self.read_offset)
    }

    /// The number of buffered, not-yet-readable-or-read bytes
    pub fn buffered_len(&self) -> usize {
        self.chunks.values().map(|chunk| chunk.len()).sum()
    }

    /// Returns true if a contiguous prefix is ready for the reader
    pub fn is_readable(&self) -> bool {
        self.chunks
            .keys()
            .next()
            .map_or(false, |&offset| offset == self.read_offset)
    }

    /// Inserts a chunk received at `offset`
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<(), transport::Error> {
        if data.is_empty() {
            return Ok(());
        }

        let mut offset = offset;
        let mut data = data;

        // drop the portion that was already read; it cannot be verified
        // against anything we retained
        if offset < self.read_offset {
            let skip = (self.read_offset - offset).min(data.len() as u64) as usize;
            data = &data[skip..];
            offset = self.read_offset;
            if data.is_empty() {
                return Ok(());
            }
        }

        // trim against the chunk preceding us
        if let Some((&prev_offset, prev)) = self.chunks.range(..=offset).next_back() {
            let prev_end = prev_offset + prev.len() as u64;
            if prev_end > offset {
                let overlap = (prev_end - offset).min(data.len() as u64) as usize;
                let retained = &prev[(offset - prev_offset) as usize..][..overlap];

                //= https://www.rfc-editor.org/rfc/rfc9000#section-2.2
                //# If one endpoint receives different data at the same offset
                //# within a stream, it MAY treat that as a connection error of
                //# type PROTOCOL_VIOLATION.
                if retained != &data[..overlap] {
                    return Err(transport::Error::PROTOCOL_VIOLATION
                        .with_reason("stream data changed between transmissions"));
                }

                data = &data[overlap..];
                offset = prev_end;
                if data.is_empty() {
                    return Ok(());
                }
            }
        }

        // trim against any chunks we cover or partially cover
        while let Some((&next_offset, next)) = self.chunks.range(offset..).next() {
            let end = offset + data.len() as u64;
            if next_offset >= end {
                break;
            }

            let overlap_start = (next_offset - offset) as usize;
            let overlap = (end - next_offset).min(next.len() as u64) as usize;
            if &next[..overlap] != &data[overlap_start..overlap_start + overlap] {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("stream data changed between transmissions"));
            }

            if overlap == next.len() {
                // fully covered; replace it with our larger chunk
                self.chunks.remove(&next_offset);
            } else {
                // keep our prefix, the existing chunk covers the rest
                data = &data[..overlap_start];
                break;
            }
        }

        if !data.is_empty() {
            self.chunks.insert(offset, Bytes::copy_from_slice(data));
        }

        Ok(())
    }

    /// Pops the next contiguous chunk, up to `max_len` bytes
    pub fn pop(&mut self, max_len: usize) -> Option<Bytes> {
        let (&offset, chunk) = self.chunks.iter().next()?;
        if offset != self.read_offset {
            return None;
        }

        let chunk = if chunk.len() > max_len {
            if max_len == 0 {
                return None;
            }
            let mut chunk = self.chunks.remove(&offset)?;
            let rest = chunk.split_off(max_len);
            self.chunks.insert(offset + max_len as u64, rest);
            chunk
        } else {
            self.chunks.remove(&offset)?
        };

        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// Copies readable bytes into `buf`, returning the count
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            match self.pop(buf.len() - copied) {
                Some(chunk) => {
                    buf[copied..copied + chunk.len()].copy_from_slice(&chunk);
                    copied += chunk.len();
                }
                None => break,
            }
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut assembler = Assembler::default();
        assembler.insert(0, b"hello ").unwrap();
        assembler.insert(6, b"world").unwrap();

        let mut buf = [0u8; 16];
        let n = assembler.read(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn out_of_order_delivery() {
        let mut assembler = Assembler::default();
        assembler.insert(6, b"world").unwrap();
        assert!(!assembler.is_readable());

        assembler.insert(0, b"hello ").unwrap();
        assert!(assembler.is_readable());

        let mut buf = [0u8; 16];
        let n = assembler.read(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn identical_overlap_is_merged() {
        let mut assembler = Assembler::default();
        assembler.insert(0, b"abcdef").unwrap();
        assembler.insert(3, b"defghi").unwrap();
        assembler.insert(0, b"abc").unwrap();

        let mut buf = [0u8; 16];
        let n = assembler.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdefghi");
    }

    #[test]
    fn conflicting_overlap_is_rejected() {
        let mut assembler = Assembler::default();
        assembler.insert(0, b"abcdef").unwrap();
        assert!(assembler.insert(3, b"XYZ").is_err());

        let mut assembler = Assembler::default();
        assembler.insert(4, b"efgh").unwrap();
        assert!(assembler.insert(0, b"abcdEFGH").is_err());
    }

    #[test]
    fn data_below_read_offset_is_ignored() {
        let mut assembler = Assembler::default();
        assembler.insert(0, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(assembler.read(&mut buf), 4);

        // a retransmission of consumed data, possibly extended
        assembler.insert(0, b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(assembler.read(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn interleaved_random_order_reassembles() {
        let source: Vec<u8> = (0u16..500).map(|value| value as u8).collect();
        // deliver in shuffled, overlapping windows
        let mut assembler = Assembler::default();
        let mut offsets: Vec<usize> = (0..50).map(|i| i * 10).collect();
        // deterministic shuffle
        for i in (1..offsets.len()).rev() {
            offsets.swap(i, (i * 7 + 3) % (i + 1));
        }
        for offset in offsets {
            let end = (offset + 15).min(source.len());
            assembler.insert(offset as u64, &source[offset..end]).unwrap();
        }

        let mut out = vec![0u8; source.len()];
        assert_eq!(assembler.read(&mut out), source.len());
        assert_eq!(out, source);
    }
}
