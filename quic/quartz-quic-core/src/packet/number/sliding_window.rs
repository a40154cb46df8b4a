// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::packet::number::PacketNumber;

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# A receiver MUST discard a newly unprotected packet unless it is
//# certain that it has not processed another packet with the same packet
//# number from the same packet number space.

/// Tracks recently received packet numbers in a fixed 128-packet window
/// so duplicates can be rejected without unbounded state.
///
/// Packets older than the window are reported as `TooOld`; the ACK range
/// set is the authority for those.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlidingWindow {
    /// The largest packet number observed
    right_edge: Option<u64>,

    /// Bit i set means `right_edge - i` was received
    window: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlidingWindowError {
    Duplicate,
    TooOld,
}

const WINDOW_BITS: u64 = 128;

impl SlidingWindow {
    /// Records the packet number, reporting duplicates
    #[inline]
    pub fn insert(&mut self, packet_number: PacketNumber) -> Result<(), SlidingWindowError> {
        let value = packet_number.as_u64();

        let right_edge = match self.right_edge {
            None => {
                self.right_edge = Some(value);
                self.window = 1;
                return Ok(());
            }
            Some(right_edge) => right_edge,
        };

        if value > right_edge {
            let shift = value - right_edge;
            if shift >= WINDOW_BITS {
                self.window = 0;
            } else {
                self.window <<= shift;
            }
            self.window |= 1;
            self.right_edge = Some(value);
            return Ok(());
        }

        let delta = right_edge - value;
        if delta >= WINDOW_BITS {
            return Err(SlidingWindowError::TooOld);
        }

        let bit = 1u128 << delta;
        if self.window & bit != 0 {
            return Err(SlidingWindowError::Duplicate);
        }

        self.window |= bit;
        Ok(())
    }

    /// Checks the packet number without recording it
    #[inline]
    pub fn check(&self, packet_number: PacketNumber) -> Result<(), SlidingWindowError> {
        let value = packet_number.as_u64();
        let right_edge = match self.right_edge {
            None => return Ok(()),
            Some(right_edge) => right_edge,
        };

        if value > right_edge {
            return Ok(());
        }

        let delta = right_edge - value;
        if delta >= WINDOW_BITS {
            return Err(SlidingWindowError::TooOld);
        }

        if self.window & (1u128 << delta) != 0 {
            return Err(SlidingWindowError::Duplicate);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{packet::number::PacketNumberSpace, varint::VarInt};

    fn pn(value: u64) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::new(value).unwrap())
    }

    #[test]
    fn detects_duplicates() {
        let mut window = SlidingWindow::default();
        assert_eq!(window.insert(pn(5)), Ok(()));
        assert_eq!(window.insert(pn(5)), Err(SlidingWindowError::Duplicate));
        assert_eq!(window.insert(pn(3)), Ok(()));
        assert_eq!(window.insert(pn(3)), Err(SlidingWindowError::Duplicate));
        assert_eq!(window.insert(pn(6)), Ok(()));
        assert_eq!(window.insert(pn(5)), Err(SlidingWindowError::Duplicate));
    }

    #[test]
    fn reports_too_old() {
        let mut window = SlidingWindow::default();
        assert_eq!(window.insert(pn(1000)), Ok(()));
        assert_eq!(window.insert(pn(1000 - 127)), Ok(()));
        assert_eq!(window.insert(pn(1000 - 128)), Err(SlidingWindowError::TooOld));
    }

    #[test]
    fn large_jump_clears_window() {
        let mut window = SlidingWindow::default();
        assert_eq!(window.insert(pn(1)), Ok(()));
        assert_eq!(window.insert(pn(1000)), Ok(()));
        assert_eq!(window.insert(pn(1)), Err(SlidingWindowError::TooOld));
        assert_eq!(window.insert(pn(999)), Ok(()));
    }

    #[test]
    fn check_does_not_mutate() {
        let mut window = SlidingWindow::default();
        window.insert(pn(10)).unwrap();
        assert_eq!(window.check(pn(9)), Ok(()));
        assert_eq!(window.check(pn(9)), Ok(()));
        assert_eq!(window.check(pn(10)), Err(SlidingWindowError::Duplicate));
    }
}
