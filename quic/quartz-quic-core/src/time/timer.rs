// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::Timestamp;

/// A cancellable single-shot timer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Timestamp>,
}

impl Timer {
    /// Arms the timer for `deadline`, replacing any previous deadline
    #[inline]
    pub fn set(&mut self, deadline: Timestamp) {
        self.deadline = Some(deadline);
    }

    /// Cancels the timer
    #[inline]
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Returns true if the timer is armed and the deadline has passed
    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.deadline, Some(deadline) if deadline.has_elapsed(now))
    }

    /// Disarms and reports an expired timer exactly once
    #[inline]
    pub fn poll_expiration(&mut self, now: Timestamp) -> bool {
        if self.is_expired(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

/// Anything owning timers exposes the nearest wakeup through this trait so
/// the worker loop can compute its next sleep.
pub trait Provider {
    fn next_expiration(&self) -> Option<Timestamp>;
}

/// Folds the earliest deadline out of a set of timers
#[inline]
pub fn earliest(timers: impl IntoIterator<Item = Option<Timestamp>>) -> Option<Timestamp> {
    timers.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::now;

    #[test]
    fn poll_expiration_fires_once() {
        let mut timer = Timer::default();
        assert!(!timer.poll_expiration(now(10)));

        timer.set(now(5));
        assert!(timer.is_armed());
        assert!(!timer.poll_expiration(now(4)));
        assert!(timer.poll_expiration(now(5)));
        assert!(!timer.poll_expiration(now(6)));
        assert!(!timer.is_armed());
    }

    #[test]
    fn cancel_disarms() {
        let mut timer = Timer::default();
        timer.set(now(5));
        timer.cancel();
        assert!(!timer.poll_expiration(now(10)));
    }

    #[test]
    fn earliest_folds_min() {
        let mut a = Timer::default();
        let mut b = Timer::default();
        a.set(now(7));
        b.set(now(3));
        assert_eq!(
            earliest([a.deadline(), b.deadline(), None]),
            Some(now(3))
        );
    }
}
