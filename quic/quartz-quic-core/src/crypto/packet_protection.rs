// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// An opaque packet protection failure.
///
/// Decryption failures are expected on the wire (reordering across key
/// phases, stray datagrams, attackers); the contents never differentiate
/// causes to avoid creating an oracle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error {
    reason: &'static str,
}

impl Error {
    pub const DECRYPT_ERROR: Self = Self::new("decrypt error");
    pub const INTERNAL_ERROR: Self = Self::new("internal error");

    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    pub const fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "packet protection error: {}", self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
