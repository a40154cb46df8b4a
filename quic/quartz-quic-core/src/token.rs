// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Address validation tokens.
//!
//! Servers mint tokens for Retry packets and NEW_TOKEN frames; the
//! concrete HMAC scheme lives in `quartz-quic-crypto`.

use crate::{inet::SocketAddress, time::Timestamp};

/// Where a token presented by a client came from
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    RetryPacket,
    NewTokenFrame,
}

/// The outcome of validating a client's token
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The token is valid; carries the original DCID for Retry tokens
    Valid,

    /// The token failed validation and the packet should be dropped or
    /// answered with Retry
    Invalid,
}

/// Mints and validates address validation tokens
pub trait Format: 'static + Send {
    /// The wire length of every token this format produces
    const TOKEN_LEN: usize;

    /// Writes a Retry token for `peer` into `output`.
    ///
    /// Returns the number of bytes written, or `None` when the output
    /// buffer is too small.
    fn generate_retry_token(
        &mut self,
        now: Timestamp,
        peer: &SocketAddress,
        original_destination_connection_id: &[u8],
        output: &mut [u8],
    ) -> Option<usize>;

    /// Writes a NEW_TOKEN-frame token for `peer` into `output`
    fn generate_new_token(
        &mut self,
        now: Timestamp,
        peer: &SocketAddress,
        output: &mut [u8],
    ) -> Option<usize>;

    /// Validates a token presented in an Initial packet.
    ///
    /// For Retry tokens the original DCID must match; NEW_TOKEN tokens
    /// carry no DCID binding.
    fn validate_token(
        &mut self,
        now: Timestamp,
        peer: &SocketAddress,
        original_destination_connection_id: &[u8],
        source: Source,
        token: &[u8],
    ) -> Outcome;
}
