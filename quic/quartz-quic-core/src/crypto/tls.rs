// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The boundary to the external TLS 1.3 engine.
//!
//! The transport treats the engine as a byte pipe keyed by encryption
//! level. The engine drives key installation, transport parameter
//! exchange and handshake completion through the `Context` callbacks.

use crate::{crypto::CryptoSuite, transport};
use bytes::Bytes;
use core::fmt::Debug;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

//= https://www.rfc-editor.org/rfc/rfc8446#appendix-B.4
//# This specification defines the following cipher suites for use with
//# TLS 1.3.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum CipherSuite {
    TLS_AES_128_GCM_SHA256,
    TLS_AES_256_GCM_SHA384,
    TLS_CHACHA20_POLY1305_SHA256,
    Unknown,
}

/// Application parameters exchanged within the TLS handshake
#[derive(Debug)]
pub struct ApplicationParameters<'a> {
    /// Encoded peer transport parameters
    pub transport_parameters: &'a [u8],
}

/// The status of TLS early data on this session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EarlyDataStatus {
    /// The session has no early-data capability
    #[default]
    None,

    /// Early data was offered; the server has not yet decided
    Offered,

    Accepted,

    Rejected,
}

impl EarlyDataStatus {
    #[inline]
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }

    #[inline]
    pub fn is_rejected(self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Callbacks the transport hands to the TLS session on every poll.
///
/// Handshake data produced by the engine is pushed through `send_*`;
/// data arriving in CRYPTO frames is pulled through `receive_*`.
pub trait Context<Crypto: CryptoSuite> {
    fn on_handshake_keys(
        &mut self,
        key: Crypto::HandshakeKey,
        header_key: Crypto::HandshakeHeaderKey,
    ) -> Result<(), transport::Error>;

    fn on_zero_rtt_keys(
        &mut self,
        key: Crypto::ZeroRttKey,
        header_key: Crypto::ZeroRttHeaderKey,
        application_parameters: ApplicationParameters,
    ) -> Result<(), transport::Error>;

    fn on_one_rtt_keys(
        &mut self,
        key: Crypto::OneRttKey,
        header_key: Crypto::OneRttHeaderKey,
        application_parameters: ApplicationParameters,
    ) -> Result<(), transport::Error>;

    fn on_application_protocol(
        &mut self,
        application_protocol: Bytes,
    ) -> Result<(), transport::Error>;

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.1.1
    //# The TLS handshake is considered complete when the
    //# TLS stack has reported that the handshake is complete.  This happens
    //# when the TLS stack has both sent a Finished message and verified the
    //# peer's Finished message.
    fn on_handshake_complete(&mut self) -> Result<(), transport::Error>;

    /// Notifies the transport of the early data decision
    fn on_early_data_status(&mut self, status: EarlyDataStatus) -> Result<(), transport::Error>;

    /// Receives handshake data buffered from Initial CRYPTO frames
    fn receive_initial(&mut self, max_len: Option<usize>) -> Option<Bytes>;

    fn receive_handshake(&mut self, max_len: Option<usize>) -> Option<Bytes>;

    fn receive_application(&mut self, max_len: Option<usize>) -> Option<Bytes>;

    fn can_send_initial(&self) -> bool;
    fn send_initial(&mut self, transmission: Bytes);

    fn can_send_handshake(&self) -> bool;
    fn send_handshake(&mut self, transmission: Bytes);

    fn can_send_application(&self) -> bool;
    fn send_application(&mut self, transmission: Bytes);
}

/// A TLS session for one connection
pub trait Session: CryptoSuite + Sized + Send + Debug {
    /// Drives the handshake as far as the available data allows.
    ///
    /// Progress is reported through the `Context` callbacks. `Pending`
    /// means the engine is waiting for more handshake data.
    fn poll<C: Context<Self>>(
        &mut self,
        context: &mut C,
    ) -> core::task::Poll<Result<(), transport::Error>>;

    /// Returns the negotiated cipher suite once known
    fn cipher_suite(&self) -> CipherSuite;
}

/// A TLS endpoint, creating one session per connection
pub trait Endpoint: 'static + Sized + Send {
    type Session: Session;

    fn new_server_session<Params: quartz_codec::EncoderValue>(
        &mut self,
        transport_parameters: &Params,
    ) -> Self::Session;

    fn new_client_session<Params: quartz_codec::EncoderValue>(
        &mut self,
        transport_parameters: &Params,
        server_name: &str,
    ) -> Self::Session;

    /// The maximum AEAD tag length across every suite the endpoint may
    /// negotiate
    fn max_tag_length(&self) -> usize;
}
