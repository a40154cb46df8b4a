// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A scripted TLS session for driving connection tests without a real
//! TLS engine.

use crate::{
    crypto::{
        self,
        tls::{self, ApplicationParameters, CipherSuite, EarlyDataStatus},
    },
    transport,
};
use alloc::{collections::VecDeque, vec::Vec};
use bytes::Bytes;
use core::task::Poll;

/// One scripted action, applied on the next `poll`
#[derive(Debug)]
pub enum Step {
    /// Install handshake keys
    HandshakeKeys,

    /// Install 0-RTT keys carrying remembered transport parameters
    ZeroRttKeys { transport_parameters: Vec<u8> },

    /// Install 1-RTT keys carrying the given encoded transport parameters
    OneRttKeys { transport_parameters: Vec<u8> },

    /// Emit handshake bytes at the Initial level
    SendInitial(Bytes),

    /// Emit handshake bytes at the Handshake level
    SendHandshake(Bytes),

    /// Report the early data decision
    EarlyData(EarlyDataStatus),

    /// Report the negotiated application protocol
    Alpn(Bytes),

    /// Report handshake completion
    Complete,
}

#[derive(Debug, Default)]
pub struct Session {
    steps: VecDeque<Step>,
    complete: bool,
}

impl Session {
    pub fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            complete: false,
        }
    }

    /// Queues another step, applied on the next poll
    pub fn push(&mut self, step: Step) {
        self.steps.push_back(step);
    }
}

impl crypto::CryptoSuite for Session {
    type InitialKey = crypto::testing::Key;
    type InitialHeaderKey = crypto::testing::HeaderKey;
    type HandshakeKey = crypto::testing::Key;
    type HandshakeHeaderKey = crypto::testing::HeaderKey;
    type ZeroRttKey = crypto::testing::Key;
    type ZeroRttHeaderKey = crypto::testing::HeaderKey;
    type OneRttKey = crypto::testing::Key;
    type OneRttHeaderKey = crypto::testing::HeaderKey;
    type RetryKey = crypto::testing::RetryKey;
}

impl tls::Session for Session {
    fn poll<C: tls::Context<Self>>(
        &mut self,
        context: &mut C,
    ) -> Poll<Result<(), transport::Error>> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::HandshakeKeys => {
                    context.on_handshake_keys(
                        crypto::testing::Key::default(),
                        crypto::testing::HeaderKey,
                    )?;
                }
                Step::ZeroRttKeys {
                    transport_parameters,
                } => {
                    context.on_zero_rtt_keys(
                        crypto::testing::Key::default(),
                        crypto::testing::HeaderKey,
                        ApplicationParameters {
                            transport_parameters: &transport_parameters,
                        },
                    )?;
                }
                Step::OneRttKeys {
                    transport_parameters,
                } => {
                    context.on_one_rtt_keys(
                        crypto::testing::Key::default(),
                        crypto::testing::HeaderKey,
                        ApplicationParameters {
                            transport_parameters: &transport_parameters,
                        },
                    )?;
                }
                Step::SendInitial(bytes) => context.send_initial(bytes),
                Step::SendHandshake(bytes) => context.send_handshake(bytes),
                Step::EarlyData(status) => context.on_early_data_status(status)?,
                Step::Alpn(protocol) => context.on_application_protocol(protocol)?,
                Step::Complete => {
                    self.complete = true;
                    context.on_handshake_complete()?;
                }
            }
        }

        if self.complete {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn cipher_suite(&self) -> CipherSuite {
        CipherSuite::Unknown
    }
}

#[derive(Debug, Default)]
pub struct Endpoint;

impl tls::Endpoint for Endpoint {
    type Session = Session;

    fn new_server_session<Params: quartz_codec::EncoderValue>(
        &mut self,
        _transport_parameters: &Params,
    ) -> Self::Session {
        Session::default()
    }

    fn new_client_session<Params: quartz_codec::EncoderValue>(
        &mut self,
        _transport_parameters: &Params,
        _server_name: &str,
    ) -> Self::Session {
        Session::default()
    }

    fn max_tag_length(&self) -> usize {
        0
    }
}
