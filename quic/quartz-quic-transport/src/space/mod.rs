// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet number spaces.
//!
//! Each space owns its keys, its send packet-number counter, its
//! received-packet state, its handshake byte stream and its loss
//! recovery. Initial and Handshake spaces are discarded as the
//! handshake progresses; the application space lives for the
//! connection.

use crate::{recovery, space::ack_manager::AckManager, space::crypto_stream::CryptoStream};
use quartz_quic_core::{
    ack,
    crypto::{CryptoSuite, KeySet},
    packet::number::{PacketNumber, PacketNumberSpace},
    varint::VarInt,
};

pub mod ack_manager;
pub mod crypto_stream;

/// State shared by all three spaces
#[derive(Debug)]
pub struct Common {
    space: PacketNumberSpace,
    next_packet_number: PacketNumber,
    pub ack_manager: AckManager,
    pub crypto_stream: CryptoStream,
    pub recovery: recovery::Manager,
}

impl Common {
    pub fn new(space: PacketNumberSpace, settings: ack::Settings) -> Self {
        Self {
            space,
            next_packet_number: space.new_packet_number(VarInt::ZERO),
            ack_manager: AckManager::new(settings),
            crypto_stream: CryptoStream::default(),
            recovery: recovery::Manager::new(space),
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    /// Allocates the next packet number; numbers are never reused
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let current = self.next_packet_number;
        self.next_packet_number = current
            .next()
            .expect("packet numbers never reach 2^62 in practice");
        current
    }

    #[inline]
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.ack_manager.largest_received()
    }
}

/// The Initial space: keys derived from the client's first DCID
pub struct InitialSpace<S: CryptoSuite> {
    pub key: S::InitialKey,
    pub header_key: S::InitialHeaderKey,
    pub common: Common,
}

impl<S: CryptoSuite> InitialSpace<S> {
    pub fn new(key: S::InitialKey, header_key: S::InitialHeaderKey, settings: ack::Settings) -> Self {
        Self {
            key,
            header_key,
            common: Common::new(PacketNumberSpace::Initial, settings),
        }
    }
}

/// The Handshake space, installed by the TLS engine
pub struct HandshakeSpace<S: CryptoSuite> {
    pub key: S::HandshakeKey,
    pub header_key: S::HandshakeHeaderKey,
    pub common: Common,
}

impl<S: CryptoSuite> HandshakeSpace<S> {
    pub fn new(
        key: S::HandshakeKey,
        header_key: S::HandshakeHeaderKey,
        settings: ack::Settings,
    ) -> Self {
        Self {
            key,
            header_key,
            common: Common::new(PacketNumberSpace::Handshake, settings),
        }
    }
}

/// The application space: 0-RTT and 1-RTT packets.
///
/// A client offering early data creates this space with only 0-RTT
/// keys; the 1-RTT key set arrives when the TLS handshake produces it.
/// Packet numbers are shared between the two epochs.
pub struct ApplicationSpace<S: CryptoSuite> {
    /// The current and next 1-RTT key generations
    pub one_rtt: Option<OneRttKeys<S>>,

    /// 0-RTT keys: sealing for clients, opening for servers
    pub zero_rtt: Option<(S::ZeroRttKey, S::ZeroRttHeaderKey)>,

    pub common: Common,

    /// HANDSHAKE_DONE needs (re)transmission (server only)
    pub handshake_done_pending: bool,
}

pub struct OneRttKeys<S: CryptoSuite> {
    pub key_set: KeySet<S::OneRttKey>,
    pub header_key: S::OneRttHeaderKey,
}

impl<S: CryptoSuite> ApplicationSpace<S> {
    pub fn new_one_rtt(
        key: S::OneRttKey,
        header_key: S::OneRttHeaderKey,
        settings: ack::Settings,
    ) -> Self {
        Self {
            one_rtt: Some(OneRttKeys {
                key_set: KeySet::new(key),
                header_key,
            }),
            zero_rtt: None,
            common: Common::new(PacketNumberSpace::ApplicationData, settings),
            handshake_done_pending: false,
        }
    }

    pub fn new_zero_rtt(
        key: S::ZeroRttKey,
        header_key: S::ZeroRttHeaderKey,
        settings: ack::Settings,
    ) -> Self {
        Self {
            one_rtt: None,
            zero_rtt: Some((key, header_key)),
            common: Common::new(PacketNumberSpace::ApplicationData, settings),
            handshake_done_pending: false,
        }
    }

    /// Installs the 1-RTT generation once the TLS handshake derives it
    pub fn install_one_rtt(&mut self, key: S::OneRttKey, header_key: S::OneRttHeaderKey) {
        if self.one_rtt.is_none() {
            self.one_rtt = Some(OneRttKeys {
                key_set: KeySet::new(key),
                header_key,
            });
        }
    }
}
