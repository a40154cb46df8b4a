// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Null crypto implementations.
//!
//! Payloads pass through unchanged and header protection masks are all
//! zeroes, so packets stay readable in test assertions while the
//! connection machinery exercises the same code paths as production.

use crate::crypto::{self, packet_protection, HeaderProtectionMask};

#[derive(Clone, Debug)]
pub struct Key {
    pub confidentiality_limit: u64,
    pub integrity_limit: u64,
    pub derivations: u64,
    pub fail_on_decrypt: bool,
}

impl Default for Key {
    fn default() -> Self {
        Self {
            confidentiality_limit: 64,
            integrity_limit: 64,
            derivations: 0,
            fail_on_decrypt: false,
        }
    }
}

impl crypto::Key for Key {
    fn decrypt(
        &self,
        _packet_number: u64,
        _header: &[u8],
        _payload: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        if self.fail_on_decrypt {
            return Err(packet_protection::Error::DECRYPT_ERROR);
        }

        Ok(())
    }

    fn encrypt(
        &mut self,
        _packet_number: u64,
        _header: &[u8],
        _payload: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        Ok(())
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn aead_confidentiality_limit(&self) -> u64 {
        self.confidentiality_limit
    }

    fn aead_integrity_limit(&self) -> u64 {
        self.integrity_limit
    }
}

impl crypto::InitialKey for Key {
    type HeaderKey = HeaderKey;

    fn new_server(_connection_id: &[u8]) -> (Self, Self::HeaderKey) {
        (Key::default(), HeaderKey::default())
    }

    fn new_client(_connection_id: &[u8]) -> (Self, Self::HeaderKey) {
        (Key::default(), HeaderKey::default())
    }
}

impl crypto::HandshakeKey for Key {}

impl crypto::ZeroRttKey for Key {}

impl crypto::OneRttKey for Key {
    fn derive_next_key(&self) -> Self {
        Self {
            derivations: self.derivations + 1,
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderKey;

impl crypto::HeaderKey for HeaderKey {
    fn opening_header_protection_mask(&self, _sample: &[u8]) -> HeaderProtectionMask {
        Default::default()
    }

    fn opening_sample_len(&self) -> usize {
        crypto::HEADER_PROTECTION_SAMPLE_LEN
    }

    fn sealing_header_protection_mask(&self, _sample: &[u8]) -> HeaderProtectionMask {
        Default::default()
    }

    fn sealing_sample_len(&self) -> usize {
        crypto::HEADER_PROTECTION_SAMPLE_LEN
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RetryKey;

impl crypto::RetryKey for RetryKey {
    fn generate_tag(_pseudo_packet: &[u8]) -> [u8; 16] {
        [0; 16]
    }

    fn validate(_pseudo_packet: &[u8], _tag: &[u8; 16]) -> Result<(), packet_protection::Error> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Suite;

impl crypto::CryptoSuite for Suite {
    type InitialKey = Key;
    type InitialHeaderKey = HeaderKey;
    type HandshakeKey = Key;
    type HandshakeHeaderKey = HeaderKey;
    type ZeroRttKey = Key;
    type ZeroRttHeaderKey = HeaderKey;
    type OneRttKey = Key;
    type OneRttHeaderKey = HeaderKey;
    type RetryKey = RetryKey;
}
