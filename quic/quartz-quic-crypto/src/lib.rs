// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! `ring`-backed packet protection for quartz-quic.
//!
//! The negotiated TLS cipher suite selects the AEAD and header
//! protection algorithms; key material flows in from the TLS engine (or
//! from the Initial salt) as raw secrets and never leaves this crate
//! unencrypted.

pub mod cipher_suite;
pub mod initial;
pub mod random;
pub mod retry;
pub mod token;

mod hkdf;

pub use cipher_suite::{HeaderKeyPair, PacketKeyPair, Suite};
pub use random::Random;

use quartz_quic_core::crypto::tls::CipherSuite;

/// The AEAD tag length shared by every TLS 1.3 suite
pub const TAG_LEN: usize = 16;

pub(crate) struct Ciphers {
    pub aead: &'static ring::aead::Algorithm,
    pub header_protection: &'static ring::aead::quic::Algorithm,
    pub hkdf: ring::hkdf::Algorithm,
    /// Packets that may be encrypted under one key
    pub confidentiality_limit: u64,
    /// Failed decryptions tolerated under one key
    pub integrity_limit: u64,
}

pub(crate) fn ciphers(suite: CipherSuite) -> Option<&'static Ciphers> {
    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-B.1
    //# For AEAD_AES_128_GCM and AEAD_AES_256_GCM, the confidentiality
    //# limit is 2^23 encrypted packets.

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-B.1
    //# For AEAD_AES_128_GCM and AEAD_AES_256_GCM, the integrity limit is
    //# 2^52 invalid packets.
    static AES_128: Ciphers = Ciphers {
        aead: &ring::aead::AES_128_GCM,
        header_protection: &ring::aead::quic::AES_128,
        hkdf: ring::hkdf::HKDF_SHA256,
        confidentiality_limit: 1 << 23,
        integrity_limit: 1 << 52,
    };

    static AES_256: Ciphers = Ciphers {
        aead: &ring::aead::AES_256_GCM,
        header_protection: &ring::aead::quic::AES_256,
        hkdf: ring::hkdf::HKDF_SHA384,
        confidentiality_limit: 1 << 23,
        integrity_limit: 1 << 52,
    };

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-B.2
    //# For AEAD_CHACHA20_POLY1305, the confidentiality limit is greater
    //# than the number of possible packets (2^62) and so can be ignored.

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-B.2
    //# For AEAD_CHACHA20_POLY1305, the integrity limit is 2^36 invalid
    //# packets.
    static CHACHA20: Ciphers = Ciphers {
        aead: &ring::aead::CHACHA20_POLY1305,
        header_protection: &ring::aead::quic::CHACHA20,
        hkdf: ring::hkdf::HKDF_SHA256,
        confidentiality_limit: 1 << 62,
        integrity_limit: 1 << 36,
    };

    match suite {
        CipherSuite::TLS_AES_128_GCM_SHA256 => Some(&AES_128),
        CipherSuite::TLS_AES_256_GCM_SHA384 => Some(&AES_256),
        CipherSuite::TLS_CHACHA20_POLY1305_SHA256 => Some(&CHACHA20),
        CipherSuite::Unknown => None,
    }
}
