// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{ciphers, hkdf, Ciphers, TAG_LEN};
use core::fmt;
use quartz_quic_core::crypto::{
    self, packet_protection, tls::CipherSuite, HeaderProtectionMask,
};
use ring::aead;
use zeroize::Zeroizing;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.1
//# The current encryption level secret and the label "quic key" are
//# input to the KDF to produce the AEAD key; the label "quic iv" is used
//# to derive the Initialization Vector (IV); see Section 5.3.  The
//# header protection key uses the "quic hp" label; see Section 5.4.

const KEY_LABEL: &[u8] = b"quic key";
const IV_LABEL: &[u8] = b"quic iv";
const HP_LABEL: &[u8] = b"quic hp";

//= https://www.rfc-editor.org/rfc/rfc9001#section-6.1
//# The secret used for key updates is computed using the KDF with a
//# label of "quic ku".

const KU_LABEL: &[u8] = b"quic ku";

const IV_LEN: usize = 12;

/// One direction's AEAD key and IV
struct DirectionKeys {
    key: aead::LessSafeKey,
    iv: [u8; IV_LEN],
}

impl DirectionKeys {
    fn new(ciphers: &'static Ciphers, secret: &[u8]) -> Self {
        let prk = hkdf::prk_from_secret(ciphers.hkdf, secret);

        let mut key_bytes = Zeroizing::new(vec![0u8; ciphers.aead.key_len()]);
        hkdf::expand_label(&prk, KEY_LABEL, &mut key_bytes);

        let mut iv = [0u8; IV_LEN];
        hkdf::expand_label(&prk, IV_LABEL, &mut iv);

        let key = aead::LessSafeKey::new(
            aead::UnboundKey::new(ciphers.aead, &key_bytes)
                .expect("key length from the same algorithm"),
        );

        Self { key, iv }
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-5.3
    //# The nonce, N, is formed by combining the packet
    //# protection IV with the packet number.  The 62 bits of the
    //# reconstructed QUIC packet number in network byte order are left-
    //# padded with zeros to the size of the IV.  The exclusive OR of the
    //# padded packet number and the IV forms the AEAD nonce.
    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (nonce_byte, pn_byte) in nonce[IV_LEN - 8..]
            .iter_mut()
            .zip(packet_number.to_be_bytes())
        {
            *nonce_byte ^= pn_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

/// Both directions' packet protection keys for one encryption level.
///
/// The level secrets are retained (zeroized on drop) so 1-RTT key
/// updates can derive the next generation.
pub struct PacketKeyPair {
    sealer: DirectionKeys,
    opener: DirectionKeys,
    local_secret: Zeroizing<Vec<u8>>,
    remote_secret: Zeroizing<Vec<u8>>,
    suite: CipherSuite,
}

impl fmt::Debug for PacketKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketKeyPair")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl PacketKeyPair {
    pub(crate) fn new(
        ciphers: &'static Ciphers,
        suite: CipherSuite,
        local_secret: Zeroizing<Vec<u8>>,
        remote_secret: Zeroizing<Vec<u8>>,
    ) -> Self {
        Self {
            sealer: DirectionKeys::new(ciphers, &local_secret),
            opener: DirectionKeys::new(ciphers, &remote_secret),
            local_secret,
            remote_secret,
            suite,
        }
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.suite
    }

    fn ciphers(&self) -> &'static Ciphers {
        ciphers(self.suite).expect("constructed with a known suite")
    }
}

impl crypto::Key for PacketKeyPair {
    fn decrypt(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        self.opener
            .key
            .open_in_place(
                self.opener.nonce(packet_number),
                aead::Aad::from(header),
                payload,
            )
            .map(|_| ())
            .map_err(|_| packet_protection::Error::DECRYPT_ERROR)
    }

    fn encrypt(
        &mut self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        let plaintext_len = payload
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(packet_protection::Error::INTERNAL_ERROR)?;
        let (plaintext, tag_out) = payload.split_at_mut(plaintext_len);

        let tag = self
            .sealer
            .key
            .seal_in_place_separate_tag(
                self.sealer.nonce(packet_number),
                aead::Aad::from(header),
                plaintext,
            )
            .map_err(|_| packet_protection::Error::INTERNAL_ERROR)?;

        tag_out.copy_from_slice(tag.as_ref());
        Ok(())
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn aead_confidentiality_limit(&self) -> u64 {
        self.ciphers().confidentiality_limit
    }

    fn aead_integrity_limit(&self) -> u64 {
        self.ciphers().integrity_limit
    }
}

impl crypto::HandshakeKey for PacketKeyPair {}

impl crypto::ZeroRttKey for PacketKeyPair {}

impl crypto::OneRttKey for PacketKeyPair {
    //= https://www.rfc-editor.org/rfc/rfc9001#section-6.1
    //# secret_<n+1> = HKDF-Expand-Label(secret_<n>, "quic ku",
    //#                                  "", Hash.length)
    fn derive_next_key(&self) -> Self {
        let ciphers = self.ciphers();

        let mut next_local = Zeroizing::new(vec![0u8; self.local_secret.len()]);
        let mut next_remote = Zeroizing::new(vec![0u8; self.remote_secret.len()]);

        hkdf::expand_label(
            &hkdf::prk_from_secret(ciphers.hkdf, &self.local_secret),
            KU_LABEL,
            &mut next_local,
        );
        hkdf::expand_label(
            &hkdf::prk_from_secret(ciphers.hkdf, &self.remote_secret),
            KU_LABEL,
            &mut next_remote,
        );

        Self::new(ciphers, self.suite, next_local, next_remote)
    }
}

impl crypto::InitialKey for PacketKeyPair {
    type HeaderKey = HeaderKeyPair;

    fn new_server(connection_id: &[u8]) -> (Self, Self::HeaderKey) {
        crate::initial::initial_keys(connection_id, quartz_quic_core::endpoint::Type::Server)
    }

    fn new_client(connection_id: &[u8]) -> (Self, Self::HeaderKey) {
        crate::initial::initial_keys(connection_id, quartz_quic_core::endpoint::Type::Client)
    }
}

/// Header protection keys for both directions.
///
//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4
//# The same header protection key is used for the duration of the
//# connection, with the value not changing after a key update
pub struct HeaderKeyPair {
    sealer: aead::quic::HeaderProtectionKey,
    opener: aead::quic::HeaderProtectionKey,
}

impl fmt::Debug for HeaderKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeaderKeyPair").finish_non_exhaustive()
    }
}

impl HeaderKeyPair {
    pub(crate) fn new(
        ciphers: &'static Ciphers,
        local_secret: &[u8],
        remote_secret: &[u8],
    ) -> Self {
        let new_key = |secret: &[u8]| {
            let prk = hkdf::prk_from_secret(ciphers.hkdf, secret);
            let mut key_bytes = Zeroizing::new(vec![0u8; ciphers.header_protection.key_len()]);
            hkdf::expand_label(&prk, HP_LABEL, &mut key_bytes);
            aead::quic::HeaderProtectionKey::new(ciphers.header_protection, &key_bytes)
                .expect("key length from the same algorithm")
        };

        Self {
            sealer: new_key(local_secret),
            opener: new_key(remote_secret),
        }
    }
}

impl crypto::HeaderKey for HeaderKeyPair {
    fn opening_header_protection_mask(&self, ciphertext_sample: &[u8]) -> HeaderProtectionMask {
        self.opener
            .new_mask(ciphertext_sample)
            .expect("sample length is validated by the caller")
    }

    fn opening_sample_len(&self) -> usize {
        self.opener.algorithm().sample_len()
    }

    fn sealing_header_protection_mask(&self, ciphertext_sample: &[u8]) -> HeaderProtectionMask {
        self.sealer
            .new_mask(ciphertext_sample)
            .expect("sample length is validated by the caller")
    }

    fn sealing_sample_len(&self) -> usize {
        self.sealer.algorithm().sample_len()
    }
}

/// Builds the level keys from TLS-provided secrets
pub fn key_pair_from_secrets(
    suite: CipherSuite,
    local_secret: &[u8],
    remote_secret: &[u8],
) -> Option<(PacketKeyPair, HeaderKeyPair)> {
    let ciphers = ciphers(suite)?;

    let header_keys = HeaderKeyPair::new(ciphers, local_secret, remote_secret);
    let packet_keys = PacketKeyPair::new(
        ciphers,
        suite,
        Zeroizing::new(local_secret.to_vec()),
        Zeroizing::new(remote_secret.to_vec()),
    );

    Some((packet_keys, header_keys))
}

/// The full suite of concrete key types
#[derive(Debug, Default)]
pub struct Suite;

impl quartz_quic_core::crypto::CryptoSuite for Suite {
    type InitialKey = PacketKeyPair;
    type InitialHeaderKey = HeaderKeyPair;
    type HandshakeKey = PacketKeyPair;
    type HandshakeHeaderKey = HeaderKeyPair;
    type ZeroRttKey = PacketKeyPair;
    type ZeroRttHeaderKey = HeaderKeyPair;
    type OneRttKey = PacketKeyPair;
    type OneRttHeaderKey = HeaderKeyPair;
    type RetryKey = crate::retry::RetryKey;
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_quic_core::crypto::Key as _;

    fn pair() -> (PacketKeyPair, PacketKeyPair) {
        let local = [1u8; 32];
        let remote = [2u8; 32];
        let (ours, _) =
            key_pair_from_secrets(CipherSuite::TLS_AES_128_GCM_SHA256, &local, &remote).unwrap();
        let (theirs, _) =
            key_pair_from_secrets(CipherSuite::TLS_AES_128_GCM_SHA256, &remote, &local).unwrap();
        (ours, theirs)
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut ours, theirs) = pair();
        let header = [0x40u8, 1, 2, 3];
        let mut payload = *b"attack at dawn\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

        ours.encrypt(7, &header, &mut payload).unwrap();
        assert_ne!(&payload[..14], b"attack at dawn");

        theirs.decrypt(7, &header, &mut payload).unwrap();
        assert_eq!(&payload[..14], b"attack at dawn");
    }

    #[test]
    fn tampering_is_detected() {
        let (mut ours, theirs) = pair();
        let header = [0x40u8, 1, 2, 3];

        for flip in [0usize, 5, 20] {
            let mut payload = [0u8; 32];
            ours.encrypt(1, &header, &mut payload).unwrap();
            payload[flip] ^= 0x01;
            assert!(theirs.decrypt(1, &header, &mut payload).is_err());
        }

        // header is bound as AAD
        let mut payload = [0u8; 32];
        ours.encrypt(2, &header, &mut payload).unwrap();
        let bad_header = [0x40u8, 1, 2, 4];
        assert!(theirs.decrypt(2, &bad_header, &mut payload).is_err());

        // wrong packet number means a wrong nonce
        let mut payload = [0u8; 32];
        ours.encrypt(3, &header, &mut payload).unwrap();
        assert!(theirs.decrypt(4, &header, &mut payload).is_err());
    }

    #[test]
    fn key_update_stays_in_sync() {
        use quartz_quic_core::crypto::OneRttKey as _;

        let (ours, theirs) = pair();
        let mut next_ours = ours.derive_next_key();
        let next_theirs = theirs.derive_next_key();

        let header = [0x40u8];
        let mut payload = [0u8; 24];
        next_ours.encrypt(0, &header, &mut payload).unwrap();
        assert!(next_theirs.decrypt(0, &header, &mut payload).is_ok());

        // old keys no longer open new ciphertext
        let mut payload = [0u8; 24];
        next_ours.encrypt(1, &header, &mut payload).unwrap();
        assert!(theirs.decrypt(1, &header, &mut payload).is_err());
    }

    #[test]
    fn all_suites_round_trip() {
        for suite in [
            CipherSuite::TLS_AES_128_GCM_SHA256,
            CipherSuite::TLS_AES_256_GCM_SHA384,
            CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
        ] {
            let local = [3u8; 48];
            let remote = [4u8; 48];
            let (mut ours, _) = key_pair_from_secrets(suite, &local, &remote).unwrap();
            let (theirs, _) = key_pair_from_secrets(suite, &remote, &local).unwrap();

            let mut payload = [7u8; 40];
            ours.encrypt(9, &[0x40], &mut payload).unwrap();
            theirs.decrypt(9, &[0x40], &mut payload).unwrap();
            assert_eq!(&payload[..24], &[7u8; 24]);
        }
    }
}
