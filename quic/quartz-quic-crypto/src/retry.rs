// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quartz_quic_core::crypto::{self, packet_protection};
use ring::aead;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The Retry Integrity Tag is a 128-bit field that is computed as the
//# output of AEAD_AES_128_GCM used with the following inputs:
//#
//# *  The secret key, K, is 128 bits equal to
//#    0xbe0c690b9f66575a1d766b54e368c84e.
//#
//# *  The nonce, N, is 96 bits equal to 0x461599d35d632bf2239825bb.

const SECRET_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];

const NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

#[derive(Clone, Copy, Debug, Default)]
pub struct RetryKey;

fn compute_tag(pseudo_packet: &[u8]) -> [u8; 16] {
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &SECRET_KEY).expect("fixed key length"),
    );

    //= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
    //# *  The plaintext, P, is empty.
    //#
    //# *  The associated data, A, is the contents of the Retry Pseudo-
    //#    Packet
    let mut empty: [u8; 0] = [];
    let tag = key
        .seal_in_place_separate_tag(
            aead::Nonce::assume_unique_for_key(NONCE),
            aead::Aad::from(pseudo_packet),
            &mut empty,
        )
        .expect("sealing an empty plaintext cannot fail");

    let mut out = [0u8; 16];
    out.copy_from_slice(tag.as_ref());
    out
}

impl crypto::RetryKey for RetryKey {
    fn generate_tag(pseudo_packet: &[u8]) -> [u8; 16] {
        compute_tag(pseudo_packet)
    }

    fn validate(pseudo_packet: &[u8], tag: &[u8; 16]) -> Result<(), packet_protection::Error> {
        use subtle::ConstantTimeEq;

        let expected = compute_tag(pseudo_packet);
        if expected.ct_eq(tag).into() {
            Ok(())
        } else {
            Err(packet_protection::Error::DECRYPT_ERROR)
        }
    }
}
