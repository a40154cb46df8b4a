// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use ring::hkdf;

//= https://www.rfc-editor.org/rfc/rfc8446#section-7.1
//# HKDF-Expand-Label(Secret, Label, Context, Length) =
//#      HKDF-Expand(Secret, HkdfLabel, Length)
//#
//# Where HkdfLabel is specified as:
//#
//# struct {
//#     uint16 length = Length;
//#     opaque label<7..255> = "tls13 " + Label;
//#     opaque context<0..255> = Context;
//# } HkdfLabel;

const LABEL_PREFIX: &[u8] = b"tls13 ";

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label with an empty context, the only form QUIC uses
pub(crate) fn expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = (LABEL_PREFIX.len() + label.len()) as u8;

    let info: [&[u8]; 5] = [&out_len, &[label_len], LABEL_PREFIX, label, &[0]];

    prk.expand(&info, OkmLen(out.len()))
        .expect("HKDF output length is always within bounds")
        .fill(out)
        .expect("HKDF output length matches the buffer");
}

/// HKDF-Extract followed by conversion into an expandable PRK
pub(crate) fn extract(algorithm: hkdf::Algorithm, salt: &[u8], secret: &[u8]) -> hkdf::Prk {
    hkdf::Salt::new(algorithm, salt).extract(secret)
}

/// Builds a PRK directly from an existing secret for expand-only use
pub(crate) fn prk_from_secret(algorithm: hkdf::Algorithm, secret: &[u8]) -> hkdf::Prk {
    hkdf::Prk::new_less_safe(algorithm, secret)
}
