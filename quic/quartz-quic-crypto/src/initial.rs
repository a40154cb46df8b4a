// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{cipher_suite::{HeaderKeyPair, PacketKeyPair}, ciphers, hkdf};
use quartz_quic_core::{
    crypto::initial::{INITIAL_CLIENT_LABEL, INITIAL_SALT, INITIAL_SERVER_LABEL},
    crypto::tls::CipherSuite,
    endpoint,
};
use zeroize::Zeroizing;

const INITIAL_SECRET_LEN: usize = 32;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# initial_secret = HKDF-Extract(initial_salt,
//#                               client_dst_connection_id)
//#
//# client_initial_secret = HKDF-Expand-Label(initial_secret,
//#                                           "client in", "",
//#                                           Hash.length)
//# server_initial_secret = HKDF-Expand-Label(initial_secret,
//#                                           "server in", "",
//#                                           Hash.length)

pub(crate) fn initial_secrets(
    connection_id: &[u8],
) -> (
    Zeroizing<Vec<u8>>,
    Zeroizing<Vec<u8>>,
) {
    let algorithm = ring::hkdf::HKDF_SHA256;
    let initial_secret = hkdf::extract(algorithm, &INITIAL_SALT, connection_id);

    let mut client = Zeroizing::new(vec![0u8; INITIAL_SECRET_LEN]);
    let mut server = Zeroizing::new(vec![0u8; INITIAL_SECRET_LEN]);

    hkdf::expand_label(&initial_secret, &INITIAL_CLIENT_LABEL, &mut client);
    hkdf::expand_label(&initial_secret, &INITIAL_SERVER_LABEL, &mut server);

    (client, server)
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# Initial packets use AEAD_AES_128_GCM with keys derived from the
//# Destination Connection ID field of the first Initial packet sent
//# by the client

pub(crate) fn initial_keys(
    connection_id: &[u8],
    local: endpoint::Type,
) -> (PacketKeyPair, HeaderKeyPair) {
    let suite = CipherSuite::TLS_AES_128_GCM_SHA256;
    let ciphers = ciphers(suite).expect("AES-128-GCM is always available");

    let (client, server) = initial_secrets(connection_id);

    let (local_secret, remote_secret) = match local {
        endpoint::Type::Client => (client, server),
        endpoint::Type::Server => (server, client),
    };

    let header_keys = HeaderKeyPair::new(ciphers, &local_secret, &remote_secret);
    let packet_keys = PacketKeyPair::new(ciphers, suite, local_secret, remote_secret);

    (packet_keys, header_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use quartz_quic_core::crypto::{
        initial::{
            EXAMPLE_CLIENT_INITIAL_HEADER, EXAMPLE_CLIENT_INITIAL_PACKET_NUMBER,
            EXAMPLE_CLIENT_INITIAL_PAYLOAD_PREFIX, EXAMPLE_CLIENT_INITIAL_SECRET, EXAMPLE_DCID,
            EXAMPLE_SERVER_INITIAL_SECRET,
        },
        HeaderKey as _, InitialKey as _, Key as _,
    };

    #[test]
    fn rfc9001_initial_secrets() {
        let (client, server) = initial_secrets(&EXAMPLE_DCID);
        assert_eq!(&client[..], &EXAMPLE_CLIENT_INITIAL_SECRET);
        assert_eq!(&server[..], &EXAMPLE_SERVER_INITIAL_SECRET);
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.2
    //# Protecting the payload produces output that is sampled for header
    //# protection.  Because the header uses a 4-byte packet number
    //# encoding, the first 16 bytes of the protected payload are sampled
    //# and then applied to the header as follows:
    //#
    //# sample = d1b1c98dd7689fb8ec11d242b123dc9b
    #[test]
    fn rfc9001_client_initial_protection() {
        let (mut client_keys, client_header_keys) = PacketKeyPair::new_client(&EXAMPLE_DCID);

        // 1162-byte plaintext: the CRYPTO frame plus PADDING
        let mut payload = vec![0u8; 1162 + 16];
        payload[..EXAMPLE_CLIENT_INITIAL_PAYLOAD_PREFIX.len()]
            .copy_from_slice(&EXAMPLE_CLIENT_INITIAL_PAYLOAD_PREFIX);

        client_keys
            .encrypt(
                EXAMPLE_CLIENT_INITIAL_PACKET_NUMBER,
                &EXAMPLE_CLIENT_INITIAL_HEADER,
                &mut payload,
            )
            .unwrap();

        let sample = &payload[..16];
        assert_eq!(sample, hex!("d1b1c98dd7689fb8ec11d242b123dc9b"));

        let mask = client_header_keys.sealing_header_protection_mask(sample);

        //= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.2
        //# header[0] ^= mask[0] & 0x0f
        //#  = c0
        let mut first = EXAMPLE_CLIENT_INITIAL_HEADER[0];
        first ^= mask[0] & 0x0f;
        assert_eq!(first, 0xc0);

        // the packet number bytes protect to 7b9aec34
        let mut pn_bytes = [0u8; 4];
        pn_bytes.copy_from_slice(&EXAMPLE_CLIENT_INITIAL_HEADER[18..]);
        for (byte, mask_byte) in pn_bytes.iter_mut().zip(&mask[1..]) {
            *byte ^= mask_byte;
        }
        assert_eq!(pn_bytes, hex!("7b9aec34"));
    }

    #[test]
    fn client_and_server_derive_mirrored_keys() {
        let dcid = [0xc1u8; 8];
        let (mut client_keys, _) = PacketKeyPair::new_client(&dcid);
        let (server_keys, _) = PacketKeyPair::new_server(&dcid);

        let header = [0xc3u8, 0, 0, 0, 1];
        let mut payload = [0u8; 32];
        client_keys.encrypt(0, &header, &mut payload).unwrap();
        assert!(server_keys.decrypt(0, &header, &mut payload).is_ok());
    }
}
