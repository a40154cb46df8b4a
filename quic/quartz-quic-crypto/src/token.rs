// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Address validation token format.
//!
//! Wire layout: `timestamp_ms (8B big-endian) || HMAC-SHA256(secret,
//! source_tag || client_ip || timestamp || dcid_len (1B) || dcid)`,
//! 40 bytes total. Retry tokens bind the client's original DCID;
//! NEW_TOKEN tokens carry an empty DCID and a different source tag.
//!
//! Secrets rotate on a configurable interval; the previous secret stays
//! valid for one further interval so rotation never invalidates fresh
//! tokens.

use core::time::Duration;
use quartz_quic_core::{
    inet::SocketAddress,
    time::Timestamp,
    token::{Format, Outcome, Source},
};
use ring::{
    hmac,
    rand::{SecureRandom, SystemRandom},
};

pub const TOKEN_LEN: usize = 40;

const TIMESTAMP_LEN: usize = 8;

const RETRY_TAG: u8 = 0x72;
const NEW_TOKEN_TAG: u8 = 0x6e;

pub struct TokenFormat {
    current: hmac::Key,
    previous: Option<hmac::Key>,
    rotated_at: Option<Timestamp>,
    lifetime: Duration,
    rotation_interval: Duration,
    rng: SystemRandom,
}

impl TokenFormat {
    pub fn new(lifetime: Duration, rotation_interval: Duration) -> Self {
        let rng = SystemRandom::new();
        let current = new_secret(&rng);

        Self {
            current,
            previous: None,
            rotated_at: None,
            lifetime,
            rotation_interval,
            rng,
        }
    }

    fn maybe_rotate(&mut self, now: Timestamp) {
        let rotated_at = match self.rotated_at {
            Some(rotated_at) => rotated_at,
            None => {
                self.rotated_at = Some(now);
                return;
            }
        };

        if now.saturating_duration_since(rotated_at) >= self.rotation_interval {
            let next = new_secret(&self.rng);
            self.previous = Some(core::mem::replace(&mut self.current, next));
            self.rotated_at = Some(now);
        }
    }

    fn generate(
        &mut self,
        now: Timestamp,
        source_tag: u8,
        peer: &SocketAddress,
        dcid: &[u8],
        output: &mut [u8],
    ) -> Option<usize> {
        if output.len() < TOKEN_LEN {
            return None;
        }

        self.maybe_rotate(now);

        let timestamp = timestamp_ms(now).to_be_bytes();
        let tag = mac(&self.current, source_tag, peer, &timestamp, dcid);

        output[..TIMESTAMP_LEN].copy_from_slice(&timestamp);
        output[TIMESTAMP_LEN..TOKEN_LEN].copy_from_slice(tag.as_ref());
        Some(TOKEN_LEN)
    }
}

impl Format for TokenFormat {
    const TOKEN_LEN: usize = TOKEN_LEN;

    fn generate_retry_token(
        &mut self,
        now: Timestamp,
        peer: &SocketAddress,
        original_destination_connection_id: &[u8],
        output: &mut [u8],
    ) -> Option<usize> {
        self.generate(
            now,
            RETRY_TAG,
            peer,
            original_destination_connection_id,
            output,
        )
    }

    fn generate_new_token(
        &mut self,
        now: Timestamp,
        peer: &SocketAddress,
        output: &mut [u8],
    ) -> Option<usize> {
        self.generate(now, NEW_TOKEN_TAG, peer, &[], output)
    }

    fn validate_token(
        &mut self,
        now: Timestamp,
        peer: &SocketAddress,
        original_destination_connection_id: &[u8],
        source: Source,
        token: &[u8],
    ) -> Outcome {
        if token.len() != TOKEN_LEN {
            return Outcome::Invalid;
        }

        self.maybe_rotate(now);

        let (timestamp_bytes, tag) = token.split_at(TIMESTAMP_LEN);
        let timestamp: [u8; TIMESTAMP_LEN] =
            timestamp_bytes.try_into().expect("length checked");

        // tokens from the future are as invalid as expired ones
        let issued_ms = u64::from_be_bytes(timestamp);
        let now_ms = timestamp_ms(now);
        if issued_ms > now_ms || now_ms - issued_ms > self.lifetime.as_millis() as u64 {
            return Outcome::Invalid;
        }

        let (source_tag, dcid) = match source {
            Source::RetryPacket => (RETRY_TAG, original_destination_connection_id),
            Source::NewTokenFrame => (NEW_TOKEN_TAG, &[][..]),
        };

        let message = mac_message(source_tag, peer, &timestamp, dcid);
        for key in core::iter::once(&self.current).chain(self.previous.as_ref()) {
            if hmac::verify(key, &message, tag).is_ok() {
                return Outcome::Valid;
            }
        }

        Outcome::Invalid
    }
}

fn new_secret(rng: &SystemRandom) -> hmac::Key {
    let mut secret = [0u8; 32];
    rng.fill(&mut secret)
        .expect("the system random source is available");
    hmac::Key::new(hmac::HMAC_SHA256, &secret)
}

fn timestamp_ms(now: Timestamp) -> u64 {
    now.as_duration().as_millis() as u64
}

fn mac_message(
    source_tag: u8,
    peer: &SocketAddress,
    timestamp: &[u8; TIMESTAMP_LEN],
    dcid: &[u8],
) -> Vec<u8> {
    let ip = peer.ip().to_string();

    let mut message = Vec::with_capacity(1 + ip.len() + TIMESTAMP_LEN + 1 + dcid.len());
    message.push(source_tag);
    message.extend_from_slice(ip.as_bytes());
    message.extend_from_slice(timestamp);
    message.push(dcid.len() as u8);
    message.extend_from_slice(dcid);
    message
}

fn mac(
    key: &hmac::Key,
    source_tag: u8,
    peer: &SocketAddress,
    timestamp: &[u8; TIMESTAMP_LEN],
    dcid: &[u8],
) -> hmac::Tag {
    hmac::sign(key, &mac_message(source_tag, peer, timestamp, dcid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_quic_core::time::testing::now;

    const LIFETIME: Duration = Duration::from_secs(60);
    const ROTATION: Duration = Duration::from_secs(24 * 60 * 60);

    fn format() -> TokenFormat {
        TokenFormat::new(LIFETIME, ROTATION)
    }

    fn addr(port: u16) -> SocketAddress {
        format_args!("127.0.0.1:{port}").to_string().parse().unwrap()
    }

    fn addr_other() -> SocketAddress {
        "192.0.2.7:9000".parse().unwrap()
    }

    #[test]
    fn retry_token_round_trip() {
        let mut format = format();
        let dcid = [7u8; 8];
        let peer = addr(4433);

        let mut token = [0u8; TOKEN_LEN];
        let len = format
            .generate_retry_token(now(1_000_000), &peer, &dcid, &mut token)
            .unwrap();
        assert_eq!(len, TOKEN_LEN);

        assert_eq!(
            format.validate_token(now(2_000_000), &peer, &dcid, Source::RetryPacket, &token),
            Outcome::Valid
        );

        // a different client address fails
        assert_eq!(
            format.validate_token(
                now(2_000_000),
                &addr_other(),
                &dcid,
                Source::RetryPacket,
                &token
            ),
            Outcome::Invalid
        );

        // the port is not bound, only the IP
        assert_eq!(
            format.validate_token(now(2_000_000), &addr(9999), &dcid, Source::RetryPacket, &token),
            Outcome::Valid
        );

        // a different original DCID fails
        assert_eq!(
            format.validate_token(
                now(2_000_000),
                &peer,
                &[8u8; 8],
                Source::RetryPacket,
                &token
            ),
            Outcome::Invalid
        );
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let mut format = format();
        let dcid = [7u8; 8];
        let peer = addr(4433);

        let mut token = [0u8; TOKEN_LEN];
        format
            .generate_retry_token(now(0), &peer, &dcid, &mut token)
            .unwrap();

        let just_inside = LIFETIME.as_micros() as u64;
        assert_eq!(
            format.validate_token(now(just_inside), &peer, &dcid, Source::RetryPacket, &token),
            Outcome::Valid
        );

        let expired = just_inside + 2_000_000;
        assert_eq!(
            format.validate_token(now(expired), &peer, &dcid, Source::RetryPacket, &token),
            Outcome::Invalid
        );
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let mut format = format();
        let dcid = [7u8; 8];
        let peer = addr(4433);

        let mut token = [0u8; TOKEN_LEN];
        format
            .generate_retry_token(now(0), &peer, &dcid, &mut token)
            .unwrap();

        for index in [0, TIMESTAMP_LEN, TOKEN_LEN - 1] {
            let mut bad = token;
            bad[index] ^= 1;
            assert_eq!(
                format.validate_token(now(1_000_000), &peer, &dcid, Source::RetryPacket, &bad),
                Outcome::Invalid
            );
        }

        assert_eq!(
            format.validate_token(now(1_000_000), &peer, &dcid, Source::RetryPacket, &token[..39]),
            Outcome::Invalid
        );
    }

    #[test]
    fn one_rotation_keeps_tokens_valid_two_invalidates() {
        let mut format = format();
        let dcid = [7u8; 8];
        let peer = addr(4433);

        // anchor the rotation clock
        let mut token = [0u8; TOKEN_LEN];
        format
            .generate_retry_token(now(0), &peer, &dcid, &mut token)
            .unwrap();

        // the rotation interval passes; the first validation triggers the
        // rotation and the previous secret still validates the token,
        // ignoring the lifetime for the purpose of this check
        let mut short_lived = TokenFormat::new(Duration::from_secs(48 * 60 * 60 * 10), ROTATION);
        let mut token = [0u8; TOKEN_LEN];
        short_lived
            .generate_retry_token(now(0), &peer, &dcid, &mut token)
            .unwrap();

        let after_one = ROTATION.as_micros() as u64 + 1;
        assert_eq!(
            short_lived.validate_token(now(after_one), &peer, &dcid, Source::RetryPacket, &token),
            Outcome::Valid
        );

        let after_two = 2 * ROTATION.as_micros() as u64 + 2;
        assert_eq!(
            short_lived.validate_token(now(after_two), &peer, &dcid, Source::RetryPacket, &token),
            Outcome::Invalid
        );
    }

    #[test]
    fn new_token_and_retry_tokens_are_distinct() {
        let mut format = format();
        let peer = addr(4433);

        let mut token = [0u8; TOKEN_LEN];
        format
            .generate_new_token(now(0), &peer, &mut token)
            .unwrap();

        assert_eq!(
            format.validate_token(now(1_000_000), &peer, &[], Source::NewTokenFrame, &token),
            Outcome::Valid
        );

        // a NEW_TOKEN token presented as a Retry token fails
        assert_eq!(
            format.validate_token(now(1_000_000), &peer, &[], Source::RetryPacket, &token),
            Outcome::Invalid
        );
    }
}
