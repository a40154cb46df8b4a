// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameters, exchanged in the TLS extension (id 0x39) as a
//! sequence of (id, length, value) triples.

use crate::{
    connection::id::UnboundedId,
    endpoint,
    inet::{Ipv4Addr, Ipv6Addr},
    transport::Error,
    varint::VarInt,
};
use quartz_codec::{DecoderBuffer, Encoder, EncoderValue};

#[cfg(test)]
mod tests;

mod ids {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const PREFERRED_ADDRESS: u64 = 0x0d;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
    pub const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# The default for this parameter is the maximum permitted UDP payload of
//# 65527.  Values below 1200 are invalid.

pub const DEFAULT_MAX_UDP_PAYLOAD_SIZE: u64 = 65527;
pub const MIN_MAX_UDP_PAYLOAD_SIZE: u64 = 1200;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# If this transport parameter is absent, a default of 2 is assumed.

pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

/// A server's preferred address, offered for migration after the
/// handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4: Option<(Ipv4Addr, u16)>,
    pub ipv6: Option<(Ipv6Addr, u16)>,
    pub connection_id: UnboundedId,
    pub stateless_reset_token: [u8; 16],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<UnboundedId>,
    /// Idle timeout in milliseconds; zero disables the timer
    pub max_idle_timeout: VarInt,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: VarInt,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: u8,
    /// Milliseconds
    pub max_ack_delay: VarInt,
    pub disable_active_migration: bool,
    pub preferred_address: Option<PreferredAddress>,
    pub active_connection_id_limit: VarInt,
    pub initial_source_connection_id: Option<UnboundedId>,
    pub retry_source_connection_id: Option<UnboundedId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: VarInt::ZERO,
            stateless_reset_token: None,
            max_udp_payload_size: VarInt::new(DEFAULT_MAX_UDP_PAYLOAD_SIZE).unwrap(),
            initial_max_data: VarInt::ZERO,
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            ack_delay_exponent: crate::ack::DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: VarInt::from_u8(25),
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: VarInt::new(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT).unwrap(),
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

fn param_error(reason: &'static str) -> Error {
    Error::TRANSPORT_PARAMETER_ERROR.with_reason(reason)
}

fn decode_varint_param(bytes: &[u8]) -> Result<VarInt, Error> {
    let (value, remaining) = DecoderBuffer::new(bytes)
        .decode::<VarInt>()
        .map_err(|_| param_error("malformed varint parameter"))?;
    remaining
        .ensure_empty()
        .map_err(|_| param_error("trailing bytes in parameter"))?;
    Ok(value)
}

fn decode_cid_param(bytes: &[u8]) -> Result<UnboundedId, Error> {
    UnboundedId::try_from_bytes(bytes).ok_or(param_error("connection id too long"))
}

impl TransportParameters {
    /// Decodes the parameter sequence sent by `sender`.
    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.1
    //# An endpoint MUST NOT send a parameter more than once in a given
    //# transport parameters extension.  An endpoint SHOULD treat receipt of
    //# duplicate transport parameters as a connection error of type
    //# TRANSPORT_PARAMETER_ERROR.
    pub fn decode(buffer: DecoderBuffer, sender: endpoint::Type) -> Result<Self, Error> {
        let mut params = Self::default();
        let mut seen: u32 = 0;
        let mut buffer = buffer;

        while !buffer.is_empty() {
            let (id, rest) = buffer
                .decode::<VarInt>()
                .map_err(|_| param_error("malformed parameter id"))?;
            let (value, rest) = rest
                .decode_slice_with_len_prefix::<VarInt>()
                .map_err(|_| param_error("malformed parameter length"))?;
            buffer = rest;
            let value = value.into_less_safe_slice();

            let id = id.as_u64();
            if id <= ids::RETRY_SOURCE_CONNECTION_ID {
                let bit = 1u32 << id;
                if seen & bit != 0 {
                    return Err(param_error("duplicate transport parameter"));
                }
                seen |= bit;
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.1
            //# A client MUST NOT include any server-only transport parameter:
            //# original_destination_connection_id, preferred_address,
            //# retry_source_connection_id, or stateless_reset_token.
            let server_only = matches!(
                id,
                ids::ORIGINAL_DESTINATION_CONNECTION_ID
                    | ids::STATELESS_RESET_TOKEN
                    | ids::PREFERRED_ADDRESS
                    | ids::RETRY_SOURCE_CONNECTION_ID
            );
            if server_only && sender.is_client() {
                return Err(param_error("server-only parameter sent by client"));
            }

            match id {
                ids::ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(decode_cid_param(value)?);
                }
                ids::MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = decode_varint_param(value)?;
                }
                ids::STATELESS_RESET_TOKEN => {
                    let token: &[u8; 16] = value
                        .try_into()
                        .map_err(|_| param_error("malformed stateless reset token"))?;
                    params.stateless_reset_token = Some(*token);
                }
                ids::MAX_UDP_PAYLOAD_SIZE => {
                    let value = decode_varint_param(value)?;
                    if *value < MIN_MAX_UDP_PAYLOAD_SIZE {
                        return Err(param_error("max_udp_payload_size below 1200"));
                    }
                    params.max_udp_payload_size = value;
                }
                ids::INITIAL_MAX_DATA => {
                    params.initial_max_data = decode_varint_param(value)?;
                }
                ids::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = decode_varint_param(value)?;
                }
                ids::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = decode_varint_param(value)?;
                }
                ids::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = decode_varint_param(value)?;
                }
                ids::INITIAL_MAX_STREAMS_BIDI => {
                    let value = decode_varint_param(value)?;
                    if *value > (1 << 60) {
                        return Err(param_error("initial_max_streams_bidi exceeds 2^60"));
                    }
                    params.initial_max_streams_bidi = value;
                }
                ids::INITIAL_MAX_STREAMS_UNI => {
                    let value = decode_varint_param(value)?;
                    if *value > (1 << 60) {
                        return Err(param_error("initial_max_streams_uni exceeds 2^60"));
                    }
                    params.initial_max_streams_uni = value;
                }
                ids::ACK_DELAY_EXPONENT => {
                    let value = decode_varint_param(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values above 20 are invalid.
                    if *value > 20 {
                        return Err(param_error("ack_delay_exponent above 20"));
                    }
                    params.ack_delay_exponent = *value as u8;
                }
                ids::MAX_ACK_DELAY => {
                    let value = decode_varint_param(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# Values of 2^14 or greater are invalid.
                    if *value >= (1 << 14) {
                        return Err(param_error("max_ack_delay too large"));
                    }
                    params.max_ack_delay = value;
                }
                ids::DISABLE_ACTIVE_MIGRATION => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# This parameter is a zero-length value.
                    if !value.is_empty() {
                        return Err(param_error("disable_active_migration carries a value"));
                    }
                    params.disable_active_migration = true;
                }
                ids::PREFERRED_ADDRESS => {
                    params.preferred_address = Some(decode_preferred_address(value)?);
                }
                ids::ACTIVE_CONNECTION_ID_LIMIT => {
                    let value = decode_varint_param(value)?;
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# The value of the active_connection_id_limit parameter MUST
                    //# be at least 2.
                    if *value < 2 {
                        return Err(param_error("active_connection_id_limit below 2"));
                    }
                    params.active_connection_id_limit = value;
                }
                ids::INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(decode_cid_param(value)?);
                }
                ids::RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(decode_cid_param(value)?);
                }
                //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                //# An endpoint MUST ignore transport parameters that it does
                //# not support.
                _ => {}
            }
        }

        Ok(params)
    }
}

fn decode_preferred_address(bytes: &[u8]) -> Result<PreferredAddress, Error> {
    let buffer = DecoderBuffer::new(bytes);

    let (ipv4_bytes, buffer) = buffer
        .decode_slice(4)
        .map_err(|_| param_error("malformed preferred address"))?;
    let (ipv4_port, buffer) = buffer
        .decode::<u16>()
        .map_err(|_| param_error("malformed preferred address"))?;
    let (ipv6_bytes, buffer) = buffer
        .decode_slice(16)
        .map_err(|_| param_error("malformed preferred address"))?;
    let (ipv6_port, buffer) = buffer
        .decode::<u16>()
        .map_err(|_| param_error("malformed preferred address"))?;

    let ipv4_octets: [u8; 4] = ipv4_bytes
        .into_less_safe_slice()
        .try_into()
        .expect("length checked");
    let ipv4 = if ipv4_octets == [0; 4] && ipv4_port == 0 {
        None
    } else {
        Some((Ipv4Addr::from(ipv4_octets), ipv4_port))
    };

    let ipv6_octets: [u8; 16] = ipv6_bytes
        .into_less_safe_slice()
        .try_into()
        .expect("length checked");
    let ipv6 = if ipv6_octets == [0; 16] && ipv6_port == 0 {
        None
    } else {
        Some((Ipv6Addr::from(ipv6_octets), ipv6_port))
    };

    let (cid, buffer) = buffer
        .decode_slice_with_len_prefix::<u8>()
        .map_err(|_| param_error("malformed preferred address"))?;
    let connection_id = decode_cid_param(cid.into_less_safe_slice())?;

    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
    //# Servers that choose to preserve the ability for clients to migrate
    //# MUST include a non-zero-length connection ID in this parameter.
    if connection_id.is_empty() {
        return Err(param_error("preferred address carries an empty connection id"));
    }

    let (token, buffer) = buffer
        .decode_slice(16)
        .map_err(|_| param_error("malformed preferred address"))?;
    buffer
        .ensure_empty()
        .map_err(|_| param_error("trailing bytes in preferred address"))?;

    let stateless_reset_token: [u8; 16] = token
        .into_less_safe_slice()
        .try_into()
        .expect("length checked");

    Ok(PreferredAddress {
        ipv4,
        ipv6,
        connection_id,
        stateless_reset_token,
    })
}

fn encode_param<E: Encoder, V: EncoderValue>(encoder: &mut E, id: u64, value: &V) {
    encoder.encode(&VarInt::new(id).unwrap());
    encoder.encode_with_len_prefix::<VarInt, _>(value);
}

impl EncoderValue for TransportParameters {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let defaults = Self::default();

        if let Some(cid) = &self.original_destination_connection_id {
            encode_param(encoder, ids::ORIGINAL_DESTINATION_CONNECTION_ID, &cid.as_bytes());
        }
        if self.max_idle_timeout != defaults.max_idle_timeout {
            encode_param(encoder, ids::MAX_IDLE_TIMEOUT, &self.max_idle_timeout);
        }
        if let Some(token) = &self.stateless_reset_token {
            encode_param(encoder, ids::STATELESS_RESET_TOKEN, &&token[..]);
        }
        if self.max_udp_payload_size != defaults.max_udp_payload_size {
            encode_param(encoder, ids::MAX_UDP_PAYLOAD_SIZE, &self.max_udp_payload_size);
        }
        if self.initial_max_data != VarInt::ZERO {
            encode_param(encoder, ids::INITIAL_MAX_DATA, &self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != VarInt::ZERO {
            encode_param(
                encoder,
                ids::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                &self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != VarInt::ZERO {
            encode_param(
                encoder,
                ids::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                &self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != VarInt::ZERO {
            encode_param(
                encoder,
                ids::INITIAL_MAX_STREAM_DATA_UNI,
                &self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != VarInt::ZERO {
            encode_param(
                encoder,
                ids::INITIAL_MAX_STREAMS_BIDI,
                &self.initial_max_streams_bidi,
            );
        }
        if self.initial_max_streams_uni != VarInt::ZERO {
            encode_param(
                encoder,
                ids::INITIAL_MAX_STREAMS_UNI,
                &self.initial_max_streams_uni,
            );
        }
        if self.ack_delay_exponent != defaults.ack_delay_exponent {
            encode_param(
                encoder,
                ids::ACK_DELAY_EXPONENT,
                &VarInt::from_u8(self.ack_delay_exponent),
            );
        }
        if self.max_ack_delay != defaults.max_ack_delay {
            encode_param(encoder, ids::MAX_ACK_DELAY, &self.max_ack_delay);
        }
        if self.disable_active_migration {
            encode_param(encoder, ids::DISABLE_ACTIVE_MIGRATION, &());
        }
        if let Some(preferred_address) = &self.preferred_address {
            encode_param(encoder, ids::PREFERRED_ADDRESS, preferred_address);
        }
        if self.active_connection_id_limit != defaults.active_connection_id_limit {
            encode_param(
                encoder,
                ids::ACTIVE_CONNECTION_ID_LIMIT,
                &self.active_connection_id_limit,
            );
        }
        if let Some(cid) = &self.initial_source_connection_id {
            encode_param(encoder, ids::INITIAL_SOURCE_CONNECTION_ID, &cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            encode_param(encoder, ids::RETRY_SOURCE_CONNECTION_ID, &cid.as_bytes());
        }
    }
}

impl EncoderValue for PreferredAddress {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match &self.ipv4 {
            Some((addr, port)) => {
                encoder.write_slice(&addr.octets());
                encoder.encode(port);
            }
            None => encoder.write_repeated(6, 0),
        }
        match &self.ipv6 {
            Some((addr, port)) => {
                encoder.write_slice(&addr.octets());
                encoder.encode(port);
            }
            None => encoder.write_repeated(18, 0),
        }
        encoder.encode_with_len_prefix::<u8, _>(&self.connection_id.as_bytes());
        encoder.write_slice(&self.stateless_reset_token);
    }
}
