// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    recovery::congestion_controller::Algorithm,
    transport::parameters::TransportParameters,
    varint::VarInt,
};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# max_idle_timeout (0x01):  The maximum idle timeout is a value in
//#    milliseconds that is encoded as an integer; see (Section 10.1).

pub const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_DATA_WINDOW: u64 = 10 * 1024 * 1024;
pub const DEFAULT_STREAM_DATA_WINDOW: u64 = 1024 * 1024;
pub const DEFAULT_MAX_OPEN_STREAMS: u64 = 100;
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 3;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_TOKEN_LIFETIME: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_KEY_ROTATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-connection resource limits and tunables.
///
/// The values mirror what ends up in this endpoint's transport
/// parameters, plus local policy that never goes on the wire.
#[derive(Clone, Debug)]
pub struct Limits {
    pub max_idle_timeout: Duration,
    pub handshake_timeout: Duration,

    /// Connection-level receive window
    pub data_window: u64,

    /// Initial per-stream receive window
    pub stream_data_window: u64,

    pub max_open_remote_bidirectional_streams: u64,
    pub max_open_remote_unidirectional_streams: u64,

    pub max_ack_delay: Duration,
    pub ack_delay_exponent: u8,

    pub active_connection_id_limit: u64,

    /// Upper bound for outgoing UDP payloads
    pub max_udp_payload_size: u16,

    pub disable_active_migration: bool,

    /// Congestion controller algorithm for new paths
    pub congestion_controller: Algorithm,

    /// Send PING when the connection has been quiet this long
    pub keep_alive_period: Option<Duration>,

    /// Zero the ECN codepoint on both directions
    pub ecn_disabled: bool,

    pub retry_token_lifetime: Duration,
    pub retry_key_rotation: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_idle_timeout: DEFAULT_MAX_IDLE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            data_window: DEFAULT_DATA_WINDOW,
            stream_data_window: DEFAULT_STREAM_DATA_WINDOW,
            max_open_remote_bidirectional_streams: DEFAULT_MAX_OPEN_STREAMS,
            max_open_remote_unidirectional_streams: DEFAULT_MAX_OPEN_STREAMS,
            max_ack_delay: crate::ack::DEFAULT_MAX_ACK_DELAY,
            ack_delay_exponent: crate::ack::DEFAULT_ACK_DELAY_EXPONENT,
            active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
            max_udp_payload_size: 1472,
            disable_active_migration: false,
            congestion_controller: Algorithm::default(),
            keep_alive_period: None,
            ecn_disabled: false,
            retry_token_lifetime: DEFAULT_RETRY_TOKEN_LIFETIME,
            retry_key_rotation: DEFAULT_RETRY_KEY_ROTATION,
        }
    }
}

macro_rules! with {
    ($(#[doc = $doc:expr])* $name:ident, $field:ident, $ty:ty) => {
        $(#[doc = $doc])*
        #[must_use]
        pub fn $name(mut self, value: $ty) -> Self {
            self.$field = value;
            self
        }
    };
}

impl Limits {
    with!(with_max_idle_timeout, max_idle_timeout, Duration);
    with!(with_handshake_timeout, handshake_timeout, Duration);
    with!(with_data_window, data_window, u64);
    with!(with_stream_data_window, stream_data_window, u64);
    with!(
        with_max_open_remote_bidirectional_streams,
        max_open_remote_bidirectional_streams,
        u64
    );
    with!(
        with_max_open_remote_unidirectional_streams,
        max_open_remote_unidirectional_streams,
        u64
    );
    with!(with_max_ack_delay, max_ack_delay, Duration);
    with!(
        with_active_connection_id_limit,
        active_connection_id_limit,
        u64
    );
    with!(with_max_udp_payload_size, max_udp_payload_size, u16);
    with!(with_disable_active_migration, disable_active_migration, bool);
    with!(with_congestion_controller, congestion_controller, Algorithm);
    with!(with_keep_alive_period, keep_alive_period, Option<Duration>);
    with!(with_ecn_disabled, ecn_disabled, bool);
    with!(with_retry_token_lifetime, retry_token_lifetime, Duration);

    /// The transport parameters these limits advertise.
    ///
    /// Connection IDs and the stateless reset token are filled in by the
    /// connection once they are known.
    pub fn transport_parameters(&self) -> TransportParameters {
        let varint = |value: u64| VarInt::new(value).unwrap_or(VarInt::MAX);

        TransportParameters {
            max_idle_timeout: varint(self.max_idle_timeout.as_millis() as u64),
            max_udp_payload_size: varint(self.max_udp_payload_size.max(1200) as u64),
            initial_max_data: varint(self.data_window),
            initial_max_stream_data_bidi_local: varint(self.stream_data_window),
            initial_max_stream_data_bidi_remote: varint(self.stream_data_window),
            initial_max_stream_data_uni: varint(self.stream_data_window),
            initial_max_streams_bidi: varint(self.max_open_remote_bidirectional_streams),
            initial_max_streams_uni: varint(self.max_open_remote_unidirectional_streams),
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: varint(self.max_ack_delay.as_millis() as u64),
            disable_active_migration: self.disable_active_migration,
            active_connection_id_limit: varint(self.active_connection_id_limit.max(2)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let limits = Limits::default()
            .with_data_window(1 << 20)
            .with_max_idle_timeout(Duration::from_secs(5))
            .with_active_connection_id_limit(4);

        assert_eq!(limits.data_window, 1 << 20);
        assert_eq!(limits.max_idle_timeout, Duration::from_secs(5));

        let params = limits.transport_parameters();
        assert_eq!(params.initial_max_data.as_u64(), 1 << 20);
        assert_eq!(params.max_idle_timeout.as_u64(), 5000);
        assert_eq!(params.active_connection_id_limit.as_u64(), 4);
    }
}
