// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use core::time::Duration;

pub mod ranges;
pub use ranges::AckRanges;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# ack_delay_exponent (0x0a):  The acknowledgment delay exponent is an
//#    integer value indicating an exponent used to decode the ACK Delay
//#    field in the ACK frame (Section 19.3).  If this value is absent, a
//#    default value of 3 is assumed (indicating a multiplier of 8).

pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# max_ack_delay (0x0b):  The maximum acknowledgment delay is an integer
//#    value indicating the maximum amount of time in milliseconds by
//#    which the endpoint will delay sending acknowledgments.

pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// ACK generation parameters, negotiated through transport parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// The maximum time we may delay an acknowledgement
    pub max_ack_delay: Duration,

    /// The exponent applied to the ACK Delay field on this connection
    pub ack_delay_exponent: u8,

    /// Number of ack-eliciting packets that force an immediate ACK
    pub ack_elicitation_interval: u8,

    /// Maximum number of ranges retained per packet number space
    pub ack_ranges_limit: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.2
            //# A receiver SHOULD send an ACK frame after receiving at least two
            //# ack-eliciting packets.
            ack_elicitation_interval: 2,
            ack_ranges_limit: 10,
        }
    }
}

impl Settings {
    /// Encodes a measured delay into the ACK Delay field scale
    #[inline]
    pub fn encode_ack_delay(&self, delay: Duration) -> VarInt {
        let micros = delay.as_micros() as u64;
        VarInt::new(micros >> self.ack_delay_exponent).unwrap_or(VarInt::MAX)
    }

    /// Decodes an ACK Delay field into a duration, using the peer's exponent
    #[inline]
    pub fn decode_ack_delay(&self, value: VarInt) -> Duration {
        Duration::from_micros(value.as_u64() << self.ack_delay_exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_delay_round_trip() {
        let settings = Settings::default();
        let delay = Duration::from_micros(1000);
        let encoded = settings.encode_ack_delay(delay);
        assert_eq!(encoded.as_u64(), 125);
        assert_eq!(settings.decode_ack_delay(encoded), delay);
    }

    #[test]
    fn ack_delay_truncates_sub_exponent_precision() {
        let settings = Settings::default();
        let delay = Duration::from_micros(1001);
        let decoded = settings.decode_ack_delay(settings.encode_ack_delay(delay));
        assert_eq!(decoded, Duration::from_micros(1000));
    }
}
