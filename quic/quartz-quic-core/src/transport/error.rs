// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use core::fmt;
use quartz_codec::DecoderError;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A transport-level error, carried in CONNECTION_CLOSE (type 0x1c)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: VarInt,

    /// The type of the frame that triggered the error, if attributable
    pub frame_type: Option<VarInt>,

    pub reason: &'static str,
}

impl Error {
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            frame_type: None,
            reason: "",
        }
    }

    #[must_use]
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.8
    //# A TLS alert is converted into a QUIC connection error.  The
    //# AlertDescription value is added to 0x0100 to produce a QUIC error
    //# code from the range reserved for CRYPTO_ERROR.
    pub const fn crypto_error(alert: u8) -> Self {
        Self::new(VarInt::from_u16(0x100 + alert as u16))
    }

    /// Returns true if the code falls in the CRYPTO_ERROR range
    pub fn is_crypto_error(&self) -> bool {
        (0x100..=0x1ff).contains(&self.code.as_u64())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        Self::FRAME_ENCODING_ERROR.with_reason(error.into())
    }
}

impl From<crate::varint::VarIntError> for Error {
    fn from(_: crate::varint::VarIntError) -> Self {
        Self::INTERNAL_ERROR.with_reason("varint range exceeded")
    }
}

/// Internal convenience macro for defining standard error codes
macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: Error = Error::new(VarInt::from_u8($code));
        }
    };
}

def_error!(
    "the connection is being closed abruptly in the absence of any error",
    NO_ERROR,
    0x0
);
def_error!(
    "the endpoint encountered an internal error and cannot continue",
    INTERNAL_ERROR,
    0x1
);
def_error!("the server refused to accept a new connection", CONNECTION_REFUSED, 0x2);
def_error!("received more data than permitted in advertised limits", FLOW_CONTROL_ERROR, 0x3);
def_error!("received a frame for a stream identifier that exceeded advertised limits", STREAM_LIMIT_ERROR, 0x4);
def_error!(
    "received a frame for a stream that was not in a state that permitted that frame",
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    "a stream's final size changed or data arrived past the final size",
    FINAL_SIZE_ERROR,
    0x6
);
def_error!("received a frame that was badly formatted", FRAME_ENCODING_ERROR, 0x7);
def_error!(
    "received transport parameters that were badly formatted, absent, or otherwise in error",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    "the number of connection IDs provided by the peer exceeds the advertised limit",
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);
def_error!("detected an error with protocol compliance", PROTOCOL_VIOLATION, 0xA);
def_error!("received an Initial packet containing an invalid token", INVALID_TOKEN, 0xB);
def_error!("the application or application protocol caused the connection to be closed", APPLICATION_ERROR, 0xC);
def_error!("received more data in CRYPTO frames than can be buffered", CRYPTO_BUFFER_EXCEEDED, 0xD);
def_error!("key update error", KEY_UPDATE_ERROR, 0xE);
def_error!(
    "the endpoint has reached the confidentiality or integrity limit for the AEAD",
    AEAD_LIMIT_REACHED,
    0xF
);
def_error!("no viable network path exists", NO_VIABLE_PATH, 0x10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_range() {
        let error = Error::crypto_error(42);
        assert_eq!(error.code.as_u64(), 0x100 + 42);
        assert!(error.is_crypto_error());
        assert!(!Error::PROTOCOL_VIOLATION.is_crypto_error());
    }

    #[test]
    fn decoder_errors_map_to_frame_encoding() {
        let error: Error = DecoderError::UnexpectedEof(4).into();
        assert_eq!(error.code, Error::FRAME_ENCODING_ERROR.code);
    }
}
