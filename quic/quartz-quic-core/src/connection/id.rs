// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection identifiers.
//!
//! Distinct newtypes keep locally-issued, peer-issued and
//! handshake-original IDs from being mixed up; `UnboundedId` is the
//! escape hatch for wire material that has not been classified yet.

//= https://www.rfc-editor.org/rfc/rfc9000#section-5.1
//# Each connection possesses a set of connection identifiers, or
//# connection IDs, each of which can identify the connection.
//# Connection IDs are independently selected by endpoints; each endpoint
//# selects the connection IDs that its peer uses.

/// The maximum size of a connection ID in QUIC v1
pub const MAX_LEN: usize = crate::packet::DESTINATION_CONNECTION_ID_MAX_LEN;

macro_rules! id {
    ($type:ident, $min_len:expr) => {
        /// Uniquely identifies a QUIC connection between two peers
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $type {
            bytes: [u8; MAX_LEN],
            len: u8,
        }

        impl core::fmt::Debug for $type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:?})", stringify!($type), self.as_bytes())
            }
        }

        impl $type {
            /// The minimum length for this connection ID type
            pub const MIN_LEN: usize = $min_len;

            /// Creates a connection ID from a byte slice.
            ///
            /// Returns `None` when the slice is outside the permitted
            /// length range for this ID type.
            #[inline]
            pub fn try_from_bytes(slice: &[u8]) -> Option<$type> {
                if slice.len() < $min_len || slice.len() > MAX_LEN {
                    return None;
                }

                let mut bytes = [0u8; MAX_LEN];
                bytes[..slice.len()].copy_from_slice(slice);

                Some($type {
                    bytes,
                    len: slice.len() as u8,
                })
            }

            /// Returns the connection ID in byte form
            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                &self.bytes[..self.len as usize]
            }

            #[inline]
            pub const fn len(&self) -> usize {
                self.len as usize
            }

            #[inline]
            pub const fn is_empty(&self) -> bool {
                self.len == 0
            }
        }

        impl AsRef<[u8]> for $type {
            #[inline]
            fn as_ref(&self) -> &[u8] {
                self.as_bytes()
            }
        }

        impl<'a> TryFrom<&'a [u8]> for $type {
            type Error = ();

            #[inline]
            fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
                Self::try_from_bytes(slice).ok_or(())
            }
        }
    };
}

// IDs this endpoint issued; routable, so they carry a minimum of
// entropy
id!(LocalId, 4);

// IDs the peer told us to send with; the peer may use zero-length IDs
id!(PeerId, 0);

//= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
//# When an Initial packet is sent by a client that has not previously
//# received an Initial or Retry packet from the server, the client
//# populates the Destination Connection ID field with an unpredictable
//# value.  This Destination Connection ID MUST be at least 8 bytes in
//# length.
id!(InitialId, 8);

// Wire material not yet classified (transport parameters, config)
id!(UnboundedId, 0);

impl From<LocalId> for UnboundedId {
    fn from(id: LocalId) -> Self {
        Self::try_from_bytes(id.as_bytes()).expect("lengths are compatible")
    }
}

impl From<InitialId> for UnboundedId {
    fn from(id: InitialId) -> Self {
        Self::try_from_bytes(id.as_bytes()).expect("lengths are compatible")
    }
}

impl From<PeerId> for UnboundedId {
    fn from(id: PeerId) -> Self {
        Self::try_from_bytes(id.as_bytes()).expect("lengths are compatible")
    }
}

impl From<InitialId> for PeerId {
    fn from(id: InitialId) -> Self {
        Self::try_from_bytes(id.as_bytes()).expect("lengths are compatible")
    }
}
