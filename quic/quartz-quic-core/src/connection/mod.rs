// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{transport, varint::VarInt};
use core::fmt;

pub mod id;
pub mod limits;

pub use id::{InitialId, LocalId, PeerId, UnboundedId};
pub use limits::Limits;

/// The reason a connection ended, as seen by the application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The connection was closed cleanly (error code 0)
    Closed,

    /// The transport closed the connection with an error
    Transport(transport::Error),

    /// The peer or local application closed the connection with an
    /// application error code
    Application { error_code: VarInt },

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
    //# If a max_idle_timeout is specified by either endpoint in its
    //# transport parameters, the connection is silently closed and its
    //# state is discarded when it remains idle for longer than the minimum
    //# of the max_idle_timeout value advertised by both endpoints.
    IdleTimeout,

    /// The handshake did not complete in time
    HandshakeTimeout,

    /// A stateless reset from the peer ended the connection
    StatelessReset,

    /// Every known path to the peer stopped validating
    NoValidPath,
}

impl Error {
    /// The error code reported to close callbacks
    pub fn error_code(&self) -> VarInt {
        match self {
            Self::Closed => VarInt::ZERO,
            Self::Transport(error) => error.code,
            Self::Application { error_code } => *error_code,
            Self::IdleTimeout => VarInt::ZERO,
            Self::HandshakeTimeout => transport::Error::CONNECTION_REFUSED.code,
            Self::StatelessReset => transport::Error::INTERNAL_ERROR.code,
            Self::NoValidPath => transport::Error::NO_VIABLE_PATH.code,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Transport(error) => write!(f, "transport error: {error}"),
            Self::Application { error_code } => {
                write!(f, "application error: {error_code}")
            }
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::StatelessReset => write!(f, "stateless reset"),
            Self::NoValidPath => write!(f, "no valid path"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(error: transport::Error) -> Self {
        if error.code == transport::Error::NO_ERROR.code {
            Self::Closed
        } else {
            Self::Transport(error)
        }
    }
}
