// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::decoder::{
    value::{DecoderParameterizedValueMut, DecoderValueMut},
    DecoderError,
};

/// DecoderBufferMut is a panic-free, mutable view over a byte slice
#[derive(Debug, PartialEq, Eq)]
pub struct DecoderBufferMut<'a> {
    bytes: &'a mut [u8],
}

pub type DecoderBufferMutResult<'a, T> = Result<(T, DecoderBufferMut<'a>), DecoderError>;

impl<'a> DecoderBufferMut<'a> {
    /// Create a new `DecoderBufferMut` from a mutable byte slice
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Freeze the mutable view into an immutable `DecoderBuffer`
    #[inline]
    pub fn freeze(self) -> crate::DecoderBuffer<'a> {
        crate::DecoderBuffer::new(self.bytes)
    }

    /// Move out of this buffer into the inner byte slice
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a mut [u8] {
        self.bytes
    }

    /// Mutably borrows the buffer's slice. The caller takes over bounds handling.
    #[inline]
    pub fn as_less_safe_slice_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

impl_buffer!(
    DecoderBufferMut,
    DecoderBufferMutResult,
    DecoderValueMut,
    decode_mut,
    DecoderParameterizedValueMut,
    decode_parameterized_mut,
    split_at_mut
);

impl<'a> From<&'a mut [u8]> for DecoderBufferMut<'a> {
    #[inline]
    fn from(bytes: &'a mut [u8]) -> Self {
        Self::new(bytes)
    }
}
