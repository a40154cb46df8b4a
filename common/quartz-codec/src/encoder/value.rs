// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    encoder::{Encoder, EncoderLenEstimator},
    DecoderBuffer, DecoderBufferMut,
};
use byteorder::{ByteOrder, NetworkEndian};
use core::mem::size_of;

pub trait EncoderValue: Sized {
    /// Encodes the value into the encoder
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// Encodes the value into the encoder, while potentially mutating the value itself
    #[inline]
    fn encode_mut<E: Encoder>(&mut self, encoder: &mut E) {
        self.encode(encoder)
    }

    /// Returns the encoding size with no buffer constraints
    #[inline]
    fn encoding_size(&self) -> usize {
        self.encoding_size_for_encoder(&EncoderLenEstimator::new(usize::MAX))
    }

    /// Returns the encoding size for the given encoder's capacity
    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, encoder: &E) -> usize {
        let mut estimator = EncoderLenEstimator::new(encoder.remaining_capacity());
        self.encode(&mut estimator);
        estimator.len()
    }

    /// Encodes the value into the encoder with a prefix of `Len`
    #[inline]
    fn encode_with_len_prefix<Len: TryFrom<usize> + EncoderValue, E: Encoder>(
        &self,
        encoder: &mut E,
    ) where
        Self: Sized,
        Len::Error: core::fmt::Debug,
    {
        let len = self.encoding_size_for_encoder(encoder);
        let len: Len = Len::try_from(len).expect("invalid conversion");
        len.encode(encoder);
        self.encode(encoder);
    }

    #[cfg(feature = "alloc")]
    fn encode_to_vec(&self) -> alloc::vec::Vec<u8> {
        let len = self.encoding_size();
        let mut buffer = alloc::vec![0u8; len];
        self.encode(&mut crate::EncoderBuffer::new(&mut buffer));
        buffer
    }
}

impl EncoderValue for u8 {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_sized(1, |buf| buf[0] = *self)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        1
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        1
    }
}

// fixed-width integers are always network byte order on the wire
macro_rules! encoder_value_integer {
    ($($write:ident => $ty:ty),* $(,)?) => {
        $(
            impl EncoderValue for $ty {
                #[inline]
                fn encode<E: Encoder>(&self, encoder: &mut E) {
                    encoder.write_sized(size_of::<Self>(), |buf| {
                        NetworkEndian::$write(buf, *self);
                    })
                }

                #[inline]
                fn encoding_size(&self) -> usize {
                    size_of::<Self>()
                }

                #[inline]
                fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
                    size_of::<Self>()
                }
            }
        )*
    };
}

encoder_value_integer!(write_u16 => u16, write_u32 => u32, write_u64 => u64);

impl EncoderValue for () {
    #[inline]
    fn encode<E: Encoder>(&self, _encoder: &mut E) {}
}

impl<T: EncoderValue> EncoderValue for Option<T> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        if let Some(value) = self {
            value.encode(encoder);
        }
    }
}

impl<'a, T: EncoderValue> EncoderValue for &'a T {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        (*self).encode(encoder)
    }
}

macro_rules! encoder_value_slice {
    ($($ty:ty),* $(,)?) => {
        $(
            impl<'a> EncoderValue for $ty {
                #[inline]
                fn encode<E: Encoder>(&self, encoder: &mut E) {
                    encoder.write_slice(self)
                }

                #[inline]
                fn encoding_size(&self) -> usize {
                    self.len()
                }

                #[inline]
                fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
                    self.len()
                }
            }
        )*
    };
}

encoder_value_slice!(&'a [u8], &'a mut [u8]);

impl<'a> EncoderValue for DecoderBuffer<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.peek().into_less_safe_slice())
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.len()
    }
}

impl<'a> EncoderValue for DecoderBufferMut<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.peek().into_less_safe_slice())
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.len()
    }
}

#[cfg(feature = "bytes")]
impl EncoderValue for bytes::Bytes {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.as_ref())
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DecoderBuffer, EncoderBuffer};

    #[test]
    fn round_trip_integers() {
        let mut storage = [0u8; 15];
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode(&0x12u8);
        encoder.encode(&0x1234u16);
        encoder.encode(&0x1234_5678u32);
        encoder.encode(&0x1234_5678_9abc_def0u64);
        assert_eq!(encoder.len(), 15);

        let buffer = DecoderBuffer::new(&storage);
        let (a, buffer) = buffer.decode::<u8>().unwrap();
        let (b, buffer) = buffer.decode::<u16>().unwrap();
        let (c, buffer) = buffer.decode::<u32>().unwrap();
        let (d, buffer) = buffer.decode::<u64>().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(a, 0x12);
        assert_eq!(b, 0x1234);
        assert_eq!(c, 0x1234_5678);
        assert_eq!(d, 0x1234_5678_9abc_def0);
    }

    #[test]
    fn len_prefix_round_trip() {
        let mut storage = [0u8; 6];
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode_with_len_prefix::<u8, _>(&0x1234_5678u32);
        assert_eq!(&storage[..5], &[4, 0x12, 0x34, 0x56, 0x78]);

        let buffer = DecoderBuffer::new(&storage[..5]);
        let (value, buffer) = buffer.decode_with_len_prefix::<u8, u32>().unwrap();
        assert_eq!(value, 0x1234_5678);
        assert!(buffer.is_empty());
    }

    #[test]
    fn estimator_matches_buffer() {
        let mut storage = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut storage);
        let value = 0xdead_beefu32;
        encoder.encode(&value);
        let len = encoder.len();
        assert_eq!(len, value.encoding_size());
    }
}
