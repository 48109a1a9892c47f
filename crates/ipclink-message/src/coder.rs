//! Typed encode/decode traits and impls for the built-in types.
//!
//! Every scalar is little-endian at its natural alignment. Variable-length
//! values carry a `u64` element count first.

use bytes::Bytes;
use ipclink_transport::{Attachment, AttachmentKind, Identifier};

use crate::decoder::Decoder;
use crate::encoder::Encoder;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-size plain values that can be written at their natural alignment.
pub trait Scalar: Copy + sealed::Sealed {
    /// Encoded size, which is also the alignment.
    const SIZE: usize;

    fn write_le(self, out: &mut [u8]);

    /// Returns `None` for byte patterns that are not a valid value.
    fn read_le(bytes: &[u8]) -> Option<Self>;
}

/// Values that can be appended to an [`Encoder`].
pub trait Encode {
    fn encode(self, encoder: &mut Encoder);
}

/// Values that can be read back from a [`Decoder`].
///
/// Returning `None` marks the decoder invalid.
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}

        impl Scalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Option<Self> {
                Some(<$ty>::from_le_bytes(bytes.try_into().ok()?))
            }
        }

        impl Encode for $ty {
            fn encode(self, encoder: &mut Encoder) {
                encoder.encode_object(self);
            }
        }

        impl Decode for $ty {
            fn decode(decoder: &mut Decoder) -> Option<Self> {
                decoder.decode_object()
            }
        }
    )*};
}

impl_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl sealed::Sealed for bool {}

impl Scalar for bool {
    const SIZE: usize = 1;

    fn write_le(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn read_le(bytes: &[u8]) -> Option<Self> {
        match bytes.first()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }
}

impl Encode for bool {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_object(self);
    }
}

impl Decode for bool {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode_object()
    }
}

impl Encode for () {
    fn encode(self, _encoder: &mut Encoder) {}
}

impl Decode for () {
    fn decode(_decoder: &mut Decoder) -> Option<Self> {
        Some(())
    }
}

fn decode_len(decoder: &mut Decoder) -> Option<usize> {
    let len: u64 = decoder.decode_object()?;
    usize::try_from(len).ok()
}

impl Encode for &[u8] {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_object(self.len() as u64);
        encoder.encode_raw(self);
    }
}

impl Encode for Bytes {
    fn encode(self, encoder: &mut Encoder) {
        self.as_ref().encode(encoder);
    }
}

impl Decode for Bytes {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let len = decode_len(decoder)?;
        decoder.decode_raw(len)
    }
}

impl Encode for &str {
    fn encode(self, encoder: &mut Encoder) {
        self.as_bytes().encode(encoder);
    }
}

impl Encode for String {
    fn encode(self, encoder: &mut Encoder) {
        self.as_str().encode(encoder);
    }
}

impl Decode for String {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let bytes: Bytes = decoder.decode()?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

const MAX_ZERO_SIZED_ELEMENTS: usize = 1 << 16;

impl<T: Encode> Encode for Vec<T> {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_object(self.len() as u64);
        for item in self {
            item.encode(encoder);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let len = decode_len(decoder)?;
        // Zero-sized elements occupy no payload, so only a fixed cap applies.
        let limit = if std::mem::size_of::<T>() == 0 {
            MAX_ZERO_SIZED_ELEMENTS
        } else {
            decoder.remaining() + decoder.remaining_attachments()
        };
        if len > limit {
            return None;
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(decoder.decode()?);
        }
        Some(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(self, encoder: &mut Encoder) {
        match self {
            Some(value) => {
                encoder.encode_object(true);
                value.encode(encoder);
            }
            None => {
                encoder.encode_object(false);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        if decoder.decode_object::<bool>()? {
            Some(Some(decoder.decode()?))
        } else {
            Some(None)
        }
    }
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(self, encoder: &mut Encoder) {
                let ($($name,)+) = self;
                $($name.encode(encoder);)+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(decoder: &mut Decoder) -> Option<Self> {
                Some(($(decoder.decode::<$name>()?,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);

impl Encode for Attachment {
    fn encode(self, encoder: &mut Encoder) {
        encoder.add_attachment(self);
    }
}

impl Decode for Attachment {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.take_any_attachment()
    }
}

impl Encode for Identifier {
    fn encode(self, encoder: &mut Encoder) {
        encoder.add_attachment(self.into_attachment());
    }
}

impl Decode for Identifier {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let attachment = decoder.take_attachment(AttachmentKind::Connection)?;
        Identifier::from_attachment(attachment).ok()
    }
}
