//! Generic binary serialization primitives.
//!
//! Numbers are written in native byte order with `size_of::<T>()` bytes,
//! byte strings and vectors carry a u64 length prefix and raw contents with
//! no escaping. This is deliberately not portable across hosts with
//! differing endianness or word size; client and daemon always share one
//! host, which is the constraint the format trades on.
//!
//! Decoding is bounds-checked everywhere: a length prefix that points past
//! the remaining buffer fails with [`WardError::Codec`] instead of reading
//! out of bounds.

use crate::error::{Result, WardError};
use bytes::{BufMut, BytesMut};

/// Append-only output buffer for the binary codec.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }
}

/// Cursor over an input buffer. All reads are bounds-checked.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Take exactly `n` bytes or fail without advancing.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(WardError::Codec(format!(
                "need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

/// Value that can be written to an [`Encoder`].
pub trait Encode {
    fn encode(&self, enc: &mut Encoder);
}

/// Value that can be read back from a [`Decoder`].
pub trait Decode: Sized {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;
}

macro_rules! impl_numeric_codec {
    ($($ty:ty),+) => {$(
        impl Encode for $ty {
            fn encode(&self, enc: &mut Encoder) {
                enc.put_raw(&self.to_ne_bytes());
            }
        }

        impl Decode for $ty {
            fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
                const N: usize = std::mem::size_of::<$ty>();
                let raw = dec.take(N)?;
                let mut arr = [0u8; N];
                arr.copy_from_slice(raw);
                Ok(<$ty>::from_ne_bytes(arr))
            }
        }
    )+};
}

impl_numeric_codec!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Encode for bool {
    fn encode(&self, enc: &mut Encoder) {
        (*self as u8).encode(enc);
    }
}

impl Decode for bool {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(u8::decode(dec)? != 0)
    }
}

/// Byte strings: u64 length prefix, raw contents.
impl Encode for [u8] {
    fn encode(&self, enc: &mut Encoder) {
        (self.len() as u64).encode(enc);
        enc.put_raw(self);
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, enc: &mut Encoder) {
        self.as_slice().encode(enc);
    }
}

impl Decode for Vec<u8> {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = u64::decode(dec)? as usize;
        Ok(dec.take(len)?.to_vec())
    }
}

/// Text strings share the byte-string layout; decoding validates UTF-8.
impl Encode for str {
    fn encode(&self, enc: &mut Encoder) {
        self.as_bytes().encode(enc);
    }
}

impl Encode for String {
    fn encode(&self, enc: &mut Encoder) {
        self.as_str().encode(enc);
    }
}

impl Decode for String {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let raw = Vec::<u8>::decode(dec)?;
        String::from_utf8(raw).map_err(|e| WardError::Codec(format!("invalid utf-8: {e}")))
    }
}

/// Element sequences: u64 count prefix, encoded elements.
///
/// `Vec<u8>` is the byte-string case above, not this one; the blanket impl
/// is written out per element type to keep the two layouts from colliding.
macro_rules! impl_vec_codec {
    ($($ty:ty),+) => {$(
        impl Encode for Vec<$ty> {
            fn encode(&self, enc: &mut Encoder) {
                (self.len() as u64).encode(enc);
                for item in self {
                    item.encode(enc);
                }
            }
        }

        impl Decode for Vec<$ty> {
            fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
                let count = u64::decode(dec)? as usize;
                // One element needs at least one byte; a count beyond the
                // remaining buffer is malformed input, not an allocation hint.
                if count > dec.remaining() {
                    return Err(WardError::Codec(format!(
                        "element count {} exceeds {} remaining bytes",
                        count,
                        dec.remaining()
                    )));
                }
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(<$ty>::decode(dec)?);
                }
                Ok(out)
            }
        }
    )+};
}

impl_vec_codec!(u64, i64, i32, f64, String);

/// Encoded element vectors whose elements are themselves length-prefixed
/// byte strings (the wire payload shape).
impl Encode for Vec<Vec<u8>> {
    fn encode(&self, enc: &mut Encoder) {
        (self.len() as u64).encode(enc);
        for item in self {
            item.encode(enc);
        }
    }
}

impl Decode for Vec<Vec<u8>> {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let count = u64::decode(dec)? as usize;
        if count > dec.remaining() {
            return Err(WardError::Codec(format!(
                "element count {} exceeds {} remaining bytes",
                count,
                dec.remaining()
            )));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(Vec::<u8>::decode(dec)?);
        }
        Ok(out)
    }
}

/// Encode a value into a fresh byte buffer.
pub fn encode_to_vec<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut enc = Encoder::new();
    value.encode(&mut enc);
    enc.into_bytes()
}

/// Decode a value that must consume the whole buffer.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<T> {
    let mut dec = Decoder::new(buf);
    let value = T::decode(&mut dec)?;
    if !dec.is_exhausted() {
        return Err(WardError::Codec(format!(
            "{} trailing bytes after value",
            dec.remaining()
        )));
    }
    Ok(value)
}
