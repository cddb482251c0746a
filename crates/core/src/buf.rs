//! Minimal buffer reader/writer traits used by the journal record codec.
//!
//! All multibyte integers are little-endian. Readers borrow from the
//! underlying buffer, so decoded slices are zero-copy.

use thiserror::Error;

/// Error returned when decoding from a [`BufReader`] runs off the end of the
/// buffer or meets a value outside its domain.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer: wanted {wanted} bytes, {remaining} remain")]
    BufferLength { wanted: usize, remaining: usize },
    #[error("invalid tag {value:#06x} for {ty}")]
    InvalidTag { value: u16, ty: &'static str },
}

/// A sink for encoded bytes.
pub trait BufWriter {
    fn put_slice(&mut self, slice: &[u8]);

    fn put_u8(&mut self, val: u8) {
        self.put_slice(&[val]);
    }

    fn put_u16(&mut self, val: u16) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_u32(&mut self, val: u32) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_u64(&mut self, val: u64) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_i64(&mut self, val: i64) {
        self.put_slice(&val.to_le_bytes());
    }
}

impl BufWriter for Vec<u8> {
    fn put_slice(&mut self, slice: &[u8]) {
        self.extend_from_slice(slice);
    }
}

/// A source of encoded bytes borrowed from a buffer of lifetime `'a`.
pub trait BufReader<'a> {
    /// Take the next `size` bytes, advancing the read position.
    fn get_slice(&mut self, size: usize) -> Result<&'a [u8], DecodeError>;

    /// Bytes not yet consumed.
    fn remaining(&self) -> usize;

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.get_slice(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Ok(arr)
    }

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.get_array().map(u8::from_le_bytes)
    }

    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        self.get_array().map(u16::from_le_bytes)
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.get_array().map(u32::from_le_bytes)
    }

    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.get_array().map(u64::from_le_bytes)
    }

    fn get_i64(&mut self) -> Result<i64, DecodeError> {
        self.get_array().map(i64::from_le_bytes)
    }
}

impl<'a> BufReader<'a> for &'a [u8] {
    fn get_slice(&mut self, size: usize) -> Result<&'a [u8], DecodeError> {
        if self.len() < size {
            return Err(DecodeError::BufferLength {
                wanted: size,
                remaining: self.len(),
            });
        }
        let (taken, rest) = self.split_at(size);
        *self = rest;
        Ok(taken)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_roundtrip_little_endian() {
        let mut buf = Vec::new();
        buf.put_u8(0xab);
        buf.put_u16(0x1234);
        buf.put_u32(0xdead_beef);
        buf.put_u64(0x0102_0304_0506_0708);
        buf.put_i64(-42);

        assert_eq!(&buf[1..3], &[0x34, 0x12]);

        let mut reader = buf.as_slice();
        assert_eq!(reader.get_u8().unwrap(), 0xab);
        assert_eq!(reader.get_u16().unwrap(), 0x1234);
        assert_eq!(reader.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.get_i64().unwrap(), -42);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn short_buffer_reports_lengths() {
        let mut reader: &[u8] = &[1, 2, 3];
        assert_eq!(
            reader.get_u32(),
            Err(DecodeError::BufferLength { wanted: 4, remaining: 3 })
        );
    }
}
