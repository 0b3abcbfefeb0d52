//! Little-endian read cursor over a borrowed byte slice.
//!
//! Every decoder in [`crate::parse`] reads through a [`ByteCursor`] instead of
//! indexing the buffer directly, so bounds checking happens in exactly one
//! place and a short buffer always surfaces as [`DecodeError::Truncated`].

use crate::error::DecodeError;

/// Forward-only reader over `&[u8]`.
///
/// ```
/// # use flowstate_rs::cursor::ByteCursor;
/// let mut c = ByteCursor::new("frame", &[0x34, 0x12, 0xff]);
/// assert_eq!(c.read_u16().unwrap(), 0x1234);
/// assert_eq!(c.remaining(), 1);
/// assert!(c.read_u16().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    what: &'static str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// `what` names the record in error messages.
    pub fn new(what: &'static str, data: &'a [u8]) -> Self {
        Self { what, data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail with [`DecodeError::Truncated`] unless `n` more bytes are available.
    ///
    /// The error reports the total length the record would need, which is
    /// what callers log when a notification arrives short.
    pub fn require(&self, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                what: self.what,
                needed: self.pos + n,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.require(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_le_bytes(self.take::<1>()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take::<2>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take::<4>()?))
    }

    /// Borrow the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.require(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consume the cursor, failing if any bytes were left unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes {
                what: self.what,
                extra,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian_fields_in_order() {
        let bytes = [
            0x01, // u8
            0xfe, // i8 = -2
            0x02, 0x01, // u16 = 0x0102
            0x04, 0x03, 0x02, 0x01, // u32 = 0x01020304
            0x00, 0x00, 0x80, 0x3f, // f32 = 1.0
        ];
        let mut c = ByteCursor::new("test", &bytes);
        assert_eq!(c.read_u8().unwrap(), 1);
        assert_eq!(c.read_i8().unwrap(), -2);
        assert_eq!(c.read_u16().unwrap(), 0x0102);
        assert_eq!(c.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(c.read_f32().unwrap(), 1.0);
        assert_eq!(c.position(), bytes.len());
        assert!(c.finish().is_ok());
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let mut c = ByteCursor::new("test", &[0xaa, 0xbb, 0xcc]);
        let err = c.read_u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                what: "test",
                needed: 4,
                got: 3
            }
        );
        assert_eq!(c.position(), 0);
        assert_eq!(c.read_u16().unwrap(), 0xbbaa);
    }

    #[test]
    fn test_finish_reports_trailing_bytes() {
        let mut c = ByteCursor::new("test", &[1, 2, 3]);
        c.read_u8().unwrap();
        assert_eq!(
            c.finish(),
            Err(DecodeError::TrailingBytes {
                what: "test",
                extra: 2
            })
        );
    }

    #[test]
    fn test_read_bytes_borrows_slice() {
        let data = [9u8, 8, 7, 6];
        let mut c = ByteCursor::new("test", &data);
        assert_eq!(c.read_bytes(3).unwrap(), &[9, 8, 7]);
        assert!(c.read_bytes(2).is_err());
        assert_eq!(c.remaining(), 1);
    }

    #[test]
    fn test_empty_buffer_never_panics() {
        let mut c = ByteCursor::new("test", &[]);
        assert!(c.read_u8().is_err());
        assert!(c.read_i8().is_err());
        assert!(c.read_f32().is_err());
        assert!(c.read_bytes(0).unwrap().is_empty());
        assert!(c.finish().is_ok());
    }
}
