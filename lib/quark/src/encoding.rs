use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len().saturating_sub(self.position() as usize)
    }
}

/// Number of bytes a compact size prefix occupies for the given value.
#[inline]
pub const fn compact_size_len(value: u64) -> usize {
    if value < 253 {
        1
    } else if value <= u16::MAX as u64 {
        3
    } else if value <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

/// Writes a compact size prefix. Values below 253 take a single byte; larger
/// values are marked with 253/254/255 followed by the big-endian integer.
pub fn write_compact_size<W: io::Write>(stream: &mut W, value: u64) -> io::Result<()> {
    if value < 253 {
        stream.write_u8(value as u8)
    } else if value <= u16::MAX as u64 {
        stream.write_u8(253)?;
        stream.write_u16::<BigEndian>(value as u16)
    } else if value <= u32::MAX as u64 {
        stream.write_u8(254)?;
        stream.write_u32::<BigEndian>(value as u32)
    } else {
        stream.write_u8(255)?;
        stream.write_u64::<BigEndian>(value)
    }
}

/// Reads a compact size prefix, rejecting values above `max` or beyond the
/// remaining data in the stream.
pub fn read_compact_size<R: SizedRead>(stream: &mut R, max: u64) -> io::Result<u64> {
    let marker = stream.read_u8()?;

    let value = match marker {
        253 => u64::from(stream.read_u16::<BigEndian>()?),
        254 => u64::from(stream.read_u32::<BigEndian>()?),
        255 => stream.read_u64::<BigEndian>()?,
        byte => u64::from(byte),
    };

    if value > max || value > stream.remaining_data() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compact size out of bounds",
        ));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(value: u64) -> (usize, u64) {
        let mut buffer = Vec::new();
        write_compact_size(&mut buffer, value).unwrap();

        let written = buffer.len();

        // Append payload bytes so the bounds check passes
        buffer.resize(written + value as usize, 0);

        let mut cursor = Cursor::new(&buffer[..]);
        (written, read_compact_size(&mut cursor, u64::MAX).unwrap())
    }

    #[test]
    fn test_compact_size_boundaries() {
        assert_eq!(compact_size_len(u32::MAX as u64), 5);
        assert_eq!(compact_size_len(u64::MAX), 9);

        for &(value, expected_len) in &[(0u64, 1usize), (252, 1), (253, 3), (65535, 3), (65536, 5)] {
            let (written, read) = roundtrip(value);
            assert_eq!(written, expected_len);
            assert_eq!(written, compact_size_len(value));
            assert_eq!(read, value);
        }
    }

    #[test]
    fn test_read_rejects_value_above_max() {
        let mut buffer = Vec::new();
        write_compact_size(&mut buffer, 300).unwrap();
        buffer.resize(buffer.len() + 300, 0);

        let mut cursor = Cursor::new(&buffer[..]);
        assert!(read_compact_size(&mut cursor, 299).is_err());
    }

    #[test]
    fn test_read_rejects_truncated_payload() {
        let mut buffer = Vec::new();
        write_compact_size(&mut buffer, 10).unwrap();
        buffer.extend_from_slice(&[0u8; 5]);

        let mut cursor = Cursor::new(&buffer[..]);
        assert!(read_compact_size(&mut cursor, u64::MAX).is_err());
    }
}
