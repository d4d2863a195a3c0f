//! Variable-length integer codec used by the segment file format.

use std::fmt;

/// Append `value` as a LEB128 varint: seven bits per byte, low bits first,
/// high bit set on every byte but the last
pub fn encode_varint_u64(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push(value as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn encode_varint(value: u32, buf: &mut Vec<u8>) {
    encode_varint_u64(value.into(), buf);
}

/// Read a varint from the front of `buf`, returning the value and the
/// number of bytes it took. `None` if it is truncated or overflows.
pub fn decode_varint_u64(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        let bits = u64::from(byte & 0x7f);
        if i == 9 && bits > 1 {
            return None;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

pub fn decode_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let (value, len) = decode_varint_u64(buf)?;
    Some((u32::try_from(value).ok()?, len))
}

/// Encode a length-prefixed UTF-8 string
pub fn encode_str(value: &str, buf: &mut Vec<u8>) {
    encode_varint(value.len() as u32, buf);
    buf.extend_from_slice(value.as_bytes());
}

/// Decoding ran past the end of the buffer or hit malformed data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub offset: usize,
    pub what: &'static str,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed {} at byte {}", self.what, self.offset)
    }
}

impl std::error::Error for DecodeError {}

/// Cursor over an encoded buffer
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn err(&self, what: &'static str) -> DecodeError {
        DecodeError {
            offset: self.pos,
            what,
        }
    }

    pub fn bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or_else(|| self.err(what))?;
        if end > self.buf.len() {
            return Err(self.err(what));
        }
        let buf = self.buf;
        let slice = &buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn varint(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let (value, consumed) = decode_varint(&self.buf[self.pos..]).ok_or_else(|| self.err(what))?;
        self.pos += consumed;
        Ok(value)
    }

    pub fn varint_u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        let (value, consumed) =
            decode_varint_u64(&self.buf[self.pos..]).ok_or_else(|| self.err(what))?;
        self.pos += consumed;
        Ok(value)
    }

    pub fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let len = self.varint(what)? as usize;
        let start = self.pos;
        let bytes = self.bytes(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError { offset: start, what })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths_and_limits() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, [0xac, 0x02]);
        assert_eq!(decode_varint(&buf), Some((300, 2)));

        let mut buf = Vec::new();
        encode_varint_u64(u64::MAX, &mut buf);
        assert_eq!(buf.len(), 10);
        assert_eq!(decode_varint_u64(&buf), Some((u64::MAX, 10)));
        // Fits u64 but not u32
        assert_eq!(decode_varint(&buf), None);

        assert_eq!(decode_varint(&[0x80, 0x80]), None);
        assert_eq!(decode_varint_u64(&[0xff; 11]), None);
    }

    #[test]
    fn test_decoder_reports_truncation() {
        let mut buf = Vec::new();
        encode_str("Galicia", &mut buf);
        buf.truncate(4);

        let mut decoder = Decoder::new(&buf);
        let err = decoder.string("layer name").unwrap_err();
        assert_eq!(err.what, "layer name");
        assert_eq!(err.offset, 1);
    }
}
