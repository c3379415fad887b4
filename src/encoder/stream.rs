use crate::encoder::buffer::Buffer;
use crate::{Error, Result};

/// Bit-level output stream producing FAST transfer encodings into a byte sink.
///
/// Integers are written base-128 big-endian, seven data bits per byte, with the stop
/// bit (bit 7) set on the final byte. Nullable encodings shift non-negative values by
/// +1 so that the single byte `0x80` always means null.
pub(crate) struct OutputStream<'a> {
    buf: &'a mut dyn Buffer,
    pub(crate) allow_overlong_pmap: bool,
}

impl<'a> OutputStream<'a> {
    pub(crate) fn new(buf: &'a mut dyn Buffer, allow_overlong_pmap: bool) -> Self {
        Self {
            buf,
            allow_overlong_pmap,
        }
    }

    /// Reserve room for a presence map, returning the offset of the reserved region.
    pub(crate) fn reserve(&mut self, count: usize) -> Result<usize> {
        self.buf.grow(count)
    }

    pub(crate) fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.buf.patch(offset, bytes);
    }

    pub(crate) fn collapse(&mut self, offset: usize, count: usize) {
        self.buf.collapse(offset, count);
    }

    pub(crate) fn write_uint(&mut self, value: u64) -> Result<()> {
        let mut value = value;
        let mut buf: Vec<u8> = Vec::with_capacity(10);
        buf.push(((value & 0x7f) as u8) | 0x80);
        loop {
            value >>= 7;
            if value == 0 {
                break;
            }
            buf.push((value & 0x7f) as u8);
        }
        buf.reverse();
        self.buf.write_buf(&buf)
    }

    pub(crate) fn write_uint_nullable(&mut self, value: Option<u64>) -> Result<()> {
        match value {
            None => self.write_uint(0),
            Some(v) => {
                let v = v.checked_add(1).ok_or_else(|| {
                    Error::Runtime("nullable uInt64 value has no representation for u64::MAX".to_string())
                })?;
                self.write_uint(v)
            }
        }
    }

    pub(crate) fn write_int(&mut self, value: i64) -> Result<()> {
        let is_pos = value >= 0;
        let mut buf: Vec<u8> = Vec::with_capacity(10);
        let mut value = value;
        loop {
            let b7 = (value & 0x7f) as u8;
            buf.push(b7);
            value >>= 7;
            if is_pos {
                // stop condition for positive numbers
                if value == 0 && (b7 & 0x40 == 0) {
                    break;
                }
            } else {
                // stop condition for negative numbers
                if value == -1 && (b7 & 0x40 != 0) {
                    break;
                }
            }
        }
        // set stop bit
        buf[0] |= 0x80;

        buf.reverse();
        self.buf.write_buf(&buf)
    }

    pub(crate) fn write_int_nullable(&mut self, value: Option<i64>) -> Result<()> {
        match value {
            None => self.write_int(0),
            Some(v) if v >= 0 => self.write_int(v + 1),
            Some(v) => self.write_int(v),
        }
    }

    pub(crate) fn write_ascii_string(&mut self, value: &str) -> Result<()> {
        if value.is_empty() {
            self.buf.write_u8(0x80)
        } else {
            self.write_ascii_payload(value)
        }
    }

    pub(crate) fn write_ascii_string_nullable(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            None => self.buf.write_u8(0x80),
            Some(s) => {
                if s.is_empty() {
                    self.buf.write_buf(&[0x00, 0x80])
                } else {
                    self.write_ascii_payload(s)
                }
            }
        }
    }

    fn write_ascii_payload(&mut self, value: &str) -> Result<()> {
        let mut buf = value
            .chars()
            .map(|ch| if ch.is_ascii() { Some(ch as u8) } else { None })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Runtime("write_ascii_string: invalid ASCII char".to_string()))?;
        *buf.last_mut().unwrap() |= 0x80;
        self.buf.write_buf(&buf)
    }

    pub(crate) fn write_unicode_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    pub(crate) fn write_unicode_string_nullable(&mut self, value: Option<&str>) -> Result<()> {
        self.write_bytes_nullable(value.map(str::as_bytes))
    }

    pub(crate) fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_uint(value.len() as u64)?;
        self.buf.write_buf(value)
    }

    pub(crate) fn write_bytes_nullable(&mut self, value: Option<&[u8]>) -> Result<()> {
        match value {
            None => self.write_uint_nullable(None),
            Some(b) => {
                self.write_uint_nullable(Some(b.len() as u64))?;
                self.buf.write_buf(b)
            }
        }
    }
}
