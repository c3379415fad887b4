use crate::encoder::stream::OutputStream;
use crate::{Error, Result};

/// Presence map under construction for one segment.
///
/// The map's bytes precede the segment's payload on the wire, but its bit count is only
/// known once the segment has been traversed. `init` therefore reserves the worst-case
/// byte count in the stream, bits accumulate in memory while the payload is written
/// behind the reservation, and `commit` patches the packed bits into the reserved
/// region, discarding whatever tail of the reservation turned out unused.
#[derive(Debug)]
pub(crate) struct EncoderPresenceMap {
    bitmap: u64,
    mask: u64,
    size: u8,
    offset: usize,
    reserved: usize,
}

impl EncoderPresenceMap {
    pub(crate) fn init(strm: &mut OutputStream, max_bits: usize) -> Result<Self> {
        let reserved = max_bits.div_ceil(7).max(1);
        let offset = strm.reserve(reserved)?;
        Ok(Self {
            bitmap: 0,
            mask: 0x40, // 0100 0000
            size: 7,
            offset,
            reserved,
        })
    }

    pub(crate) fn set_next_bit(&mut self, value: bool) {
        if self.mask == 0 {
            self.bitmap <<= 7;
            self.mask = 0x40;
            self.size += 7;
        }
        if value {
            self.bitmap |= self.mask;
        }
        self.mask >>= 1;
    }

    /// Pack the accumulated bits seven per byte into the reserved region, set the stop
    /// bit on the final byte, and shift the payload left over the unused remainder.
    /// With overlong pmaps allowed the full reservation is kept and trailing zero
    /// bytes stay on the wire.
    pub(crate) fn commit(self, strm: &mut OutputStream) -> Result<()> {
        let mut septets: Vec<u8> = Vec::with_capacity(self.reserved);
        let mut bitmap = self.bitmap;
        for _ in 0..self.size / 7 {
            septets.push((bitmap & 0x7f) as u8);
            bitmap >>= 7;
        }
        septets.reverse();
        if septets.len() > self.reserved {
            return Err(Error::Runtime(format!(
                "presence map needs {} bytes but only {} were reserved",
                septets.len(),
                self.reserved
            )));
        }

        if strm.allow_overlong_pmap {
            septets.resize(self.reserved, 0);
        } else {
            // trim trailing zero bytes, keeping at least one
            let mut used = septets.len();
            while used > 1 && septets[used - 1] == 0 {
                used -= 1;
            }
            septets.truncate(used);
        }
        // set stop bit
        *septets.last_mut().unwrap() |= 0x80;

        let used = septets.len();
        strm.patch(self.offset, &septets);
        strm.collapse(self.offset + used, self.reserved - used);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    fn emit(max_bits: usize, bits: &[bool], overlong: bool) -> Result<Vec<u8>> {
        let mut buf = bytes::BytesMut::new();
        let mut strm = OutputStream::new(&mut buf, overlong);
        let mut pmap = EncoderPresenceMap::init(&mut strm, max_bits)?;
        for b in bits {
            pmap.set_next_bit(*b);
        }
        pmap.commit(&mut strm)?;
        Ok(buf.to_vec())
    }

    #[test]
    fn empty_pmap_is_one_stop_byte() {
        assert_eq!(emit(7, &[], false).unwrap(), vec![0x80]);
        assert_eq!(emit(0, &[], false).unwrap(), vec![0x80]);
    }

    #[test]
    fn single_byte_patterns() {
        assert_eq!(emit(7, &[false], false).unwrap(), vec![0x80]);
        assert_eq!(emit(7, &[true], false).unwrap(), vec![0xc0]);
        assert_eq!(
            emit(7, &[true, false, true, false, true, true, false], false).unwrap(),
            vec![0xd6]
        );
    }

    #[test]
    fn trailing_zero_bytes_are_trimmed() {
        // second byte holds no set bit and disappears
        let bits = [true, false, false, false, false, false, false, false];
        assert_eq!(emit(14, &bits, false).unwrap(), vec![0xc0]);
        // a set bit in the second byte keeps both
        let bits = [true, false, false, false, false, false, false, true];
        assert_eq!(emit(14, &bits, false).unwrap(), vec![0x40, 0xc0]);
    }

    #[test]
    fn overlong_pmap_keeps_reservation() {
        let bits = [true];
        assert_eq!(emit(14, &bits, true).unwrap(), vec![0x40, 0x80]);
        assert_eq!(emit(7, &bits, true).unwrap(), vec![0xc0]);
    }

    #[test]
    fn payload_shifts_left_over_unused_reservation() {
        let mut buf = bytes::BytesMut::new();
        let mut strm = OutputStream::new(&mut buf, false);
        let mut pmap = EncoderPresenceMap::init(&mut strm, 21).unwrap();
        strm.write_uint(1).unwrap();
        pmap.set_next_bit(true);
        pmap.commit(&mut strm).unwrap();
        assert_eq!(buf.to_vec(), vec![0xc0, 0x81]);
    }
}
