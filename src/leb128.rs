use crate::error::*;

// Two tiers of LEB128 readers: the checked variants enforce the encoding
// limits the binary format mandates (used while parsing and scanning), the
// plain variants only guard against running off the buffer (used in the
// interpreter loop, whose input has already been scanned).

#[inline]
pub fn uleb<T: TryFrom<u64>>(bytes: &[u8], pc: &mut usize) -> Result<T, Error> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
        *pc += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    T::try_from(result).map_err(|_| Error::Malformed(INT_TOO_LARGE))
}

#[inline]
pub fn sleb<T: TryFrom<i64>>(bytes: &[u8], pc: &mut usize) -> Result<T, Error> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut byte: u8;
    loop {
        byte = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
        *pc += 1;
        if shift < 63 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift = (shift + 7).min(63);
        if byte & 0x80 == 0 {
            break;
        }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= (!0i64).checked_shl(shift).unwrap_or(!0i64);
    }
    T::try_from(result).map_err(|_| Error::Malformed(INT_TOO_LARGE))
}

/// Unsigned LEB128 limited to `bits` significant bits.
pub fn read_uleb<T: TryFrom<u64>>(bytes: &[u8], pc: &mut usize, bits: u32) -> Result<T, Error> {
    let start = *pc;
    let value: u64 = uleb(bytes, pc)?;
    let consumed = *pc - start;
    if consumed > (bits as usize).div_ceil(7) {
        return Err(Error::Malformed(INT_TOO_LONG));
    }
    if bits < 64 && value > (1u64 << bits) - 1 {
        return Err(Error::Malformed(INT_TOO_LARGE));
    }
    T::try_from(value).map_err(|_| Error::Malformed(INT_TOO_LARGE))
}

/// Signed LEB128 limited to `bits` significant bits (two's complement range).
pub fn read_sleb<T: TryFrom<i64>>(bytes: &[u8], pc: &mut usize, bits: u32) -> Result<T, Error> {
    let start = *pc;
    let value: i64 = sleb(bytes, pc)?;
    let consumed = *pc - start;
    if consumed > (bits as usize).div_ceil(7) {
        return Err(Error::Malformed(INT_TOO_LONG));
    }
    if bits < 64 {
        let bound = 1i128 << (bits - 1);
        if (value as i128) < -bound || (value as i128) >= bound {
            return Err(Error::Malformed(INT_TOO_LARGE));
        }
    }
    T::try_from(value).map_err(|_| Error::Malformed(INT_TOO_LARGE))
}
