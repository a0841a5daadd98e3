use crate::error::*;

/// Cursor over a module's raw bytes, used by the section parser.
#[derive(Clone, Copy)]
pub struct Reader<'a> {
    pub bytes: &'a [u8],
    pub pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    #[inline]
    pub fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        let end = self.pos.checked_add(n).ok_or(Error::Malformed(UNEXPECTED_END))?;
        if end > self.bytes.len() {
            return Err(Error::Malformed(UNEXPECTED_END));
        }
        self.pos = end;
        Ok(())
    }

    #[inline]
    pub fn byte(&mut self) -> Result<u8, Error> {
        let b = *self.bytes.get(self.pos).ok_or(Error::Malformed(UNEXPECTED_END))?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    pub fn peek(&self) -> Result<u8, Error> {
        self.bytes.get(self.pos).copied().ok_or(Error::Malformed(UNEXPECTED_END))
    }

    /// Consume `n` bytes and return them as a slice.
    #[inline]
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let start = self.pos;
        self.skip(n)?;
        Ok(&self.bytes[start..self.pos])
    }

    /// Consume a name: LEB128 length followed by that many UTF-8 bytes.
    pub fn name(&mut self) -> Result<String, Error> {
        let len: u32 = crate::leb128::read_uleb(self.bytes, &mut self.pos, 32)?;
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Malformed(INVALID_UTF8))
    }
}
