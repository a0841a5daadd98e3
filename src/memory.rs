use crate::error::*;
use paste::paste;

macro_rules! impl_load_store {
    ($ty:ident, $size:literal) => {
        paste! {
            #[inline]
            pub fn [<load_ $ty>](&self, addr: u32, offset: u32) -> Result<$ty, Error> {
                let start = self.checked_range(addr, offset, $size)?;
                let raw: [u8; $size] = self.data[start..start + $size]
                    .try_into()
                    .map_err(|_| Error::Trap(OOB_MEMORY_ACCESS))?;
                Ok(<$ty>::from_le_bytes(raw))
            }

            #[inline]
            pub fn [<store_ $ty>](&mut self, addr: u32, offset: u32, v: $ty) -> Result<(), Error> {
                let start = self.checked_range(addr, offset, $size)?;
                self.data[start..start + $size].copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
        }
    };
}

macro_rules! impl_signed_load {
    ($ty:ident, $unsigned:ident) => {
        paste! {
            #[inline]
            pub fn [<load_ $ty>](&self, addr: u32, offset: u32) -> Result<$ty, Error> {
                Ok(self.[<load_ $unsigned>](addr, offset)? as $ty)
            }
        }
    };
}

/// A module instance's linear memory: a growable vector of pages with
/// little-endian, bounds-checked access.
pub struct WasmMemory {
    data: Vec<u8>,
    current: u32,
    maximum: u32,
}

impl WasmMemory {
    pub const MAX_PAGES: u32 = 65536;
    pub const PAGE_SIZE: u32 = 65536;

    pub fn new(initial: u32, maximum: u32) -> Self {
        let maximum = maximum.min(Self::MAX_PAGES);
        let data = vec![0; (initial as usize) * (Self::PAGE_SIZE as usize)];
        Self { data, current: initial, maximum }
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 {
        self.current
    }

    /// Declared maximum in pages.
    pub fn max(&self) -> u32 {
        self.maximum
    }

    /// Current size in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Grow by `delta` pages, returning the previous page count, or
    /// `u32::MAX` if the maximum would be exceeded (memory.grow semantics).
    pub fn grow(&mut self, delta: u32) -> u32 {
        if delta == 0 {
            return self.current;
        }
        if delta > self.maximum.saturating_sub(self.current) {
            return u32::MAX;
        }
        let old = self.current;
        self.current += delta;
        self.data.resize((self.current as usize) * (Self::PAGE_SIZE as usize), 0);
        old
    }

    /// Grow to an absolute page count (embedder API; never shrinks).
    pub fn resize(&mut self, pages: u32) -> Result<(), Error> {
        if pages > self.maximum {
            return Err(Error::Validation(MEMORY_SIZE_LIMIT));
        }
        if pages > self.current {
            self.current = pages;
            self.data.resize((pages as usize) * (Self::PAGE_SIZE as usize), 0);
        }
        Ok(())
    }

    #[inline]
    fn checked_range(&self, addr: u32, offset: u32, len: usize) -> Result<usize, Error> {
        let start = (addr as usize)
            .checked_add(offset as usize)
            .ok_or(Error::Trap(OOB_MEMORY_ACCESS))?;
        if start.saturating_add(len) > self.data.len() {
            return Err(Error::Trap(OOB_MEMORY_ACCESS));
        }
        Ok(start)
    }

    impl_load_store!(u8, 1);
    impl_load_store!(u16, 2);
    impl_load_store!(u32, 4);
    impl_load_store!(u64, 8);
    impl_signed_load!(i8, u8);
    impl_signed_load!(i16, u16);
    impl_signed_load!(i32, u32);
    impl_signed_load!(i64, u64);

    #[inline]
    pub fn load_f32(&self, addr: u32, offset: u32) -> Result<f32, Error> {
        Ok(f32::from_bits(self.load_u32(addr, offset)?))
    }

    #[inline]
    pub fn store_f32(&mut self, addr: u32, offset: u32, v: f32) -> Result<(), Error> {
        self.store_u32(addr, offset, v.to_bits())
    }

    #[inline]
    pub fn load_f64(&self, addr: u32, offset: u32) -> Result<f64, Error> {
        Ok(f64::from_bits(self.load_u64(addr, offset)?))
    }

    #[inline]
    pub fn store_f64(&mut self, addr: u32, offset: u32, v: f64) -> Result<(), Error> {
        self.store_u64(addr, offset, v.to_bits())
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        let start = self.checked_range(0, offset, bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
        let start = self.checked_range(0, offset, len as usize)?;
        Ok(self.data[start..start + len as usize].to_vec())
    }

    /// Read `len` bytes at `offset` and decode them as UTF-8.
    pub fn read_string(&self, offset: u32, len: u32) -> Result<String, Error> {
        String::from_utf8(self.read_bytes(offset, len)?)
            .map_err(|_| Error::Malformed(INVALID_UTF8))
    }
}
