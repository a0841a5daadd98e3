use crate::error::*;
use crate::leb128::read_sleb;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
}

impl ValType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }
}

impl std::fmt::Display for ValType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[inline]
pub fn is_val_type(byte: u8) -> bool {
    matches!(byte, 0x7c..=0x7f)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

impl Signature {
    #[inline]
    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Decode a block type: void, a single value type, or (post-MVP encoding
    /// that some assemblers emit for MVP-compatible blocks) an index into the
    /// type section whose signature must have no parameters.
    pub fn read_blocktype(
        types: &[Signature],
        bytes: &[u8],
        pc: &mut usize,
    ) -> Result<Option<ValType>, Error> {
        const VOID: u8 = 0x40;
        let byte = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
        if byte == VOID {
            *pc += 1;
            return Ok(None);
        }
        if let Some(vt) = ValType::from_byte(byte) {
            *pc += 1;
            return Ok(Some(vt));
        }
        let n: i64 = read_sleb(bytes, pc, 33)?;
        if n < 0 || (n as usize) >= types.len() {
            return Err(Error::Malformed(INVALID_VALUE_TYPE));
        }
        let sig = &types[n as usize];
        if !sig.params.is_empty() {
            return Err(Error::Validation(INVALID_RESULT_ARITY));
        }
        Ok(sig.result)
    }
}
