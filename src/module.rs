use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use crate::debug_println;
use crate::error::*;
use crate::leb128::read_uleb;
use crate::reader::Reader;
use crate::scan::{self, ScanContext, SideTable};
use crate::types::{is_val_type, Signature, ValType};

const MAGIC_HEADER: &[u8; 4] = b"\0asm";

#[derive(Clone, Debug)]
pub struct ImportRef {
    pub module: String,
    pub field: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Mem = 2,
    Global = 3,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Mem),
            3 => Some(ExternKind::Global),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Function {
    pub body: Range<usize>,
    pub ty: Signature,
    pub locals: Vec<ValType>,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Table {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Memory {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Global {
    pub ty: ValType,
    pub mutable: bool,
    pub init_offset: usize,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Export {
    pub kind: ExternKind,
    pub idx: u32,
}

#[derive(Clone)]
pub struct ElemSegment {
    pub init_offset: usize,
    pub funcs: Vec<u32>,
}

#[derive(Clone)]
pub struct DataSegment {
    pub range: Range<usize>,
    pub init_offset: usize,
}

/// A parsed and scanned module. The raw bytes stay alive for the lifetime of
/// the module; function bodies are ranges into them, and the side table maps
/// every structured opcode to its jump targets.
pub struct Module {
    pub bytes: Rc<Vec<u8>>,
    pub types: Vec<Signature>,
    pub imports: HashMap<String, HashMap<String, ExternKind>>,
    pub functions: Vec<Function>,
    pub table: Option<Table>,
    pub memory: Option<Memory>,
    pub globals: Vec<Global>,
    pub exports: HashMap<String, Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElemSegment>,
    pub data_segments: Vec<DataSegment>,
    pub side_table: SideTable,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("size", &self.bytes.len())
            .field("types", &self.types.len())
            .field("functions", &self.functions.len())
            .field("globals", &self.globals.len())
            .field("exports", &self.exports.len())
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}

impl Module {
    pub const MAX_PAGES: u32 = 65536;
    pub const MAX_LOCALS: usize = 50000;

    pub fn compile(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut m = Module {
            bytes: Rc::new(bytes),
            types: Vec::new(),
            imports: HashMap::new(),
            functions: Vec::new(),
            table: None,
            memory: None,
            globals: Vec::new(),
            exports: HashMap::new(),
            start: None,
            elements: Vec::new(),
            data_segments: Vec::new(),
            side_table: SideTable::default(),
        };
        m.parse()?;
        Ok(m)
    }

    pub fn n_imported_functions(&self) -> usize {
        self.functions.iter().filter(|f| f.import.is_some()).count()
    }

    fn parse(&mut self) -> Result<(), Error> {
        let bytes_rc = self.bytes.clone();
        let bytes: &[u8] = &bytes_rc[..];

        if bytes.len() < 8 {
            return Err(Error::Malformed(UNEXPECTED_END));
        }
        if &bytes[0..4] != MAGIC_HEADER {
            return Err(Error::Malformed(NO_MAGIC_HEADER));
        }
        if u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) != 1 {
            return Err(Error::Malformed(UNKNOWN_BINARY_VERSION));
        }

        let mut rd = Reader::new(bytes, 8);
        let mut last_id: u8 = 0;
        let mut saw_code = false;
        while !rd.done() {
            let id = rd.byte()?;
            let len: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            let start = rd.pos();
            if start + len as usize > bytes.len() {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            if id == 0 {
                // custom section: name followed by opaque payload
                let _ = Reader::new(bytes, start).name()?;
                rd.pos = start + len as usize;
                continue;
            }
            if id > 11 {
                return Err(Error::Malformed(INVALID_SECTION_ID));
            }
            if id <= last_id {
                return Err(Error::Malformed(JUNK_AFTER_LAST));
            }
            last_id = id;
            debug_println!("section {} ({} bytes)", id, len);
            match id {
                1 => self.parse_types(bytes, &mut rd)?,
                2 => self.parse_imports(bytes, &mut rd)?,
                3 => self.parse_function_decls(bytes, &mut rd)?,
                4 => self.parse_tables(bytes, &mut rd)?,
                5 => self.parse_memories(bytes, &mut rd)?,
                6 => self.parse_globals(bytes, &mut rd)?,
                7 => self.parse_exports(bytes, &mut rd)?,
                8 => self.parse_start(bytes, &mut rd)?,
                9 => self.parse_elements(bytes, &mut rd)?,
                10 => {
                    self.parse_code(bytes, &mut rd)?;
                    saw_code = true;
                }
                11 => self.parse_data(bytes, &mut rd)?,
                _ => return Err(Error::Malformed(INVALID_SECTION_ID)),
            }
            if rd.pos() - start != len as usize {
                return Err(Error::Malformed(SECTION_SIZE_MISMATCH));
            }
        }

        if !saw_code && self.functions.len() != self.n_imported_functions() {
            return Err(Error::Malformed(FUNC_CODE_INCONSISTENT));
        }
        Ok(())
    }

    fn parse_types(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        self.types.reserve_exact(n as usize);
        for _ in 0..n {
            if rd.byte()? != 0x60 {
                return Err(Error::Malformed(INVALID_VALUE_TYPE));
            }
            let mut sig = Signature::default();
            let n_params: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            sig.params.reserve_exact(n_params as usize);
            for _ in 0..n_params {
                let ty = ValType::from_byte(rd.byte()?).ok_or(Error::Malformed(INVALID_VALUE_TYPE))?;
                sig.params.push(ty);
            }
            let n_results: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            if n_results > 1 {
                return Err(Error::Validation(INVALID_RESULT_ARITY));
            }
            if n_results == 1 {
                let ty = ValType::from_byte(rd.byte()?).ok_or(Error::Malformed(INVALID_VALUE_TYPE))?;
                sig.result = Some(ty);
            }
            self.types.push(sig);
        }
        Ok(())
    }

    fn parse_imports(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        for _ in 0..n {
            let module_name = rd.name()?;
            let field_name = rd.name()?;
            let kind =
                ExternKind::from_byte(rd.byte()?).ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
            let import = Some(ImportRef { module: module_name.clone(), field: field_name.clone() });
            self.imports.entry(module_name).or_default().insert(field_name, kind);

            match kind {
                ExternKind::Func => {
                    let type_idx: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
                    let ty = self
                        .types
                        .get(type_idx as usize)
                        .ok_or(Error::Validation(UNKNOWN_TYPE))?
                        .clone();
                    let locals = ty.params.clone();
                    self.functions.push(Function { body: 0..0, ty, locals, import });
                }
                ExternKind::Table => {
                    if self.table.is_some() {
                        return Err(Error::Validation(MULTIPLE_TABLES));
                    }
                    if rd.byte()? != 0x70 {
                        return Err(Error::Malformed(MALFORMED_REF_TYPE));
                    }
                    let (min, max) = read_limits(bytes, rd, u32::MAX)?;
                    self.table = Some(Table { min, max, import });
                }
                ExternKind::Mem => {
                    if self.memory.is_some() {
                        return Err(Error::Validation(MULTIPLE_MEMORIES));
                    }
                    let (min, max) = read_memory_limits(bytes, rd)?;
                    self.memory = Some(Memory { min, max, import });
                }
                ExternKind::Global => {
                    let ty = ValType::from_byte(rd.byte()?)
                        .ok_or(Error::Malformed(INVALID_GLOBAL_TYPE))?;
                    let mutable = read_mutability(rd)?;
                    self.globals.push(Global { ty, mutable, init_offset: 0, import });
                }
            }
        }
        Ok(())
    }

    fn parse_function_decls(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        self.functions.reserve(n as usize);
        for _ in 0..n {
            let type_idx: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            let ty = self
                .types
                .get(type_idx as usize)
                .ok_or(Error::Validation(UNKNOWN_TYPE))?
                .clone();
            let locals = ty.params.clone();
            self.functions.push(Function { body: 0..0, ty, locals, import: None });
        }
        Ok(())
    }

    fn parse_tables(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        if n > 1 || (n == 1 && self.table.is_some()) {
            return Err(Error::Validation(MULTIPLE_TABLES));
        }
        if n == 1 {
            if rd.byte()? != 0x70 {
                return Err(Error::Malformed(MALFORMED_REF_TYPE));
            }
            let (min, max) = read_limits(bytes, rd, u32::MAX)?;
            self.table = Some(Table { min, max, import: None });
        }
        Ok(())
    }

    fn parse_memories(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        if n > 1 || (n == 1 && self.memory.is_some()) {
            return Err(Error::Validation(MULTIPLE_MEMORIES));
        }
        if n == 1 {
            let (min, max) = read_memory_limits(bytes, rd)?;
            self.memory = Some(Memory { min, max, import: None });
        }
        Ok(())
    }

    fn parse_globals(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        for _ in 0..n {
            let ty = ValType::from_byte(rd.byte()?).ok_or(Error::Malformed(INVALID_GLOBAL_TYPE))?;
            let mutable = read_mutability(rd)?;
            let init_offset = rd.pos();
            scan::scan_const_expr(bytes, &mut rd.pos, self.globals.len())?;
            self.globals.push(Global { ty, mutable, init_offset, import: None });
        }
        Ok(())
    }

    fn parse_exports(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        for _ in 0..n {
            let name = rd.name()?;
            let kind = ExternKind::from_byte(rd.byte()?).ok_or(Error::Validation(INVALID_EXPORT_DESC))?;
            let idx: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            if self.exports.contains_key(&name) {
                return Err(Error::Validation(DUP_EXPORT_NAME));
            }
            match kind {
                ExternKind::Func => {
                    if (idx as usize) >= self.functions.len() {
                        return Err(Error::Validation(UNKNOWN_FUNC));
                    }
                }
                ExternKind::Table => {
                    if idx != 0 || self.table.is_none() {
                        return Err(Error::Validation(UNKNOWN_TABLE));
                    }
                }
                ExternKind::Mem => {
                    if idx != 0 || self.memory.is_none() {
                        return Err(Error::Validation(UNKNOWN_MEMORY));
                    }
                }
                ExternKind::Global => {
                    if (idx as usize) >= self.globals.len() {
                        return Err(Error::Validation(UNKNOWN_GLOBAL));
                    }
                }
            }
            self.exports.insert(name, Export { kind, idx });
        }
        Ok(())
    }

    fn parse_start(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let idx: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        let func = self.functions.get(idx as usize).ok_or(Error::Validation(UNKNOWN_FUNC))?;
        if !func.ty.params.is_empty() || func.ty.has_result() {
            return Err(Error::Validation(START_FUNC));
        }
        self.start = Some(idx);
        Ok(())
    }

    fn parse_elements(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        for _ in 0..n {
            let flags: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            if flags != 0 {
                return Err(Error::Validation(INVALID_ELEM_SEG_FLAG));
            }
            if self.table.is_none() {
                return Err(Error::Validation(UNKNOWN_TABLE));
            }
            let init_offset = rd.pos();
            scan::scan_const_expr(bytes, &mut rd.pos, self.globals.len())?;
            let count: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            let mut funcs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let func_idx: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
                if (func_idx as usize) >= self.functions.len() {
                    return Err(Error::Validation(UNKNOWN_FUNC));
                }
                funcs.push(func_idx);
            }
            self.elements.push(ElemSegment { init_offset, funcs });
        }
        Ok(())
    }

    fn parse_code(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        let n_imports = self.n_imported_functions();
        if n as usize + n_imports != self.functions.len() {
            return Err(Error::Malformed(FUNC_CODE_INCONSISTENT));
        }

        for i in 0..self.functions.len() {
            if self.functions[i].import.is_some() {
                continue;
            }

            let body_size: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            let func_start = rd.pos();
            let func_end = func_start + body_size as usize;
            if func_end > bytes.len() {
                return Err(Error::Malformed(UNEXPECTED_END));
            }

            // local declarations: groups of (count, type)
            let mut n_groups: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            while n_groups > 0 {
                n_groups -= 1;
                let count: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
                let ty_byte = rd.byte()?;
                if !is_val_type(ty_byte) {
                    return Err(Error::Validation(INVALID_LOCAL_TYPE));
                }
                let ty = ValType::from_byte(ty_byte).ok_or(Error::Validation(INVALID_LOCAL_TYPE))?;
                let func = &mut self.functions[i];
                for _ in 0..count {
                    func.locals.push(ty);
                    if func.locals.len() > Module::MAX_LOCALS {
                        return Err(Error::Malformed(TOO_MANY_LOCALS));
                    }
                }
            }

            let body_start = rd.pos();
            self.functions[i].body = body_start..func_end;

            let ctx = ScanContext {
                bytes,
                types: &self.types,
                globals: &self.globals,
                n_funcs: self.functions.len(),
                n_locals: self.functions[i].locals.len(),
                has_table: self.table.is_some(),
                has_memory: self.memory.is_some(),
            };
            scan::scan_function(&ctx, body_start..func_end, &mut self.side_table)?;
            rd.pos = func_end;
        }
        Ok(())
    }

    fn parse_data(&mut self, bytes: &[u8], rd: &mut Reader) -> Result<(), Error> {
        let n: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
        for _ in 0..n {
            let flags: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            if flags != 0 {
                return Err(Error::Validation(INVALID_DATA_SEG_FLAG));
            }
            if self.memory.is_none() {
                return Err(Error::Validation(UNKNOWN_MEMORY));
            }
            let init_offset = rd.pos();
            scan::scan_const_expr(bytes, &mut rd.pos, self.globals.len())?;
            let len: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
            let start = rd.pos();
            rd.skip(len as usize)?;
            self.data_segments.push(DataSegment { range: start..rd.pos(), init_offset });
        }
        Ok(())
    }
}

fn read_limits(bytes: &[u8], rd: &mut Reader, upper: u32) -> Result<(u32, u32), Error> {
    let flags: u32 = read_uleb(bytes, &mut rd.pos, 1)?;
    let initial: u32 = read_uleb(bytes, &mut rd.pos, 32)?;
    let max = if flags == 1 { read_uleb::<u32>(bytes, &mut rd.pos, 32)? } else { upper };
    if max < initial {
        return Err(Error::Validation(MIN_GREATER_THAN_MAX));
    }
    Ok((initial, max))
}

fn read_memory_limits(bytes: &[u8], rd: &mut Reader) -> Result<(u32, u32), Error> {
    let (initial, max) = read_limits(bytes, rd, Module::MAX_PAGES)?;
    if initial > Module::MAX_PAGES || max > Module::MAX_PAGES {
        return Err(Error::Validation(MEMORY_SIZE_LIMIT));
    }
    Ok((initial, max))
}

fn read_mutability(rd: &mut Reader) -> Result<bool, Error> {
    match rd.byte()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::Malformed(INVALID_MUTABILITY)),
    }
}
