use std::ops::Range;

use nohash_hasher::IntMap;

use crate::error::*;
use crate::leb128::{read_sleb, read_uleb};
use crate::module::Global;
use crate::types::Signature;

/// Jump targets for one structured opcode (`block`, `loop` or `if`).
///
/// `end_target` is the pc just past the construct's `end`. `else_target` is
/// only meaningful for `if`: the pc just past the `else` byte, or the pc of
/// the `end` opcode itself when the `if` has no else arm (so a false
/// condition lands on `end` and the frame unwinds normally).
#[derive(Clone, Copy, Debug)]
pub struct BlockTarget {
    pub else_target: usize,
    pub end_target: usize,
}

/// Side table built during the pre-execution scan, keyed by the pc of each
/// structured opcode. The interpreter never walks forward looking for `end`;
/// it looks the target up here.
#[derive(Default)]
pub struct SideTable {
    pub targets: IntMap<usize, BlockTarget>,
}

impl SideTable {
    #[inline]
    pub fn target(&self, pc: usize) -> Result<BlockTarget, Error> {
        self.targets.get(&pc).copied().ok_or(Error::Malformed(UNKNOWN_INSTRUCTION))
    }
}

pub struct ScanContext<'a> {
    pub bytes: &'a [u8],
    pub types: &'a [Signature],
    pub globals: &'a [Global],
    pub n_funcs: usize,
    pub n_locals: usize,
    pub has_table: bool,
    pub has_memory: bool,
}

struct ControlEntry {
    opcode: u8,
    pc: usize,
    else_pos: Option<usize>,
}

const MAX_CONTROL_DEPTH: usize = 1000;

/// Walk one function body, checking structure and indices and recording jump
/// targets for every structured opcode. Runs once at compile time so the
/// interpreter loop can use the unchecked LEB readers.
pub fn scan_function(ctx: &ScanContext, body: Range<usize>, side: &mut SideTable) -> Result<(), Error> {
    let bytes = ctx.bytes;
    let mut pc = body.start;
    // the function body acts as the outermost block
    let mut control: Vec<ControlEntry> = vec![ControlEntry { opcode: 0x02, pc: body.start, else_pos: None }];

    while pc < body.end {
        let op_pc = pc;
        let op = bytes[pc];
        pc += 1;
        match op {
            0x00 | 0x01 => {}
            // block / loop / if
            0x02 | 0x03 | 0x04 => {
                Signature::read_blocktype(ctx.types, bytes, &mut pc)?;
                if control.len() >= MAX_CONTROL_DEPTH {
                    return Err(Error::Validation(TYPE_MISMATCH));
                }
                control.push(ControlEntry { opcode: op, pc: op_pc, else_pos: None });
            }
            // else
            0x05 => {
                let top = control.last_mut().ok_or(Error::Validation(ELSE_MUST_CLOSE_IF))?;
                if top.opcode != 0x04 || top.else_pos.is_some() {
                    return Err(Error::Validation(ELSE_MUST_CLOSE_IF));
                }
                top.else_pos = Some(pc);
            }
            // end
            0x0b => {
                let entry = match control.pop() {
                    Some(e) => e,
                    None => return Err(Error::Malformed(END_EXPECTED)),
                };
                if control.is_empty() {
                    // closed the function body itself
                    if pc != body.end {
                        return Err(Error::Malformed(END_EXPECTED));
                    }
                    return Ok(());
                }
                let else_target = entry.else_pos.unwrap_or(op_pc);
                side.targets.insert(entry.pc, BlockTarget { else_target, end_target: pc });
            }
            // br / br_if
            0x0c | 0x0d => {
                let depth: u32 = read_uleb(bytes, &mut pc, 32)?;
                if depth as usize >= control.len() {
                    return Err(Error::Validation(UNKNOWN_LABEL));
                }
            }
            // br_table
            0x0e => {
                let count: u32 = read_uleb(bytes, &mut pc, 32)?;
                for _ in 0..=count {
                    let depth: u32 = read_uleb(bytes, &mut pc, 32)?;
                    if depth as usize >= control.len() {
                        return Err(Error::Validation(UNKNOWN_LABEL));
                    }
                }
            }
            // return
            0x0f => {}
            // call
            0x10 => {
                let idx: u32 = read_uleb(bytes, &mut pc, 32)?;
                if idx as usize >= ctx.n_funcs {
                    return Err(Error::Validation(UNKNOWN_FUNC));
                }
            }
            // call_indirect
            0x11 => {
                let type_idx: u32 = read_uleb(bytes, &mut pc, 32)?;
                if type_idx as usize >= ctx.types.len() {
                    return Err(Error::Validation(UNKNOWN_TYPE));
                }
                if next_byte(bytes, &mut pc)? != 0 {
                    return Err(Error::Malformed(ZERO_FLAG_EXPECTED));
                }
                if !ctx.has_table {
                    return Err(Error::Validation(UNKNOWN_TABLE));
                }
            }
            // drop / select
            0x1a | 0x1b => {}
            // local.get / local.set / local.tee
            0x20..=0x22 => {
                let idx: u32 = read_uleb(bytes, &mut pc, 32)?;
                if idx as usize >= ctx.n_locals {
                    return Err(Error::Validation(UNKNOWN_LOCAL));
                }
            }
            // global.get / global.set
            0x23 | 0x24 => {
                let idx: u32 = read_uleb(bytes, &mut pc, 32)?;
                let global = ctx.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
                if op == 0x24 && !global.mutable {
                    return Err(Error::Validation(GLOBAL_IS_IMMUTABLE));
                }
            }
            // loads and stores
            0x28..=0x3e => {
                if !ctx.has_memory {
                    return Err(Error::Validation(UNKNOWN_MEMORY));
                }
                let align: u32 = read_uleb(bytes, &mut pc, 32)?;
                if align > natural_alignment(op) {
                    return Err(Error::Validation(ALIGNMENT_TOO_LARGE));
                }
                let _offset: u32 = read_uleb(bytes, &mut pc, 32)?;
            }
            // memory.size / memory.grow
            0x3f | 0x40 => {
                if next_byte(bytes, &mut pc)? != 0 {
                    return Err(Error::Malformed(ZERO_FLAG_EXPECTED));
                }
                if !ctx.has_memory {
                    return Err(Error::Validation(UNKNOWN_MEMORY));
                }
            }
            // constants
            0x41 => {
                let _: i32 = read_sleb(bytes, &mut pc, 32)?;
            }
            0x42 => {
                let _: i64 = read_sleb(bytes, &mut pc, 64)?;
            }
            0x43 => skip(bytes, &mut pc, 4, body.end)?,
            0x44 => skip(bytes, &mut pc, 8, body.end)?,
            // numeric ops carry no immediates
            0x45..=0xbf => {}
            _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
        }
        if pc > body.end {
            return Err(Error::Malformed(UNEXPECTED_END));
        }
    }
    Err(Error::Malformed(END_EXPECTED))
}

/// Check a constant initializer expression: a single const or global.get
/// followed by `end`. Advances `pc` past the terminating `end`.
pub fn scan_const_expr(bytes: &[u8], pc: &mut usize, n_globals: usize) -> Result<(), Error> {
    match next_byte(bytes, pc)? {
        0x41 => {
            let _: i32 = read_sleb(bytes, pc, 32)?;
        }
        0x42 => {
            let _: i64 = read_sleb(bytes, pc, 64)?;
        }
        0x43 => skip(bytes, pc, 4, bytes.len())?,
        0x44 => skip(bytes, pc, 8, bytes.len())?,
        0x23 => {
            let idx: u32 = read_uleb(bytes, pc, 32)?;
            if idx as usize >= n_globals {
                return Err(Error::Validation(UNKNOWN_GLOBAL));
            }
        }
        _ => return Err(Error::Validation(CONST_EXP_REQUIRED)),
    }
    if next_byte(bytes, pc)? != 0x0b {
        return Err(Error::Validation(CONST_EXP_REQUIRED));
    }
    Ok(())
}

/// log2 of the access width for each load/store opcode. The alignment
/// immediate may not exceed it.
#[inline]
fn natural_alignment(op: u8) -> u32 {
    match op {
        0x2c | 0x2d | 0x30 | 0x31 | 0x3a | 0x3c => 0, // 8-bit
        0x2e | 0x2f | 0x32 | 0x33 | 0x3b | 0x3d => 1, // 16-bit
        0x28 | 0x2a | 0x34 | 0x35 | 0x36 | 0x38 | 0x3e => 2, // 32-bit
        _ => 3, // 0x29 | 0x2b | 0x37 | 0x39, 64-bit
    }
}

#[inline]
fn next_byte(bytes: &[u8], pc: &mut usize) -> Result<u8, Error> {
    let b = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
    *pc += 1;
    Ok(b)
}

#[inline]
fn skip(bytes: &[u8], pc: &mut usize, n: usize, end: usize) -> Result<(), Error> {
    let new = pc.checked_add(n).ok_or(Error::Malformed(UNEXPECTED_END))?;
    if new > end || new > bytes.len() {
        return Err(Error::Malformed(UNEXPECTED_END));
    }
    *pc = new;
    Ok(())
}
