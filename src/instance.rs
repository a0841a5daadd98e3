use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use paste::paste;

use crate::error::*;
use crate::interrupt::{self, Poll};
use crate::leb128::{sleb, uleb};
use crate::memory::WasmMemory;
use crate::module::{ExternKind, Module};
use crate::types::{Signature, ValType};
use crate::value::WasmValue;

const MAX_CALL_DEPTH: usize = 1000;
const MAX_CONTROL_DEPTH: usize = 1000;

/// Abort the current execution path if an interrupt has been latched.
/// Called at every checkpoint: invoke entry, function call entry, host call
/// entry and each `loop` opcode, which covers all backward edges.
#[inline]
fn check_interrupt() -> Result<(), Error> {
    match interrupt::poll_and_consume() {
        Poll::Interrupted => Err(Error::Trap(EXECUTION_ABORTED)),
        Poll::NotInterrupted => Ok(()),
    }
}

/// A funcref table. Slots hold function indices into the owning instance,
/// `None` for uninitialized elements.
pub struct WasmTable {
    elements: Vec<Option<u32>>,
    current: u32,
    maximum: u32,
}

impl WasmTable {
    pub fn new(initial: u32, maximum: u32) -> Self {
        Self { elements: vec![None; initial as usize], current: initial, maximum }
    }

    pub fn size(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.maximum
    }

    pub fn get(&self, idx: u32) -> Result<Option<u32>, Error> {
        self.elements.get(idx as usize).copied().ok_or(Error::Trap(UNDEF_ELEM))
    }

    pub fn set(&mut self, idx: u32, value: Option<u32>) -> Result<(), Error> {
        let slot = self.elements.get_mut(idx as usize).ok_or(Error::Trap(OOB_TABLE_ACCESS))?;
        *slot = value;
        Ok(())
    }
}

pub struct WasmGlobal {
    pub ty: ValType,
    pub mutable: bool,
    value: Cell<WasmValue>,
}

impl WasmGlobal {
    pub fn new(ty: ValType, mutable: bool, value: WasmValue) -> Self {
        Self { ty, mutable, value: Cell::new(value) }
    }

    #[inline]
    pub fn get(&self) -> WasmValue {
        self.value.get()
    }

    /// Embedder-side write; immutable globals reject it.
    pub fn set(&self, value: WasmValue) -> Result<(), Error> {
        if !self.mutable {
            return Err(Error::Validation(GLOBAL_IS_IMMUTABLE));
        }
        self.value.set(value);
        Ok(())
    }

    #[inline]
    fn store(&self, value: WasmValue) {
        self.value.set(value);
    }
}

/// A host callback. It may return a single result and it may trap, in which
/// case the trap propagates out of the interpreter like any wasm trap.
pub type HostCallback = Rc<dyn Fn(&[WasmValue]) -> Result<Option<WasmValue>, Error>>;

#[derive(Clone)]
pub enum RuntimeFunction {
    Wasm { sig: Signature, body_start: usize, locals_count: usize },
    Host { callback: HostCallback, sig: Signature },
}

impl fmt::Debug for RuntimeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFunction::Wasm { sig, body_start, locals_count } => f
                .debug_struct("Wasm")
                .field("sig", sig)
                .field("body_start", body_start)
                .field("locals_count", locals_count)
                .finish(),
            RuntimeFunction::Host { sig, .. } => {
                f.debug_struct("Host").field("sig", sig).finish_non_exhaustive()
            }
        }
    }
}

impl RuntimeFunction {
    pub fn signature(&self) -> &Signature {
        match self {
            RuntimeFunction::Wasm { sig, .. } => sig,
            RuntimeFunction::Host { sig, .. } => sig,
        }
    }

    pub fn n_params(&self) -> usize {
        self.signature().n_params()
    }

    pub fn new_host(
        params: Vec<ValType>,
        result: Option<ValType>,
        callback: impl Fn(&[WasmValue]) -> Result<Option<WasmValue>, Error> + 'static,
    ) -> Self {
        RuntimeFunction::Host { callback: Rc::new(callback), sig: Signature { params, result } }
    }
}

#[derive(Clone)]
pub enum ExportValue {
    Function(RuntimeFunction),
    Table(Rc<RefCell<WasmTable>>),
    Memory(Rc<RefCell<WasmMemory>>),
    Global(Rc<WasmGlobal>),
}

pub type Exports = HashMap<String, ExportValue>;
pub type ModuleImports = HashMap<String, ExportValue>;
pub type Imports = HashMap<String, ModuleImports>;

/// One structured construct (or function body) on the control stack.
struct ControlFrame {
    stack_len: usize,
    dest_pc: usize,
    arity: u32,
    has_result: bool,
}

/// One active function activation. `frame_idx` marks the control frame that
/// doubles as the function's return target.
struct CallFrame {
    locals_base: usize,
    frame_idx: usize,
}

pub struct Instance {
    pub module: Rc<Module>,
    pub memory: Option<Rc<RefCell<WasmMemory>>>,
    pub table: Option<Rc<RefCell<WasmTable>>>,
    pub globals: Vec<Rc<WasmGlobal>>,
    pub functions: Vec<RuntimeFunction>,
    pub exports: Exports,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("functions", &self.functions.len())
            .field("globals", &self.globals.len())
            .field("memory_pages", &self.memory.as_ref().map(|m| m.borrow().size()))
            .field("table_size", &self.table.as_ref().map(|t| t.borrow().size()))
            .field("exports", &self.exports.keys())
            .finish()
    }
}

fn resolve<'a>(imports: &'a Imports, module: &str, field: &str) -> Result<&'a ExportValue, Error> {
    imports
        .get(module)
        .and_then(|m| m.get(field))
        .ok_or(Error::Link(UNKNOWN_IMPORT))
}

impl Instance {
    pub fn instantiate(module: Rc<Module>, imports: &Imports) -> Result<Self, Error> {
        let mut inst = Instance {
            module: module.clone(),
            memory: None,
            table: None,
            globals: Vec::new(),
            functions: Vec::new(),
            exports: Exports::new(),
        };

        if let Some(memory) = &module.memory {
            if let Some(import_ref) = &memory.import {
                match resolve(imports, &import_ref.module, &import_ref.field)? {
                    ExportValue::Memory(mem) => {
                        let m = mem.borrow();
                        if m.size() < memory.min || m.max() > memory.max {
                            return Err(Error::Link(INCOMPATIBLE_IMPORT));
                        }
                        drop(m);
                        inst.memory = Some(mem.clone());
                    }
                    _ => return Err(Error::Link(INCOMPATIBLE_IMPORT)),
                }
            } else {
                inst.memory = Some(Rc::new(RefCell::new(WasmMemory::new(memory.min, memory.max))));
            }
        }

        if let Some(table) = &module.table {
            if let Some(import_ref) = &table.import {
                match resolve(imports, &import_ref.module, &import_ref.field)? {
                    ExportValue::Table(tab) => {
                        let t = tab.borrow();
                        if t.size() < table.min || t.max() > table.max {
                            return Err(Error::Link(INCOMPATIBLE_IMPORT));
                        }
                        drop(t);
                        inst.table = Some(tab.clone());
                    }
                    _ => return Err(Error::Link(INCOMPATIBLE_IMPORT)),
                }
            } else {
                inst.table = Some(Rc::new(RefCell::new(WasmTable::new(table.min, table.max))));
            }
        }

        // function imports must resolve to host functions; wasm function
        // bodies are pc ranges into their own module's bytes and cannot be
        // re-homed into another instance
        inst.functions.reserve(module.functions.len());
        for function in &module.functions {
            if let Some(import_ref) = &function.import {
                match resolve(imports, &import_ref.module, &import_ref.field)? {
                    ExportValue::Function(f @ RuntimeFunction::Host { .. }) => {
                        if *f.signature() != function.ty {
                            return Err(Error::Link(INCOMPATIBLE_IMPORT));
                        }
                        inst.functions.push(f.clone());
                    }
                    _ => return Err(Error::Link(INCOMPATIBLE_IMPORT)),
                }
            } else {
                let locals_count = function.locals.len() - function.ty.n_params();
                inst.functions.push(RuntimeFunction::Wasm {
                    sig: function.ty.clone(),
                    body_start: function.body.start,
                    locals_count,
                });
            }
        }

        inst.globals.reserve(module.globals.len());
        for g in &module.globals {
            if let Some(import_ref) = &g.import {
                match resolve(imports, &import_ref.module, &import_ref.field)? {
                    ExportValue::Global(gl) => {
                        if gl.ty != g.ty || gl.mutable != g.mutable {
                            return Err(Error::Link(INCOMPATIBLE_IMPORT));
                        }
                        inst.globals.push(gl.clone());
                    }
                    _ => return Err(Error::Link(INCOMPATIBLE_IMPORT)),
                }
            } else {
                let mut pc = g.init_offset;
                let val = Self::eval_const(&module, &mut pc, &inst.globals)?;
                inst.globals.push(Rc::new(WasmGlobal::new(g.ty, g.mutable, val)));
            }
        }

        // element segments: bounds-check every segment before writing any
        let mut pending_elements: Vec<(u32, &[u32])> = Vec::with_capacity(module.elements.len());
        for seg in &module.elements {
            let table_rc = inst.table.as_ref().ok_or(Error::Link(UNKNOWN_TABLE))?;
            let mut pc = seg.init_offset;
            let offset = Self::eval_const(&module, &mut pc, &inst.globals)?.as_u32();
            if (offset as u64) + (seg.funcs.len() as u64) > table_rc.borrow().size() as u64 {
                return Err(Error::Link(ELEM_SEG_DNF));
            }
            pending_elements.push((offset, &seg.funcs));
        }

        // data segments: same two-phase application
        let mut pending_data: Vec<(u32, &[u8])> = Vec::with_capacity(module.data_segments.len());
        for seg in &module.data_segments {
            let mem = inst.memory.as_ref().ok_or(Error::Link(UNKNOWN_MEMORY))?;
            let mut pc = seg.init_offset;
            let offset = Self::eval_const(&module, &mut pc, &inst.globals)?.as_u32();
            let data = &module.bytes[seg.range.clone()];
            if (offset as u64) + (data.len() as u64) > mem.borrow().byte_len() as u64 {
                return Err(Error::Link(DATA_SEG_DNF));
            }
            pending_data.push((offset, data));
        }

        if let Some(table_rc) = &inst.table {
            let mut table = table_rc.borrow_mut();
            for (offset, funcs) in pending_elements {
                for (j, func_idx) in funcs.iter().enumerate() {
                    table.set(offset + j as u32, Some(*func_idx))?;
                }
            }
        }
        if let Some(mem) = &inst.memory {
            let mut m = mem.borrow_mut();
            for (offset, data) in pending_data {
                m.write_bytes(offset, data)?;
            }
        }

        for (name, export) in &module.exports {
            let value = match export.kind {
                ExternKind::Func => ExportValue::Function(inst.functions[export.idx as usize].clone()),
                ExternKind::Table => match &inst.table {
                    Some(t) => ExportValue::Table(t.clone()),
                    None => continue,
                },
                ExternKind::Mem => match &inst.memory {
                    Some(m) => ExportValue::Memory(m.clone()),
                    None => continue,
                },
                ExternKind::Global => ExportValue::Global(inst.globals[export.idx as usize].clone()),
            };
            inst.exports.insert(name.clone(), value);
        }

        if let Some(start) = module.start {
            let func = inst.functions[start as usize].clone();
            match inst.invoke(&func, &[]) {
                Ok(_) => {}
                Err(Error::Trap(msg)) => return Err(Error::Uninstantiable(msg)),
                Err(e) => return Err(e),
            }
        }

        Ok(inst)
    }

    /// Look up an exported function by name.
    pub fn function(&self, name: &str) -> Result<&RuntimeFunction, Error> {
        match self.exports.get(name) {
            Some(ExportValue::Function(f)) => Ok(f),
            _ => Err(Error::Link(FUNC_LOOKUP_FAILED)),
        }
    }

    /// Look up an exported global by name.
    pub fn global(&self, name: &str) -> Option<Rc<WasmGlobal>> {
        match self.exports.get(name) {
            Some(ExportValue::Global(g)) => Some(g.clone()),
            _ => None,
        }
    }

    /// The instance's linear memory, if the module declares or imports one.
    pub fn memory(&self) -> Option<Rc<RefCell<WasmMemory>>> {
        self.memory.clone()
    }

    /// Invoke an exported function by name.
    pub fn call(&self, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, Error> {
        let func = self.function(name)?.clone();
        self.invoke(&func, args)
    }

    pub fn invoke(&self, func: &RuntimeFunction, args: &[WasmValue]) -> Result<Option<WasmValue>, Error> {
        check_interrupt()?;
        if func.n_params() != args.len() {
            return Err(Error::Trap(INVALID_NUM_ARG));
        }
        match func {
            RuntimeFunction::Wasm { sig, body_start, locals_count } => {
                let mut stack: Vec<WasmValue> = Vec::with_capacity(1024);
                stack.extend_from_slice(args);
                let mut control: Vec<ControlFrame> = Vec::new();
                let mut calls: Vec<CallFrame> = Vec::new();
                let pc = Self::push_call(sig, *body_start, *locals_count, &mut stack, &mut control, &mut calls, 0)?;
                self.interpret(pc, &mut stack, &mut control, &mut calls)?;
                if sig.has_result() {
                    Ok(stack.pop())
                } else {
                    Ok(None)
                }
            }
            RuntimeFunction::Host { callback, .. } => callback(args),
        }
    }

    fn eval_const(module: &Module, pc: &mut usize, globals: &[Rc<WasmGlobal>]) -> Result<WasmValue, Error> {
        let bytes: &[u8] = &module.bytes;
        let op = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
        *pc += 1;
        let value = match op {
            0x41 => WasmValue::from_i32(sleb(bytes, pc)?),
            0x42 => WasmValue::from_i64(sleb(bytes, pc)?),
            0x43 => {
                let raw = bytes.get(*pc..*pc + 4).ok_or(Error::Malformed(UNEXPECTED_END))?;
                *pc += 4;
                WasmValue::from_f32_bits(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            0x44 => {
                let raw = bytes.get(*pc..*pc + 8).ok_or(Error::Malformed(UNEXPECTED_END))?;
                *pc += 8;
                WasmValue::from_f64_bits(u64::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ]))
            }
            0x23 => {
                let gi: u32 = uleb(bytes, pc)?;
                globals.get(gi as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?.get()
            }
            _ => return Err(Error::Validation(CONST_EXP_REQUIRED)),
        };
        if *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))? != 0x0b {
            return Err(Error::Validation(CONST_EXP_REQUIRED));
        }
        *pc += 1;
        Ok(value)
    }

    /// Set up a wasm function activation: reserve locals, push the return
    /// frame, and hand back the body's start pc.
    #[inline]
    fn push_call(
        sig: &Signature,
        body_start: usize,
        locals_count: usize,
        stack: &mut Vec<WasmValue>,
        control: &mut Vec<ControlFrame>,
        calls: &mut Vec<CallFrame>,
        return_pc: usize,
    ) -> Result<usize, Error> {
        check_interrupt()?;
        if calls.len() >= MAX_CALL_DEPTH || control.len() >= MAX_CONTROL_DEPTH {
            return Err(Error::Trap(STACK_EXHAUSTED));
        }
        let n_params = sig.n_params();
        if stack.len() < n_params {
            return Err(Error::Trap(STACK_UNDERFLOW));
        }
        let locals_base = stack.len() - n_params;
        stack.resize(stack.len() + locals_count, WasmValue::default());
        control.push(ControlFrame {
            stack_len: locals_base,
            dest_pc: return_pc,
            arity: sig.has_result() as u32,
            has_result: sig.has_result(),
        });
        calls.push(CallFrame { locals_base, frame_idx: control.len() - 1 });
        Ok(body_start)
    }

    #[inline]
    fn call_host(callback: &HostCallback, sig: &Signature, stack: &mut Vec<WasmValue>) -> Result<(), Error> {
        check_interrupt()?;
        let n_params = sig.n_params();
        if stack.len() < n_params {
            return Err(Error::Trap(STACK_UNDERFLOW));
        }
        let params_start = stack.len() - n_params;
        let result = callback(&stack[params_start..])?;
        stack.truncate(params_start);
        if let Some(v) = result {
            stack.push(v);
        }
        Ok(())
    }

    /// Retire call activations whose control frame was unwound by a branch.
    /// A branch to a function's own label pops that function's return frame,
    /// so the call frame above `control_len` must go with it.
    #[inline]
    fn unwind_calls(calls: &mut Vec<CallFrame>, control_len: usize) {
        while calls.last().is_some_and(|c| c.frame_idx >= control_len) {
            calls.pop();
        }
    }

    /// Unwind `depth` labels: truncate the control stack, carry the target's
    /// result values, and jump to its destination. Returns true once the
    /// control stack is empty, i.e. the outermost activation returned.
    #[inline]
    fn take_branch(
        pc: &mut usize,
        stack: &mut Vec<WasmValue>,
        control: &mut Vec<ControlFrame>,
        depth: u32,
    ) -> bool {
        let len = control.len();
        if depth as usize >= len {
            return true;
        }
        control.truncate(len - depth as usize);
        let Some(target) = control.pop() else { return true };
        let arity = target.arity as usize;
        if arity > 0 {
            let src_start = stack.len().saturating_sub(arity);
            if src_start > target.stack_len {
                stack.copy_within(src_start.., target.stack_len);
            }
            stack.truncate(target.stack_len + arity);
        } else {
            stack.truncate(target.stack_len);
        }
        *pc = target.dest_pc;
        control.is_empty()
    }

    fn interpret(
        &self,
        mut pc: usize,
        stack: &mut Vec<WasmValue>,
        control: &mut Vec<ControlFrame>,
        calls: &mut Vec<CallFrame>,
    ) -> Result<(), Error> {
        let bytes: &[u8] = &self.module.bytes;
        let side = &self.module.side_table;
        let types = &self.module.types;
        let mem = self.memory.as_ref();
        let tab = self.table.as_ref();

        macro_rules! next_op { () => {{ let byte = bytes[pc]; pc += 1; byte }} }
        macro_rules! pop_val { () => {{
            match stack.pop() { Some(v) => v, None => return Err(Error::Trap(STACK_UNDERFLOW)) }
        }} }
        macro_rules! binary {
            ($type:ident, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a $op b));
                }
            }};
            ($type:ident, .$method:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.$method(b)));
                }
            }};
        }
        macro_rules! compare {
            ($type:ident, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::from_u32((a $op b) as u32));
                }
            }};
        }
        macro_rules! shift {
            ($type:ident, $bits:literal, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]() % $bits;
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a $op b));
                }
            }};
        }
        macro_rules! shr_s {
            ($int:ident, $uint:ident, $bits:literal) => {{
                paste! {
                    let b = pop_val!().[<as_ $uint>]() % $bits;
                    let a = pop_val!().[<as_ $int>]();
                    stack.push(WasmValue::[<from_ $int>](a >> b));
                }
            }};
        }
        macro_rules! rotate {
            ($type:ident, $bits:literal, $dir:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.[<rotate_ $dir>]((b % $bits) as u32)));
                }
            }};
        }
        macro_rules! unary {
            ($type:ident, $f:expr) => {{
                paste! {
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>]($f(a)));
                }
            }};
        }
        macro_rules! minmax {
            ($type:ident, min) => {{ minmax!(@impl $type, min, true) }};
            ($type:ident, max) => {{ minmax!(@impl $type, max, false) }};
            (@impl $type:ident, $op:ident, $want_negative:literal) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    let result = if a.is_nan() {
                        a
                    } else if b.is_nan() {
                        b
                    } else if a == b && a == 0.0 {
                        // min prefers the negative zero, max the positive one
                        const SIGN_BIT_SHIFT: usize = std::mem::size_of::<$type>() * 8 - 1;
                        let a_has_sign = a.to_bits() >> SIGN_BIT_SHIFT != 0;
                        if a_has_sign == $want_negative { a } else { b }
                    } else {
                        a.$op(b)
                    };
                    stack.push(WasmValue::[<from_ $type>](result));
                }
            }};
        }
        macro_rules! copysign {
            ($type:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.copysign(b)));
                }
            }};
        }
        macro_rules! nearest {
            ($type:ident) => {{
                paste! {
                    let x = pop_val!().[<as_ $type>]();
                    // round half to even
                    let y = if x.is_nan() || x.is_infinite() {
                        x
                    } else {
                        let lower = x.floor();
                        let upper = x.ceil();
                        let dl = x - lower;
                        let du = upper - x;
                        if dl < du {
                            lower
                        } else if dl > du {
                            upper
                        } else if (lower % 2.0) == 0.0 {
                            lower
                        } else {
                            upper
                        }
                    };
                    stack.push(WasmValue::[<from_ $type>](y));
                }
            }};
        }
        macro_rules! convert {
            ($src:ident -> $dst:ident) => {{
                paste! {
                    let v = pop_val!().[<as_ $src>]();
                    stack.push(WasmValue::[<from_ $dst>](v as $dst));
                }
            }};
        }
        macro_rules! trunc {
            ($src:ident -> $dst:ident : $min:expr, $max:expr) => {{
                paste! {
                    let x = pop_val!().[<as_ $src>]();
                    if !x.is_finite() {
                        if x.is_nan() {
                            return Err(Error::Trap(INVALID_CONV_TO_INT));
                        }
                        return Err(Error::Trap(INTEGER_OVERFLOW));
                    }
                    if x <= $min || x >= $max {
                        return Err(Error::Trap(INTEGER_OVERFLOW));
                    }
                    stack.push(WasmValue::[<from_ $dst>](x as $dst));
                }
            }};
        }
        macro_rules! div_s {
            ($int:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $int>]();
                    let a = pop_val!().[<as_ $int>]();
                    if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
                    if a == $int::MIN && b == -1 { return Err(Error::Trap(INTEGER_OVERFLOW)); }
                    stack.push(WasmValue::[<from_ $int>](a / b));
                }
            }};
        }
        macro_rules! div_u {
            ($uint:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $uint>]();
                    let a = pop_val!().[<as_ $uint>]();
                    if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
                    stack.push(WasmValue::[<from_ $uint>](a / b));
                }
            }};
        }
        macro_rules! rem_s {
            ($int:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $int>]();
                    let a = pop_val!().[<as_ $int>]();
                    if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
                    if a == $int::MIN && b == -1 {
                        stack.push(WasmValue::[<from_ $int>](0));
                    } else {
                        stack.push(WasmValue::[<from_ $int>](a % b));
                    }
                }
            }};
        }
        macro_rules! rem_u {
            ($uint:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $uint>]();
                    let a = pop_val!().[<as_ $uint>]();
                    if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
                    stack.push(WasmValue::[<from_ $uint>](a % b));
                }
            }};
        }
        macro_rules! load { ($method:ident, $push:expr) => {{
            let _align: u32 = uleb(bytes, &mut pc)?;
            let offset: u32 = uleb(bytes, &mut pc)?;
            let addr = pop_val!().as_u32();
            let mem = mem.ok_or(Error::Validation(UNKNOWN_MEMORY))?;
            let v = mem.borrow().$method(addr, offset)?;
            stack.push(($push)(v));
        }}}
        macro_rules! store { ($method:ident, $from:expr) => {{
            let _align: u32 = uleb(bytes, &mut pc)?;
            let offset: u32 = uleb(bytes, &mut pc)?;
            let raw = pop_val!();
            let addr = pop_val!().as_u32();
            let mem = mem.ok_or(Error::Validation(UNKNOWN_MEMORY))?;
            mem.borrow_mut().$method(addr, offset, ($from)(raw))?;
        }}}

        loop {
            if pc >= bytes.len() {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            match next_op!() {
                0x00 => return Err(Error::Trap(UNREACHABLE)),
                0x01 | 0xbc | 0xbd | 0xbe | 0xbf => {} // nop and reinterprets (no-op on raw cells)
                0x02 => { // block
                    let op_pc = pc - 1;
                    let result = Signature::read_blocktype(types, bytes, &mut pc)?;
                    let target = side.target(op_pc)?;
                    control.push(ControlFrame {
                        stack_len: stack.len(),
                        dest_pc: target.end_target,
                        arity: result.is_some() as u32,
                        has_result: result.is_some(),
                    });
                }
                0x03 => { // loop: every iteration re-enters here, so this is the back-edge checkpoint
                    check_interrupt()?;
                    let op_pc = pc - 1;
                    let result = Signature::read_blocktype(types, bytes, &mut pc)?;
                    control.push(ControlFrame {
                        stack_len: stack.len(),
                        dest_pc: op_pc,
                        arity: 0,
                        has_result: result.is_some(),
                    });
                }
                0x04 => { // if
                    let op_pc = pc - 1;
                    let result = Signature::read_blocktype(types, bytes, &mut pc)?;
                    let target = side.target(op_pc)?;
                    let cond = pop_val!().as_u32();
                    control.push(ControlFrame {
                        stack_len: stack.len(),
                        dest_pc: target.end_target,
                        arity: result.is_some() as u32,
                        has_result: result.is_some(),
                    });
                    if cond == 0 {
                        pc = target.else_target;
                    }
                }
                0x05 => { // else: the then-arm finished, jump past end
                    let _ = Self::take_branch(&mut pc, stack, control, 0);
                }
                0x0b => { // end
                    if let Some(call) = calls.last() {
                        if call.frame_idx == control.len().saturating_sub(1) {
                            // function boundary
                            let done = Self::take_branch(&mut pc, stack, control, 0);
                            calls.pop();
                            if done {
                                return Ok(());
                            }
                            continue;
                        }
                    }
                    match control.pop() {
                        Some(frame) => {
                            if frame.has_result {
                                let result = *stack.last().ok_or(Error::Trap(STACK_UNDERFLOW))?;
                                stack.truncate(frame.stack_len);
                                stack.push(result);
                            } else {
                                stack.truncate(frame.stack_len);
                            }
                        }
                        None => return Ok(()),
                    }
                }
                0x0c => { // br
                    let depth: u32 = uleb(bytes, &mut pc)?;
                    let done = Self::take_branch(&mut pc, stack, control, depth);
                    Self::unwind_calls(calls, control.len());
                    if done {
                        return Ok(());
                    }
                }
                0x0d => { // br_if
                    let depth: u32 = uleb(bytes, &mut pc)?;
                    let cond = pop_val!().as_u32();
                    if cond != 0 {
                        let done = Self::take_branch(&mut pc, stack, control, depth);
                        Self::unwind_calls(calls, control.len());
                        if done {
                            return Ok(());
                        }
                    }
                }
                0x0e => { // br_table
                    let v = pop_val!().as_u32();
                    let n_targets: u32 = uleb(bytes, &mut pc)?;
                    let mut depth = u32::MAX;
                    for i in 0..n_targets {
                        let t: u32 = uleb(bytes, &mut pc)?;
                        if i == v {
                            depth = t;
                        }
                    }
                    let default_target: u32 = uleb(bytes, &mut pc)?;
                    if depth == u32::MAX {
                        depth = default_target;
                    }
                    let done = Self::take_branch(&mut pc, stack, control, depth);
                    Self::unwind_calls(calls, control.len());
                    if done {
                        return Ok(());
                    }
                }
                0x0f => { // return
                    let Some(call) = calls.last() else { return Ok(()) };
                    let depth = (control.len() - 1).saturating_sub(call.frame_idx) as u32;
                    let done = Self::take_branch(&mut pc, stack, control, depth);
                    Self::unwind_calls(calls, control.len());
                    if done {
                        return Ok(());
                    }
                }
                0x10 => { // call
                    let fi: u32 = uleb(bytes, &mut pc)?;
                    match &self.functions[fi as usize] {
                        RuntimeFunction::Wasm { sig, body_start, locals_count } => {
                            pc = Self::push_call(sig, *body_start, *locals_count, stack, control, calls, pc)?;
                        }
                        RuntimeFunction::Host { callback, sig } => {
                            Self::call_host(callback, sig, stack)?;
                        }
                    }
                }
                0x11 => { // call_indirect
                    let type_idx: u32 = uleb(bytes, &mut pc)?;
                    pc += 1; // zero flag, checked at scan time
                    let elem_idx = pop_val!().as_u32();
                    let table_rc = tab.ok_or(Error::Trap(UNDEF_ELEM))?;
                    let func_idx = match table_rc.borrow().get(elem_idx)? {
                        Some(idx) => idx as usize,
                        None => return Err(Error::Trap(UNINITIALIZED_ELEM)),
                    };
                    let callee = self
                        .functions
                        .get(func_idx)
                        .ok_or(Error::Trap(UNDEF_ELEM))?;
                    if *callee.signature() != self.module.types[type_idx as usize] {
                        return Err(Error::Trap(INDIRECT_CALL_MISMATCH));
                    }
                    match callee {
                        RuntimeFunction::Wasm { sig, body_start, locals_count } => {
                            pc = Self::push_call(sig, *body_start, *locals_count, stack, control, calls, pc)?;
                        }
                        RuntimeFunction::Host { callback, sig } => {
                            Self::call_host(callback, sig, stack)?;
                        }
                    }
                }
                0x1a => { // drop
                    pop_val!();
                }
                0x1b => { // select
                    let cond = pop_val!().as_u32();
                    let v2 = pop_val!();
                    let v1 = pop_val!();
                    stack.push(if cond != 0 { v1 } else { v2 });
                }
                0x20 => { // local.get
                    let local: u32 = uleb(bytes, &mut pc)?;
                    let base = calls.last().map(|c| c.locals_base).unwrap_or(0);
                    // the slot can sit below a drained operand region
                    let val = stack
                        .get(base + local as usize)
                        .copied()
                        .ok_or(Error::Trap(STACK_UNDERFLOW))?;
                    stack.push(val);
                }
                0x21 => { // local.set
                    let local: u32 = uleb(bytes, &mut pc)?;
                    let val = pop_val!();
                    let base = calls.last().map(|c| c.locals_base).unwrap_or(0);
                    *stack.get_mut(base + local as usize).ok_or(Error::Trap(STACK_UNDERFLOW))? =
                        val;
                }
                0x22 => { // local.tee
                    let local: u32 = uleb(bytes, &mut pc)?;
                    let val = *stack.last().ok_or(Error::Trap(STACK_UNDERFLOW))?;
                    let base = calls.last().map(|c| c.locals_base).unwrap_or(0);
                    *stack.get_mut(base + local as usize).ok_or(Error::Trap(STACK_UNDERFLOW))? =
                        val;
                }
                0x23 => { // global.get
                    let gi: u32 = uleb(bytes, &mut pc)?;
                    let g = self.globals.get(gi as usize).ok_or(Error::Trap(UNKNOWN_GLOBAL))?;
                    stack.push(g.get());
                }
                0x24 => { // global.set
                    let gi: u32 = uleb(bytes, &mut pc)?;
                    let val = pop_val!();
                    let g = self.globals.get(gi as usize).ok_or(Error::Trap(UNKNOWN_GLOBAL))?;
                    g.store(val);
                }
                // loads
                0x28 => { load!(load_u32, |v: u32| WasmValue::from_u32(v)); }
                0x29 => { load!(load_u64, |v: u64| WasmValue::from_u64(v)); }
                0x2a => { load!(load_f32, |v: f32| WasmValue::from_f32(v)); }
                0x2b => { load!(load_f64, |v: f64| WasmValue::from_f64(v)); }
                0x2c => { load!(load_i8,  |v: i8| WasmValue::from_i32(v as i32)); }
                0x2d => { load!(load_u8,  |v: u8| WasmValue::from_u32(v as u32)); }
                0x2e => { load!(load_i16, |v: i16| WasmValue::from_i32(v as i32)); }
                0x2f => { load!(load_u16, |v: u16| WasmValue::from_u32(v as u32)); }
                0x30 => { load!(load_i8,  |v: i8| WasmValue::from_i64(v as i64)); }
                0x31 => { load!(load_u8,  |v: u8| WasmValue::from_u64(v as u64)); }
                0x32 => { load!(load_i16, |v: i16| WasmValue::from_i64(v as i64)); }
                0x33 => { load!(load_u16, |v: u16| WasmValue::from_u64(v as u64)); }
                0x34 => { load!(load_i32, |v: i32| WasmValue::from_i64(v as i64)); }
                0x35 => { load!(load_u32, |v: u32| WasmValue::from_u64(v as u64)); }
                // stores
                0x36 => { store!(store_u32, |w: WasmValue| w.as_u32()); }
                0x37 => { store!(store_u64, |w: WasmValue| w.as_u64()); }
                0x38 => { store!(store_f32, |w: WasmValue| w.as_f32()); }
                0x39 => { store!(store_f64, |w: WasmValue| w.as_f64()); }
                0x3a => { store!(store_u8,  |w: WasmValue| w.as_u32() as u8); }
                0x3b => { store!(store_u16, |w: WasmValue| w.as_u32() as u16); }
                0x3c => { store!(store_u8,  |w: WasmValue| w.as_u64() as u8); }
                0x3d => { store!(store_u16, |w: WasmValue| w.as_u64() as u16); }
                0x3e => { store!(store_u32, |w: WasmValue| w.as_u64() as u32); }
                0x3f => { // memory.size
                    pc += 1;
                    let mem = mem.ok_or(Error::Validation(UNKNOWN_MEMORY))?;
                    stack.push(WasmValue::from_u32(mem.borrow().size()));
                }
                0x40 => { // memory.grow
                    pc += 1;
                    let delta = pop_val!().as_u32();
                    let mem = mem.ok_or(Error::Validation(UNKNOWN_MEMORY))?;
                    let old = mem.borrow_mut().grow(delta);
                    stack.push(WasmValue::from_u32(old));
                }
                // constants
                0x41 => { stack.push(WasmValue::from_i32(sleb(bytes, &mut pc)?)); }
                0x42 => { stack.push(WasmValue::from_i64(sleb(bytes, &mut pc)?)); }
                0x43 => {
                    let raw = bytes.get(pc..pc + 4).ok_or(Error::Malformed(UNEXPECTED_END))?;
                    stack.push(WasmValue::from_f32_bits(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])));
                    pc += 4;
                }
                0x44 => {
                    let raw = bytes.get(pc..pc + 8).ok_or(Error::Malformed(UNEXPECTED_END))?;
                    stack.push(WasmValue::from_f64_bits(u64::from_le_bytes([
                        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                    ])));
                    pc += 8;
                }
                // i32 comparison
                0x45 => { unary!(u32, |x: u32| (x == 0) as u32); }
                0x46 => { compare!(u32, ==); }
                0x47 => { compare!(u32, !=); }
                0x48 => { compare!(i32, <); }
                0x49 => { compare!(u32, <); }
                0x4a => { compare!(i32, >); }
                0x4b => { compare!(u32, >); }
                0x4c => { compare!(i32, <=); }
                0x4d => { compare!(u32, <=); }
                0x4e => { compare!(i32, >=); }
                0x4f => { compare!(u32, >=); }
                // i64 comparison
                0x50 => {
                    let v = pop_val!().as_u64();
                    stack.push(WasmValue::from_u32((v == 0) as u32));
                }
                0x51 => { compare!(u64, ==); }
                0x52 => { compare!(u64, !=); }
                0x53 => { compare!(i64, <); }
                0x54 => { compare!(u64, <); }
                0x55 => { compare!(i64, >); }
                0x56 => { compare!(u64, >); }
                0x57 => { compare!(i64, <=); }
                0x58 => { compare!(u64, <=); }
                0x59 => { compare!(i64, >=); }
                0x5a => { compare!(u64, >=); }
                // f32 comparison
                0x5b => { compare!(f32, ==); }
                0x5c => { compare!(f32, !=); }
                0x5d => { compare!(f32, <); }
                0x5e => { compare!(f32, >); }
                0x5f => { compare!(f32, <=); }
                0x60 => { compare!(f32, >=); }
                // f64 comparison
                0x61 => { compare!(f64, ==); }
                0x62 => { compare!(f64, !=); }
                0x63 => { compare!(f64, <); }
                0x64 => { compare!(f64, >); }
                0x65 => { compare!(f64, <=); }
                0x66 => { compare!(f64, >=); }
                // i32 arithmetic
                0x67 => { unary!(u32, |x: u32| x.leading_zeros()); }
                0x68 => { unary!(u32, |x: u32| x.trailing_zeros()); }
                0x69 => { unary!(u32, |x: u32| x.count_ones()); }
                0x6a => { binary!(u32, .wrapping_add); }
                0x6b => { binary!(u32, .wrapping_sub); }
                0x6c => { binary!(u32, .wrapping_mul); }
                0x6d => { div_s!(i32); }
                0x6e => { div_u!(u32); }
                0x6f => { rem_s!(i32); }
                0x70 => { rem_u!(u32); }
                0x71 => { binary!(u32, &); }
                0x72 => { binary!(u32, |); }
                0x73 => { binary!(u32, ^); }
                0x74 => { shift!(u32, 32, <<); }
                0x75 => { shr_s!(i32, u32, 32); }
                0x76 => { shift!(u32, 32, >>); }
                0x77 => { rotate!(u32, 32, left); }
                0x78 => { rotate!(u32, 32, right); }
                // i64 arithmetic
                0x79 => { unary!(u64, |x: u64| x.leading_zeros() as u64); }
                0x7a => { unary!(u64, |x: u64| x.trailing_zeros() as u64); }
                0x7b => { unary!(u64, |x: u64| x.count_ones() as u64); }
                0x7c => { binary!(u64, .wrapping_add); }
                0x7d => { binary!(u64, .wrapping_sub); }
                0x7e => { binary!(u64, .wrapping_mul); }
                0x7f => { div_s!(i64); }
                0x80 => { div_u!(u64); }
                0x81 => { rem_s!(i64); }
                0x82 => { rem_u!(u64); }
                0x83 => { binary!(u64, &); }
                0x84 => { binary!(u64, |); }
                0x85 => { binary!(u64, ^); }
                0x86 => { shift!(u64, 64, <<); }
                0x87 => { shr_s!(i64, u64, 64); }
                0x88 => { shift!(u64, 64, >>); }
                0x89 => { rotate!(u64, 64, left); }
                0x8a => { rotate!(u64, 64, right); }
                // f32 arithmetic
                0x8b => { unary!(f32, |x: f32| x.abs()); }
                0x8c => { unary!(f32, |x: f32| -x); }
                0x8d => { unary!(f32, |x: f32| x.ceil()); }
                0x8e => { unary!(f32, |x: f32| x.floor()); }
                0x8f => { unary!(f32, |x: f32| x.trunc()); }
                0x90 => { nearest!(f32); }
                0x91 => { unary!(f32, |x: f32| x.sqrt()); }
                0x92 => { binary!(f32, +); }
                0x93 => { binary!(f32, -); }
                0x94 => { binary!(f32, *); }
                0x95 => { binary!(f32, /); }
                0x96 => { minmax!(f32, min); }
                0x97 => { minmax!(f32, max); }
                0x98 => { copysign!(f32); }
                // f64 arithmetic
                0x99 => { unary!(f64, |x: f64| x.abs()); }
                0x9a => { unary!(f64, |x: f64| -x); }
                0x9b => { unary!(f64, |x: f64| x.ceil()); }
                0x9c => { unary!(f64, |x: f64| x.floor()); }
                0x9d => { unary!(f64, |x: f64| x.trunc()); }
                0x9e => { nearest!(f64); }
                0x9f => { unary!(f64, |x: f64| x.sqrt()); }
                0xa0 => { binary!(f64, +); }
                0xa1 => { binary!(f64, -); }
                0xa2 => { binary!(f64, *); }
                0xa3 => { binary!(f64, /); }
                0xa4 => { minmax!(f64, min); }
                0xa5 => { minmax!(f64, max); }
                0xa6 => { copysign!(f64); }
                // conversions
                0xa7 => { convert!(u64 -> u32); }
                0xa8 => { trunc!(f32 -> i32 : -2147483777.0, 2147483648.0); }
                0xa9 => { trunc!(f32 -> u32 : -1.0, 4294967296.0); }
                0xaa => { trunc!(f64 -> i32 : -2147483649.0, 2147483648.0); }
                0xab => { trunc!(f64 -> u32 : -1.0, 4294967296.0); }
                0xac => { convert!(i32 -> i64); }
                0xad => { convert!(u32 -> u64); }
                0xae => { trunc!(f32 -> i64 : -9223373136366404000.0, 9223372036854776000.0); }
                0xaf => { trunc!(f32 -> u64 : -1.0, 18446744073709552000.0); }
                0xb0 => { trunc!(f64 -> i64 : -9223372036854777856.0, 9223372036854776000.0); }
                0xb1 => { trunc!(f64 -> u64 : -1.0, 18446744073709552000.0); }
                0xb2 => { convert!(i32 -> f32); }
                0xb3 => { convert!(u32 -> f32); }
                0xb4 => { convert!(i64 -> f32); }
                0xb5 => { convert!(u64 -> f32); }
                0xb6 => { convert!(f64 -> f32); }
                0xb7 => { convert!(i32 -> f64); }
                0xb8 => { convert!(u32 -> f64); }
                0xb9 => { convert!(i64 -> f64); }
                0xba => { convert!(u64 -> f64); }
                0xbb => { convert!(f32 -> f64); }
                _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
            }
        }
    }
}
