#![deny(unsafe_code)]

//! A small pc-based WebAssembly MVP interpreter with cooperative,
//! host-triggered interruption. Any thread-local context may arm the
//! interrupt latch with [`request_interrupt`]; running code observes it at
//! well-defined checkpoints and unwinds with the "execution aborted" trap.

pub mod error;
pub mod instance;
pub mod interrupt;
pub mod leb128;
pub mod memory;
pub mod module;
pub mod reader;
pub mod scan;
pub mod types;
pub mod value;

pub use error::Error;
pub use instance::{
    ExportValue, Exports, HostCallback, Imports, Instance, ModuleImports, RuntimeFunction,
    WasmGlobal, WasmTable,
};
pub use interrupt::{poll_and_consume, request_interrupt, Poll};
pub use memory::WasmMemory;
pub use module::Module;
pub use types::{Signature, ValType};
pub use value::WasmValue;

// Debug tracing, compiled in only with the wasm_debug feature
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_println;
