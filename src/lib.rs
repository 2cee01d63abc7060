//! A compact, sandboxed WebAssembly runtime core.
//!
//! This crate owns the host-side data model of a WebAssembly runtime and
//! the machinery that turns a parsed module into an executable, sandboxed
//! instance. Instantiation runs in three stages:
//!
//! 1. an external parser produces an [`AbstractModule`] — a plain
//!    description of imports, exports, functions and linear memories;
//! 2. [`Module::new`] lowers it into an [`Environment`] (the sandbox),
//!    interning function signatures for pointer-equality checks and eagerly
//!    allocating shared linear memories;
//! 3. [`ModuleInstance::instantiate`] resolves the imports against an
//!    [`ImportEnvironment`], allocates per-instance state, and wires the
//!    raw per-slot tables that JIT-compiled code reads through
//!    [`vmcontext`].
//!
//! Parsing and validation, the interpreter, and code generation live
//! outside this crate; tables and globals have no runtime data path here.

#![warn(missing_docs)]

mod environment;
mod func;
mod imports;
mod instance;
mod memory;
mod module;
mod types;
pub mod vmcontext;

pub use crate::environment::Environment;
pub use crate::func::{
    AbstractFunc, InstructionCursor, InstructionStream, LinkedFunc, UnlinkedFunc,
};
pub use crate::imports::{
    ImportEnvironment, ImportModule, ImportMultiModule, LinkError, LinkErrorKind,
};
pub use crate::instance::{InstantiationError, ModuleInstance};
pub use crate::memory::{
    AbstractMemory, Memory, MemoryValue, Pages, WasmPtr, WASM_PAGE_SIZE,
};
pub use crate::module::{AbstractModule, Export, ExternKind, Import, Module};
pub use crate::types::{
    FuncSig, PrimitiveValType, SigRef, TypeTable, TypedValue, ValType, Value,
};
