//! Modules at their first two stages of instantiation.
//!
//! An [`AbstractModule`] is a plain description of a module's imports,
//! exports, functions and linear memories as produced by a parser. Lowering
//! it against a sandbox yields a [`Module`], which holds everything that can
//! be shared between instances: interned signatures, per-module function
//! bodies, and eagerly allocated shared memories. The final stage, the fully
//! linked instance, lives in [`crate::instance`].

use crate::environment::Environment;
use crate::func::{AbstractFunc, UnlinkedFunc};
use crate::memory::{AbstractMemory, Memory};
use crate::types::SigRef;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;

/// The kind of entity named by an import or export, with its binary
/// encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExternKind {
    /// A function.
    Func = 0x00,
    /// A table.
    Table = 0x01,
    /// A linear memory.
    Memory = 0x02,
    /// A global.
    Global = 0x03,
}

impl ExternKind {
    /// Decodes an extern kind from its binary-format byte.
    pub fn from_byte(byte: u8) -> Option<ExternKind> {
        match byte {
            0x00 => Some(ExternKind::Func),
            0x01 => Some(ExternKind::Table),
            0x02 => Some(ExternKind::Memory),
            0x03 => Some(ExternKind::Global),
            _ => None,
        }
    }

    /// Returns the binary-format byte for this kind.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExternKind::Func => "function",
            ExternKind::Table => "table",
            ExternKind::Memory => "memory",
            ExternKind::Global => "global",
        })
    }
}

/// An export of a WebAssembly module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// The name of the export.
    pub name: String,
    /// The kind of entity being exported.
    pub kind: ExternKind,
    /// The index of the exported entity in the module's list for its kind.
    pub index: usize,
}

impl Export {
    /// Creates an export.
    pub fn new(name: impl Into<String>, kind: ExternKind, index: usize) -> Export {
        Export {
            name: name.into(),
            kind,
            index,
        }
    }
}

/// An import of a WebAssembly module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    /// The name of the module to import from.
    pub module: String,
    /// The name of the export to import.
    pub name: String,
    /// The kind of entity being imported.
    pub kind: ExternKind,
    /// The slot the imported entity fills in the importing module's list
    /// for its kind.
    pub index: usize,
}

impl Import {
    /// Creates an import.
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        kind: ExternKind,
        index: usize,
    ) -> Import {
        Import {
            module: module.into(),
            name: name.into(),
            kind,
            index,
        }
    }
}

/// A parsed and validated module for which no runtime resources have been
/// allocated yet.
///
/// Each import's and export's `index` addresses the list matching its kind:
/// `memories` for memories, `funcs` for functions. Every import must address
/// a slot whose entry has `is_import` set, and every other slot describes
/// the entity defined there.
#[derive(Debug, Default)]
pub struct AbstractModule {
    /// The module's imports.
    pub imports: Vec<Import>,
    /// The module's exports.
    pub exports: Vec<Export>,
    /// The module's linear memories, defined and imported.
    pub memories: Vec<AbstractMemory>,
    /// The module's functions, defined and imported.
    pub funcs: Vec<AbstractFunc>,
}

/// A module lowered into a sandbox and partially instantiated.
///
/// Instances created from the same `Module` share its unlinked functions and
/// its shared linear memories; partial instantiation creates exactly those
/// shared resources and nothing else. Unshared memories are created per
/// instance, and imported slots stay empty until the linker fills them.
///
/// The module borrows its sandbox: the [`Environment`] passed to
/// [`Module::new`] must outlive the module and every instance made from it.
#[derive(Debug)]
pub struct Module {
    pub(crate) imports: Vec<Import>,
    pub(crate) exports: Vec<Export>,
    pub(crate) memories: Vec<AbstractMemory>,
    pub(crate) shared_memories: Vec<Option<Arc<Memory>>>,
    pub(crate) import_func_sigs: Vec<Option<SigRef>>,
    pub(crate) funcs: Vec<Option<Arc<UnlinkedFunc>>>,
    pub(crate) env: *const Environment,
}

impl Module {
    /// Lowers an abstract module into the given sandbox.
    ///
    /// Signatures are interned in the sandbox's type table; defined shared
    /// memories are allocated now so that every instance of this module
    /// observes the same memory. Allocation failure for a shared memory is
    /// returned as an error.
    pub fn new(abstract_mod: &AbstractModule, env: &Environment) -> Result<Module> {
        let import_func_sigs = abstract_mod
            .funcs
            .iter()
            .map(|func| func.is_import.then(|| env.types().intern(func.sig.clone())))
            .collect();

        let funcs = abstract_mod
            .funcs
            .iter()
            .map(|func| (!func.is_import).then(|| UnlinkedFunc::instantiate(func, env)))
            .collect();

        let shared_memories = abstract_mod
            .memories
            .iter()
            .map(|mem| {
                if mem.is_shared && !mem.is_import {
                    Memory::new(mem).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<_>>()
            .context("failed to allocate a shared linear memory")?;

        log::debug!(
            "lowered module: {} funcs, {} memories, {} imports, {} exports",
            abstract_mod.funcs.len(),
            abstract_mod.memories.len(),
            abstract_mod.imports.len(),
            abstract_mod.exports.len(),
        );

        Ok(Module {
            imports: abstract_mod.imports.clone(),
            exports: abstract_mod.exports.clone(),
            memories: abstract_mod.memories.clone(),
            shared_memories,
            import_func_sigs,
            funcs,
            env,
        })
    }

    /// Returns the sandbox this module was lowered into.
    pub fn env(&self) -> &Environment {
        unsafe { &*self.env }
    }

    /// Returns this module's unresolved imports.
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Returns this module's exports.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Returns the declared shapes of this module's linear memories.
    pub fn memories(&self) -> &[AbstractMemory] {
        &self.memories
    }

    /// Returns this module's functions, one entry per slot.
    ///
    /// Imported slots are `None`; they are filled per instance by the
    /// linker.
    pub fn funcs(&self) -> &[Option<Arc<UnlinkedFunc>>] {
        &self.funcs
    }

    /// Returns the expected signatures of imported functions, one entry per
    /// function slot.
    ///
    /// Slots holding defined functions are `None`.
    pub fn import_func_sigs(&self) -> &[Option<SigRef>] {
        &self.import_func_sigs
    }
}
