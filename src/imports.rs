//! Resolution of imports at link time.
//!
//! An [`ImportEnvironment`] is the set of named modules a module sees while
//! it is being linked. Anything that can answer lookups for functions and
//! memories can act as a module here by implementing [`ImportModule`]; a
//! fully linked [`crate::instance::ModuleInstance`] is the usual
//! implementation, and [`ImportMultiModule`] combines several with
//! first-match-wins shadowing.

use crate::func::LinkedFunc;
use crate::memory::{Memory, Pages};
use crate::module::{ExternKind, Import};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// The reason an individual import could not be linked.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LinkErrorKind {
    /// No export with the imported name was found.
    #[error("not found")]
    NotFound,
    /// An export with the imported name exists but is the wrong kind of
    /// entity.
    #[error("has wrong type: expected {expected}, but found {found}")]
    WrongKind {
        /// The kind the import requires.
        expected: ExternKind,
        /// The kind of the export that was found.
        found: ExternKind,
    },
    /// The imported function's signature differs from the declared one.
    #[error("has wrong signature")]
    WrongSignature,
    /// The supplied memory is shared but was imported as unshared.
    #[error("was shared, but was imported as unshared")]
    SharedAsUnshared,
    /// The supplied memory is unshared but was imported as shared.
    #[error("was unshared, but was imported as shared")]
    UnsharedAsShared,
    /// The supplied memory is smaller than the import's minimum size.
    #[error("is smaller than the import's minimum size ({actual} pages < {expected} pages)")]
    MemoryTooSmall {
        /// The minimum size the import requires, in pages.
        expected: Pages,
        /// The size of the supplied memory, in pages.
        actual: Pages,
    },
    /// The supplied memory can grow beyond the import's maximum size.
    #[error("has a larger max size than the import's maximum size ({actual} pages > {expected} pages)")]
    MemoryMaxTooLarge {
        /// The maximum capacity the import permits, in pages.
        expected: Pages,
        /// The maximum capacity of the supplied memory, in pages.
        actual: Pages,
    },
}

/// An error linking one import of a WebAssembly module.
///
/// Link errors are recoverable: the caller keeps the sandbox and may retry
/// with a different import environment. The partially built instance is
/// discarded.
#[derive(Clone, Debug, Error)]
#[error("imported {} `{}.{}` {}", .import.kind, .import.module, .import.name, .kind)]
pub struct LinkError {
    import: Import,
    kind: LinkErrorKind,
}

impl LinkError {
    /// Creates a link error for the given import.
    pub fn new(import: Import, kind: LinkErrorKind) -> LinkError {
        LinkError { import, kind }
    }

    /// Returns the import that could not be linked.
    pub fn import(&self) -> &Import {
        &self.import
    }

    /// Returns the reason the import could not be linked.
    pub fn kind(&self) -> &LinkErrorKind {
        &self.kind
    }
}

/// An object that can be imported as a WebAssembly module.
pub trait ImportModule {
    /// Finds the function matching the import's name.
    ///
    /// Returns `Ok(None)` if this module has no export with that name, and
    /// a [`LinkError`] if the name resolves to something other than a
    /// function.
    fn find_func(&self, import: &Import) -> Result<Option<&LinkedFunc>, LinkError>;

    /// Finds the linear memory matching the import's name.
    ///
    /// Returns `Ok(None)` if this module has no export with that name, and
    /// a [`LinkError`] if the name resolves to something other than a
    /// memory.
    fn find_memory(&self, import: &Import) -> Result<Option<Arc<Memory>>, LinkError>;
}

/// Several modules presented as one.
///
/// Lookups try each module in order and take the first hit, which models
/// shadowing and fallback between overlapping modules.
pub struct ImportMultiModule<'a> {
    modules: Vec<&'a dyn ImportModule>,
}

impl<'a> ImportMultiModule<'a> {
    /// Combines the given modules, earliest taking precedence.
    pub fn new(modules: Vec<&'a dyn ImportModule>) -> ImportMultiModule<'a> {
        ImportMultiModule { modules }
    }
}

impl ImportModule for ImportMultiModule<'_> {
    fn find_func(&self, import: &Import) -> Result<Option<&LinkedFunc>, LinkError> {
        for module in &self.modules {
            if let Some(func) = module.find_func(import)? {
                return Ok(Some(func));
            }
        }
        Ok(None)
    }

    fn find_memory(&self, import: &Import) -> Result<Option<Arc<Memory>>, LinkError> {
        for module in &self.modules {
            if let Some(memory) = module.find_memory(import)? {
                return Ok(Some(memory));
            }
        }
        Ok(None)
    }
}

/// The set of named modules a module is linked against.
#[derive(Default)]
pub struct ImportEnvironment<'a> {
    modules: HashMap<String, &'a dyn ImportModule>,
}

impl<'a> ImportEnvironment<'a> {
    /// Creates an empty import environment.
    pub fn new() -> ImportEnvironment<'a> {
        ImportEnvironment::default()
    }

    /// Makes a module visible under the given name.
    ///
    /// A module already registered under the name is replaced; combine
    /// modules with [`ImportMultiModule`] instead if both should stay
    /// visible.
    pub fn add_module(&mut self, name: impl Into<String>, module: &'a dyn ImportModule) {
        self.modules.insert(name.into(), module);
    }

    /// Finds the module an import refers to, if one is registered.
    pub fn find_module(&self, import: &Import) -> Option<&'a dyn ImportModule> {
        self.modules.get(&import.module).copied()
    }

    /// Finds the function matching an import, or `Ok(None)` if the module
    /// or export does not exist.
    pub fn find_func(&self, import: &Import) -> Result<Option<&LinkedFunc>, LinkError> {
        match self.find_module(import) {
            Some(module) => module.find_func(import),
            None => Ok(None),
        }
    }

    /// Finds the linear memory matching an import, or `Ok(None)` if the
    /// module or export does not exist.
    pub fn find_memory(&self, import: &Import) -> Result<Option<Arc<Memory>>, LinkError> {
        match self.find_module(import) {
            Some(module) => module.find_memory(import),
            None => Ok(None),
        }
    }
}
