//! The sandbox root.

use crate::types::TypeTable;

/// A single isolated WebAssembly sandbox.
///
/// Every environment is a completely independent WebAssembly world, and
/// nothing may cross the boundary between two of them:
///
/// - code instantiated in one sandbox cannot call code in another,
/// - references are only meaningful in the sandbox that created them,
/// - linear memory cannot be shared across sandboxes, even when marked
///   shared.
///
/// Modules and instances keep non-owning references to their environment,
/// so an environment must outlive everything created against it. Operations
/// taking several runtime objects assume they share a sandbox; violating
/// that is a contract breach with undefined results, not a checked error.
#[derive(Debug, Default)]
pub struct Environment {
    types: TypeTable,
}

impl Environment {
    /// Creates a fresh, empty sandbox.
    pub fn new() -> Environment {
        Environment::default()
    }

    /// Returns the table of deduplicated types for this sandbox.
    pub fn types(&self) -> &TypeTable {
        &self.types
    }
}
