//! The `#[repr(C)]` records that JIT-compiled code accesses directly.
//!
//! Generated code chases these fields with fixed offsets and never calls
//! back into the runtime to do so, which is why every struct here must be
//! standard layout and must never be reordered. Each record carries a
//! `container` back-pointer to the runtime wrapper that owns it so that
//! libcalls can recover the full object from a raw record pointer.
//!
//! The layouts are pinned by the offset tests at the bottom of this file.

use crate::func::{LinkedFunc, UnlinkedFunc};
use crate::instance::ModuleInstance;
use crate::memory::{Memory, Pages};
use crate::types::FuncSig;

/// The calling convention for JIT-compiled function bodies.
///
/// The single argument is the record of the linked function being called;
/// everything else (arguments, results, the operand stack) is reachable
/// through it.
pub type JitFunction = unsafe extern "C" fn(*mut VMLinkedFunc) -> u32;

/// Bit set in [`VMMemoryDefinition::flags`] for shared linear memories.
pub const MEMORY_FLAG_SHARED: u32 = 1 << 0;

/// The fields compiled code needs to access a linear memory.
///
/// `base` and `current_length` describe the currently addressable region.
/// For unshared memories with an unlimited maximum, growth may reallocate
/// the backing storage and rewrite `base`; for every other memory the base
/// pointer is stable for the memory's lifetime.
#[derive(Debug)]
#[repr(C)]
pub struct VMMemoryDefinition {
    /// Flag bits for this memory; see [`MEMORY_FLAG_SHARED`].
    pub flags: u32,
    /// Pointer to the start of the backing storage.
    pub base: *mut u8,
    /// The currently addressable size, in bytes.
    pub current_length: usize,
    /// The number of pages of backing storage currently allocated.
    pub current_capacity: Pages,
    /// The page count this memory may never grow beyond.
    pub max_capacity: Pages,
    /// The [`Memory`] that owns this record.
    pub container: *mut Memory,
}

/// The per-module fields compiled code needs to call a function.
///
/// `jit_fn` is null until the JIT tier installs a compiled body for the
/// function; the interpreter consults the instruction stream through the
/// container in the meantime.
#[derive(Debug)]
#[repr(C)]
pub struct VMUnlinkedFunc {
    /// The compiled entry point, if one has been installed.
    pub jit_fn: Option<JitFunction>,
    /// The interned signature of this function.
    pub sig: *const FuncSig,
    /// The [`UnlinkedFunc`] that owns this record.
    pub container: *mut UnlinkedFunc,
}

/// The per-instance fields compiled code needs to call a function.
#[derive(Debug)]
#[repr(C)]
pub struct VMLinkedFunc {
    /// The per-module record for this function.
    pub unlinked: *mut VMUnlinkedFunc,
    /// The context of the instance this function is linked into. Null only
    /// for mock functions fabricated by tests.
    pub vmctx: *mut VMContext,
    /// The [`LinkedFunc`] that owns this record.
    pub container: *mut LinkedFunc,
}

/// The root record for a fully linked module instance.
///
/// The two tables hold one entry per declared slot, imported slots included,
/// and point at the records of whichever memory or function ended up linked
/// into the slot.
#[derive(Debug)]
#[repr(C)]
pub struct VMContext {
    /// One memory record pointer per declared linear-memory slot.
    pub memory_table: *mut *mut VMMemoryDefinition,
    /// One function record pointer per declared function slot.
    pub func_table: *mut *mut VMLinkedFunc,
    /// The [`ModuleInstance`] that owns this record.
    pub container: *mut ModuleInstance,
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;
    use std::mem::{align_of, size_of};

    // One pointer-sized unit; `u32` fields pad up to it on every supported
    // host, so all offsets below are multiples of it.
    fn word() -> usize {
        size_of::<usize>()
    }

    #[test]
    fn check_vmmemory_definition_offsets() {
        assert_eq!(offset_of!(VMMemoryDefinition, flags), 0);
        assert_eq!(offset_of!(VMMemoryDefinition, base), word());
        assert_eq!(offset_of!(VMMemoryDefinition, current_length), 2 * word());
        assert_eq!(offset_of!(VMMemoryDefinition, current_capacity), 3 * word());
        assert_eq!(offset_of!(VMMemoryDefinition, max_capacity), 4 * word());
        assert_eq!(offset_of!(VMMemoryDefinition, container), 5 * word());
        assert_eq!(size_of::<VMMemoryDefinition>(), 6 * word());
    }

    #[test]
    fn check_vmunlinked_func_offsets() {
        assert_eq!(offset_of!(VMUnlinkedFunc, jit_fn), 0);
        assert_eq!(offset_of!(VMUnlinkedFunc, sig), word());
        assert_eq!(offset_of!(VMUnlinkedFunc, container), 2 * word());
        assert_eq!(size_of::<VMUnlinkedFunc>(), 3 * word());
    }

    #[test]
    fn check_vmlinked_func_offsets() {
        assert_eq!(offset_of!(VMLinkedFunc, unlinked), 0);
        assert_eq!(offset_of!(VMLinkedFunc, vmctx), word());
        assert_eq!(offset_of!(VMLinkedFunc, container), 2 * word());
        assert_eq!(size_of::<VMLinkedFunc>(), 3 * word());
    }

    #[test]
    fn check_vmcontext_offsets() {
        assert_eq!(offset_of!(VMContext, memory_table), 0);
        assert_eq!(offset_of!(VMContext, func_table), word());
        assert_eq!(offset_of!(VMContext, container), 2 * word());
        assert_eq!(size_of::<VMContext>(), 3 * word());
    }

    #[test]
    fn check_pages_is_transparent() {
        assert_eq!(size_of::<Pages>(), size_of::<usize>());
        assert_eq!(align_of::<Pages>(), align_of::<usize>());
    }

    #[test]
    fn check_null_jit_fn_is_null_pointer() {
        // `Option<JitFunction>` must use the null representation so that
        // generated code can test the field with a plain comparison.
        assert_eq!(size_of::<Option<JitFunction>>(), size_of::<usize>());
        let none: Option<JitFunction> = None;
        assert_eq!(unsafe { std::mem::transmute::<_, usize>(none) }, 0);
    }
}
