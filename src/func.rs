//! The three-stage representation of WebAssembly functions.
//!
//! An [`AbstractFunc`] is the post-parse description of a function. Lowering
//! a module into a sandbox turns each defined function into an
//! [`UnlinkedFunc`], which owns the body and the interned signature but has
//! no instance context; instantiating the module then wraps it in a
//! [`LinkedFunc`] bound to one [`ModuleInstance`]. Imported functions skip
//! the first two stages and reuse another instance's linked function.

use crate::environment::Environment;
use crate::instance::ModuleInstance;
use crate::types::{FuncSig, SigRef};
use crate::vmcontext::{VMLinkedFunc, VMUnlinkedFunc};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;

/// An immutable stream of WebAssembly instruction bytes.
#[derive(Debug)]
pub struct InstructionStream {
    bytes: Vec<u8>,
}

impl InstructionStream {
    /// Creates an instruction stream from raw bytes.
    pub fn new(bytes: Vec<u8>) -> InstructionStream {
        InstructionStream { bytes }
    }

    /// Returns the size of this stream, in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Checks whether this stream is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Creates a cursor positioned `offset` bytes into this stream.
    ///
    /// Panics if `offset` is past the end of the stream.
    pub fn cursor(&self, offset: usize) -> InstructionCursor<'_> {
        InstructionCursor::new(self, offset)
    }
}

/// A cursor for reading an [`InstructionStream`].
///
/// Moving or reading past either end of the stream is a programming error,
/// not a recoverable condition.
#[derive(Debug)]
pub struct InstructionCursor<'a> {
    stream: &'a InstructionStream,
    pos: usize,
}

impl<'a> InstructionCursor<'a> {
    /// Creates a cursor at the given byte offset.
    pub fn new(stream: &'a InstructionStream, offset: usize) -> InstructionCursor<'a> {
        assert!(offset <= stream.len(), "instruction cursor out of bounds");
        InstructionCursor {
            stream,
            pos: offset,
        }
    }

    /// Returns the cursor's current byte offset into the stream.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Moves this cursor by `delta` bytes, forward or backward.
    pub fn jump_relative(&mut self, delta: isize) {
        let pos = (self.pos as isize)
            .checked_add(delta)
            .expect("instruction cursor out of bounds");
        assert!(
            pos >= 0 && pos as usize <= self.stream.len(),
            "instruction cursor out of bounds"
        );
        self.pos = pos as usize;
    }

    /// Reads the byte at the cursor and advances past it.
    pub fn read_u8(&mut self) -> u8 {
        assert!(
            self.pos < self.stream.len(),
            "instruction cursor out of bounds"
        );
        let byte = self.stream.bytes[self.pos];
        self.pos += 1;
        byte
    }
}

/// The post-parse description of a WebAssembly function.
///
/// With `is_import` set this carries only the signature the linked function
/// must have; the name and body come from whichever function ends up being
/// linked into the slot.
#[derive(Clone, Debug)]
pub struct AbstractFunc {
    /// Whether this function is imported from another module.
    pub is_import: bool,
    /// The function's debug name; empty if none was provided, and always
    /// empty for imports.
    pub debug_name: String,
    /// The function body; `None` for imports.
    pub instrs: Option<Arc<InstructionStream>>,
    /// The function's signature.
    pub sig: FuncSig,
}

impl AbstractFunc {
    /// Creates the description of a function imported from another module.
    pub fn for_import(sig: FuncSig) -> AbstractFunc {
        AbstractFunc {
            is_import: true,
            debug_name: String::new(),
            instrs: None,
            sig,
        }
    }
}

/// A function lowered into a sandbox but not yet bound to an instance.
///
/// Unlinked functions are shared between every instance of their module;
/// the JIT installs compiled code into the record returned by
/// [`UnlinkedFunc::vmfunc`] once, and all instances observe it.
#[derive(Debug)]
pub struct UnlinkedFunc {
    vmfunc: UnsafeCell<VMUnlinkedFunc>,
    sig: SigRef,
    debug_name: String,
    instrs: Option<Arc<InstructionStream>>,
}

impl UnlinkedFunc {
    /// Lowers an abstract function into the given sandbox, interning its
    /// signature there.
    ///
    /// It is a programming error to call this on an import slot; imports are
    /// resolved by the linker instead.
    pub fn instantiate(func: &AbstractFunc, env: &Environment) -> Arc<UnlinkedFunc> {
        assert!(
            !func.is_import,
            "unlinked function created from an import before linking"
        );
        UnlinkedFunc::with_parts(
            env.types().intern(func.sig.clone()),
            func.debug_name.clone(),
            func.instrs.clone(),
        )
    }

    /// Fabricates a bodiless function with only a signature, for tests.
    pub fn mock(sig: SigRef) -> Arc<UnlinkedFunc> {
        UnlinkedFunc::with_parts(sig, String::new(), None)
    }

    fn with_parts(
        sig: SigRef,
        debug_name: String,
        instrs: Option<Arc<InstructionStream>>,
    ) -> Arc<UnlinkedFunc> {
        let func = Arc::new(UnlinkedFunc {
            vmfunc: UnsafeCell::new(VMUnlinkedFunc {
                jit_fn: None,
                sig: ptr::null(),
                container: ptr::null_mut(),
            }),
            sig,
            debug_name,
            instrs,
        });
        unsafe {
            let vmfunc = func.vmfunc.get();
            (*vmfunc).sig = func.sig.as_raw();
            (*vmfunc).container = Arc::as_ptr(&func) as *mut UnlinkedFunc;
        }
        func
    }

    /// Returns the JIT-visible record for this function.
    ///
    /// Only for use by the VM internals and code generators; the record's
    /// layout is not part of the public API.
    pub fn vmfunc(&self) -> *mut VMUnlinkedFunc {
        self.vmfunc.get()
    }

    /// Returns this function's signature.
    pub fn signature(&self) -> &FuncSig {
        &self.sig
    }

    /// Returns the interned handle for this function's signature.
    pub fn sig_ref(&self) -> &SigRef {
        &self.sig
    }

    /// Returns this function's debug name, or an empty string.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// Returns this function's body, if it has one.
    pub fn instrs(&self) -> Option<&Arc<InstructionStream>> {
        self.instrs.as_ref()
    }
}

/// A function bound to a fully instantiated module, ready to run.
#[derive(Debug)]
pub struct LinkedFunc {
    vmfunc: UnsafeCell<VMLinkedFunc>,
    unlinked: Arc<UnlinkedFunc>,
    instance: *const ModuleInstance,
}

impl LinkedFunc {
    /// Binds an unlinked function to a module instance.
    pub fn link(unlinked: Arc<UnlinkedFunc>, instance: &ModuleInstance) -> Box<LinkedFunc> {
        LinkedFunc::with_parts(unlinked, instance.vmctx(), instance)
    }

    /// Fabricates a linked function with only a signature and no instance,
    /// for tests.
    pub fn mock(sig: SigRef) -> Box<LinkedFunc> {
        LinkedFunc::with_parts(UnlinkedFunc::mock(sig), ptr::null_mut(), ptr::null())
    }

    fn with_parts(
        unlinked: Arc<UnlinkedFunc>,
        vmctx: *mut crate::vmcontext::VMContext,
        instance: *const ModuleInstance,
    ) -> Box<LinkedFunc> {
        let func = Box::new(LinkedFunc {
            vmfunc: UnsafeCell::new(VMLinkedFunc {
                unlinked: unlinked.vmfunc(),
                vmctx,
                container: ptr::null_mut(),
            }),
            unlinked,
            instance,
        });
        unsafe {
            (*func.vmfunc.get()).container = &*func as *const LinkedFunc as *mut LinkedFunc;
        }
        func
    }

    /// Returns the JIT-visible record for this function.
    ///
    /// Only for use by the VM internals and code generators; the record's
    /// layout is not part of the public API.
    pub fn vmfunc(&self) -> *mut VMLinkedFunc {
        self.vmfunc.get()
    }

    /// Returns the unlinked function this function was created from.
    pub fn unlinked(&self) -> &UnlinkedFunc {
        &self.unlinked
    }

    /// Returns the instance this function is linked into, or `None` for a
    /// mock function.
    pub fn instance(&self) -> Option<&ModuleInstance> {
        unsafe { self.instance.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeTable, ValType};

    #[test]
    fn cursor_reads_and_jumps() {
        let stream = InstructionStream::new(vec![0x01, 0x02, 0x03]);
        let mut cursor = stream.cursor(0);
        assert_eq!(cursor.read_u8(), 0x01);
        assert_eq!(cursor.offset(), 1);
        cursor.jump_relative(2);
        assert_eq!(cursor.offset(), 3);
        cursor.jump_relative(-1);
        assert_eq!(cursor.read_u8(), 0x03);
    }

    #[test]
    #[should_panic]
    fn cursor_read_past_end_panics() {
        let stream = InstructionStream::new(vec![0x01]);
        let mut cursor = stream.cursor(1);
        cursor.read_u8();
    }

    #[test]
    #[should_panic]
    fn cursor_jump_before_start_panics() {
        let stream = InstructionStream::new(vec![0x01, 0x02]);
        let mut cursor = stream.cursor(0);
        cursor.jump_relative(-1);
    }

    #[test]
    fn mock_linked_func_has_signature_and_no_instance() {
        let table = TypeTable::default();
        let sig = table.intern(FuncSig::new(vec![ValType::I32], vec![]));
        let func = LinkedFunc::mock(sig.clone());

        assert_eq!(func.unlinked().sig_ref(), &sig);
        assert!(func.instance().is_none());
        assert!(func.unlinked().instrs().is_none());

        let vmfunc = unsafe { &*func.vmfunc() };
        assert_eq!(vmfunc.unlinked, func.unlinked().vmfunc());
        assert!(vmfunc.vmctx.is_null());
        assert_eq!(vmfunc.container, &*func as *const LinkedFunc as *mut LinkedFunc);

        let vmunlinked = unsafe { &*func.unlinked().vmfunc() };
        assert!(vmunlinked.jit_fn.is_none());
        assert_eq!(vmunlinked.sig, sig.as_raw());
    }
}
