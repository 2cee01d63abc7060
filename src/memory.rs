//! Memory management for WebAssembly linear memories.
//!
//! A [`Memory`] is a paged, growable, zero-initialized byte buffer with
//! bounds-checked access. Memories with a finite maximum are allocated at
//! full capacity up front so that growth never moves the backing storage and
//! raw pointers held by JIT-compiled code stay valid; only unshared memories
//! with an unlimited maximum ever reallocate when grown.
//!
//! Unshared memories must not be touched while a WebAssembly agent that can
//! reach them is executing, except from a host call on that agent. That rule
//! is a contract with the caller; nothing here checks it at runtime.

use crate::vmcontext::{VMMemoryDefinition, MEMORY_FLAG_SHARED};
use anyhow::{anyhow, bail, Result};
use more_asserts::assert_le;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::Arc;

/// A WebAssembly pointer: addresses in linear memory are unsigned 32-bit.
pub type WasmPtr = u32;

/// The size of a WebAssembly page, in bytes.
pub const WASM_PAGE_SIZE: usize = 1 << 16;

/// A count of WebAssembly pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pages(pub usize);

impl Pages {
    /// Sentinel for a linear memory with no declared maximum capacity.
    pub const UNLIMITED: Pages = Pages(usize::MAX);

    /// Sentinel returned by [`Memory::grow`] when a memory could not be
    /// grown. Shares its bit pattern with [`Pages::UNLIMITED`]; the two are
    /// distinguished by context.
    pub const ALLOC_FAILURE: Pages = Pages(usize::MAX);

    /// Adds two page counts, returning `None` on overflow.
    pub fn checked_add(self, other: Pages) -> Option<Pages> {
        self.0.checked_add(other.0).map(Pages)
    }

    /// Converts this page count to bytes, returning `None` if the result
    /// does not fit in the address space.
    pub fn byte_size(self) -> Option<usize> {
        self.0.checked_mul(WASM_PAGE_SIZE)
    }
}

impl fmt::Display for Pages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Pages::UNLIMITED {
            f.write_str("unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// The declared shape of a linear memory that has not been created yet.
///
/// With `is_import` set this describes the constraints a memory linked from
/// another module must satisfy; otherwise it describes a memory that will be
/// created when the declaring module is instantiated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AbstractMemory {
    /// Whether this memory is imported from another module.
    pub is_import: bool,
    /// Whether this memory is shared between agents.
    pub is_shared: bool,
    /// The initial size, in pages.
    pub initial_pages: Pages,
    /// The maximum capacity, in pages. [`Pages::UNLIMITED`] is only valid
    /// for unshared memories.
    pub max_pages: Pages,
}

impl AbstractMemory {
    /// Creates an abstract memory description.
    pub fn new(
        is_import: bool,
        is_shared: bool,
        initial_pages: Pages,
        max_pages: Pages,
    ) -> AbstractMemory {
        AbstractMemory {
            is_import,
            is_shared,
            initial_pages,
            max_pages,
        }
    }

    /// Creates the description of a memory imported from another module.
    ///
    /// The linked memory must be at least `initial_pages` large and must not
    /// be able to grow beyond `max_pages`.
    pub fn for_import(is_shared: bool, initial_pages: Pages, max_pages: Pages) -> AbstractMemory {
        AbstractMemory::new(true, is_shared, initial_pages, max_pages)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Value types that WebAssembly can transfer to or from linear memory in a
/// single load or store instruction.
///
/// No other type has a layout guaranteed to match between the sandboxed code
/// and the host, so the trait is sealed.
pub trait MemoryValue: sealed::Sealed + Copy {
    #[doc(hidden)]
    fn from_le_slice(bytes: &[u8]) -> Self;
    #[doc(hidden)]
    fn to_le_slice(self, out: &mut [u8]);
}

macro_rules! impl_memory_value {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}
        impl MemoryValue for $ty {
            fn from_le_slice(bytes: &[u8]) -> $ty {
                <$ty>::from_le_bytes(bytes.try_into().unwrap())
            }
            fn to_le_slice(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_memory_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// A WebAssembly linear memory.
///
/// Memories are handed out as `Arc<Memory>` because modules and instances
/// share them; the JIT-visible [`VMMemoryDefinition`] inside carries a
/// back-pointer to this wrapper, so a `Memory` never moves once created.
///
/// The size of a memory only ever increases.
pub struct Memory {
    def: UnsafeCell<VMMemoryDefinition>,
    initial_pages: Pages,
    storage: UnsafeCell<Vec<u8>>,
}

impl Memory {
    /// Creates a linear memory from its declared shape.
    ///
    /// For a finite maximum the full capacity is allocated immediately, so
    /// later growth never reallocates. Shared memories must declare a finite
    /// maximum, and the description must not be an import; both violations
    /// are programming errors. Failure to allocate the backing storage is
    /// returned as an error.
    pub fn new(abstract_mem: &AbstractMemory) -> Result<Arc<Memory>> {
        assert!(
            !abstract_mem.is_import,
            "memory created from an unlinked import declaration"
        );
        assert!(
            !abstract_mem.is_shared || abstract_mem.max_pages != Pages::UNLIMITED,
            "shared memories cannot have unlimited capacity"
        );
        assert_le!(abstract_mem.initial_pages, abstract_mem.max_pages);

        let capacity = if abstract_mem.max_pages != Pages::UNLIMITED {
            abstract_mem.max_pages
        } else {
            abstract_mem.initial_pages
        };
        let capacity_bytes = capacity.byte_size().ok_or_else(|| {
            anyhow!("linear memory capacity of {capacity} pages overflows the address space")
        })?;

        let mut storage = Vec::new();
        if storage.try_reserve_exact(capacity_bytes).is_err() {
            bail!("failed to allocate {capacity_bytes} bytes of linear memory");
        }
        storage.resize(capacity_bytes, 0);

        let mut flags = 0;
        if abstract_mem.is_shared {
            flags |= MEMORY_FLAG_SHARED;
        }

        let memory = Arc::new(Memory {
            def: UnsafeCell::new(VMMemoryDefinition {
                flags,
                base: ptr::null_mut(),
                current_length: abstract_mem.initial_pages.byte_size().unwrap(),
                current_capacity: capacity,
                max_capacity: abstract_mem.max_pages,
                container: ptr::null_mut(),
            }),
            initial_pages: abstract_mem.initial_pages,
            storage: UnsafeCell::new(storage),
        });
        unsafe {
            let def = memory.def.get();
            (*def).base = (*memory.storage.get()).as_mut_ptr();
            (*def).container = Arc::as_ptr(&memory) as *mut Memory;
        }
        Ok(memory)
    }

    /// Creates a new unshared linear memory.
    pub fn unshared(initial_pages: Pages, max_pages: Pages) -> Result<Arc<Memory>> {
        Memory::new(&AbstractMemory::new(false, false, initial_pages, max_pages))
    }

    /// Creates a new shared linear memory.
    pub fn shared(initial_pages: Pages, max_pages: Pages) -> Result<Arc<Memory>> {
        Memory::new(&AbstractMemory::new(false, true, initial_pages, max_pages))
    }

    /// Returns the JIT-visible record for this memory.
    ///
    /// Only for use by the VM internals and code generators; the record's
    /// layout is not part of the public API.
    pub fn vmmemory(&self) -> *mut VMMemoryDefinition {
        self.def.get()
    }

    fn def(&self) -> &VMMemoryDefinition {
        unsafe { &*self.def.get() }
    }

    /// Returns the current size of this memory, in bytes.
    pub fn byte_size(&self) -> usize {
        self.def().current_length
    }

    /// Returns the current size of this memory, in pages.
    pub fn size_pages(&self) -> Pages {
        Pages(self.byte_size() / WASM_PAGE_SIZE)
    }

    /// Returns the size this memory was created with, in pages.
    pub fn initial_size_pages(&self) -> Pages {
        self.initial_pages
    }

    /// Returns the number of pages of backing storage currently allocated.
    ///
    /// The memory can grow up to this size without any new allocation.
    pub fn current_capacity_pages(&self) -> Pages {
        self.def().current_capacity
    }

    /// Returns the page count this memory may never grow beyond.
    pub fn max_capacity_pages(&self) -> Pages {
        self.def().max_capacity
    }

    /// Checks whether the backing storage will never be reallocated.
    pub fn is_at_max_capacity(&self) -> bool {
        self.current_capacity_pages() == self.max_capacity_pages()
    }

    /// Checks whether this memory can be shared between agents.
    pub fn is_shared(&self) -> bool {
        self.def().flags & MEMORY_FLAG_SHARED != 0
    }

    /// Returns a pointer to the start of the backing storage.
    ///
    /// Any pointer returned here is invalidated when a call to
    /// [`Memory::grow`] reallocates the backing storage.
    pub fn base_ptr(&self) -> *mut u8 {
        self.def().base
    }

    /// Checks whether an access of `len` bytes at `addr` stays in bounds.
    ///
    /// Since a memory never shrinks, a true result stays true for the rest
    /// of the memory's lifetime.
    pub fn is_valid_address(&self, addr: WasmPtr, len: usize) -> bool {
        (addr as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.byte_size())
    }

    /// Copies `buf.len()` bytes out of this memory starting at `addr`.
    ///
    /// Returns false without touching `buf` if the range is out of bounds.
    pub fn load(&self, buf: &mut [u8], addr: WasmPtr) -> bool {
        if !self.is_valid_address(addr, buf.len()) {
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(
                self.base_ptr().add(addr as usize) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        true
    }

    /// Copies `buf.len()` bytes into this memory starting at `addr`.
    ///
    /// Returns false without writing anything if the range is out of bounds.
    pub fn store(&self, buf: &[u8], addr: WasmPtr) -> bool {
        if !self.is_valid_address(addr, buf.len()) {
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.base_ptr().add(addr as usize), buf.len());
        }
        true
    }

    /// Reads a single value from this memory, or `None` if out of bounds.
    pub fn read<T: MemoryValue>(&self, addr: WasmPtr) -> Option<T> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..std::mem::size_of::<T>()];
        if !self.load(buf, addr) {
            return None;
        }
        Some(T::from_le_slice(buf))
    }

    /// Writes a single value to this memory; false if out of bounds.
    pub fn write<T: MemoryValue>(&self, addr: WasmPtr, value: T) -> bool {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..std::mem::size_of::<T>()];
        value.to_le_slice(buf);
        self.store(buf, addr)
    }

    /// Grows this memory by `delta` pages.
    ///
    /// Growing by zero pages returns the current size. If the new size would
    /// overflow or exceed the maximum capacity, or the backing storage
    /// cannot be allocated, nothing changes and [`Pages::ALLOC_FAILURE`] is
    /// returned. Otherwise the previous size in pages is returned, and the
    /// new region reads as zero.
    ///
    /// When growth goes beyond the current capacity the backing storage is
    /// reallocated, invalidating every pointer previously returned by
    /// [`Memory::base_ptr`]. This can only happen to unshared memories with
    /// an unlimited maximum; everything else is allocated at full capacity
    /// up front.
    ///
    /// Growing a shared memory is not implemented and is a fatal error.
    pub fn grow(&self, delta: Pages) -> Pages {
        let old_size = self.size_pages();
        if delta == Pages(0) {
            return old_size;
        }

        assert!(
            !self.is_shared(),
            "growing a shared linear memory is not implemented"
        );

        let Some(new_size) = old_size.checked_add(delta) else {
            return Pages::ALLOC_FAILURE;
        };
        if new_size > self.max_capacity_pages() {
            return Pages::ALLOC_FAILURE;
        }
        if new_size > self.current_capacity_pages() && !self.alloc_at_least(new_size) {
            return Pages::ALLOC_FAILURE;
        }

        unsafe {
            (*self.def.get()).current_length = new_size.byte_size().unwrap();
        }
        log::trace!("grew linear memory from {old_size} to {new_size} pages");
        old_size
    }

    fn alloc_at_least(&self, pages: Pages) -> bool {
        if pages <= self.current_capacity_pages() {
            return true;
        }
        if pages > self.max_capacity_pages() {
            return false;
        }

        // TODO: overallocate here so repeated growth of unlimited-max
        // memories does not copy the contents every time.
        self.alloc_exactly(pages)
    }

    fn alloc_exactly(&self, pages: Pages) -> bool {
        assert!(
            !self.is_shared(),
            "shared linear memory backing storage cannot be reallocated"
        );
        assert_le!(self.current_capacity_pages(), pages);
        assert_le!(pages, self.max_capacity_pages());

        let Some(new_bytes) = pages.byte_size() else {
            return false;
        };

        unsafe {
            let storage = &mut *self.storage.get();
            if storage.try_reserve_exact(new_bytes - storage.len()).is_err() {
                return false;
            }
            storage.resize(new_bytes, 0);

            let def = self.def.get();
            (*def).base = storage.as_mut_ptr();
            (*def).current_capacity = pages;
        }
        true
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("shared", &self.is_shared())
            .field("size_pages", &self.size_pages())
            .field("current_capacity", &self.current_capacity_pages())
            .field("max_capacity", &self.max_capacity_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_unshared() {
        let mem = Memory::unshared(Pages(1), Pages(3)).unwrap();
        assert_eq!(mem.initial_size_pages(), Pages(1));
        assert_eq!(mem.max_capacity_pages(), Pages(3));
        assert!(!mem.is_shared());
        assert!(!mem.base_ptr().is_null());
        assert!(mem.is_at_max_capacity());
    }

    #[test]
    fn construct_shared() {
        let mem = Memory::shared(Pages(1), Pages(3)).unwrap();
        assert_eq!(mem.initial_size_pages(), Pages(1));
        assert_eq!(mem.max_capacity_pages(), Pages(3));
        assert!(mem.is_shared());
        assert!(mem.is_at_max_capacity());
    }

    #[test]
    #[should_panic]
    fn construct_shared_unlimited_panics() {
        let _ = Memory::shared(Pages(1), Pages::UNLIMITED);
    }

    #[test]
    fn size() {
        let mem = Memory::unshared(Pages(1), Pages(3)).unwrap();
        assert_eq!(mem.byte_size(), WASM_PAGE_SIZE);
        assert_eq!(mem.size_pages(), Pages(1));
    }

    #[test]
    fn load_zeroed() {
        let mem = Memory::unshared(Pages(1), Pages(1)).unwrap();
        let mut buf = vec![0xffu8; WASM_PAGE_SIZE];
        assert!(mem.load(&mut buf, 0));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn load_store_aligned_and_unaligned() {
        let mem = Memory::unshared(Pages(1), Pages(1)).unwrap();

        assert!(mem.write::<u64>(0, 0xdead_beef_cafe_babe));
        assert_eq!(mem.read::<u64>(0), Some(0xdead_beef_cafe_babe));
        assert!(mem.write::<u64>(3, 0xdead_beef_cafe_babe));
        assert_eq!(mem.read::<u64>(3), Some(0xdead_beef_cafe_babe));

        assert!(mem.write::<u32>(3, 0xdead_beef));
        assert_eq!(mem.read::<u32>(3), Some(0xdead_beef));

        assert!(mem.write::<u16>(3, 0xdead));
        assert_eq!(mem.read::<u16>(3), Some(0xdead));

        assert!(mem.write::<u8>(0, 0xde));
        assert_eq!(mem.read::<u8>(0), Some(0xde));
    }

    #[test]
    fn load_endianness() {
        let mem = Memory::unshared(Pages(1), Pages(1)).unwrap();
        assert!(mem.write::<u8>(0, 0xff));
        assert_eq!(mem.read::<u16>(0), Some(0xff));
        assert_eq!(mem.read::<u32>(0), Some(0xff));
        assert_eq!(mem.read::<u64>(0), Some(0xff));
    }

    #[test]
    fn store_endianness() {
        let mem = Memory::unshared(Pages(1), Pages(1)).unwrap();
        assert!(mem.write::<u16>(0, 0xff));
        assert_eq!(mem.read::<u8>(0), Some(0xff));
        assert!(mem.write::<u32>(0, 0xff));
        assert_eq!(mem.read::<u8>(0), Some(0xff));
        assert!(mem.write::<u64>(0, 0xff));
        assert_eq!(mem.read::<u8>(0), Some(0xff));
    }

    #[test]
    fn bounds_check() {
        let mem = Memory::unshared(Pages(1), Pages(3)).unwrap();
        let page = WASM_PAGE_SIZE;

        assert!(mem.is_valid_address(0, 4));
        assert!(mem.is_valid_address(0, page));
        assert!(!mem.is_valid_address(0, page + 1));
        assert!(mem.is_valid_address((page - 4) as WasmPtr, 4));
        assert!(!mem.is_valid_address((page - 3) as WasmPtr, 4));
        assert!(mem.is_valid_address(page as WasmPtr, 0));
        assert!(!mem.is_valid_address((page + 1) as WasmPtr, 0));
        assert!(!mem.is_valid_address(1, usize::MAX));
    }

    #[test]
    fn out_of_bounds_load_leaves_buffer_untouched() {
        let mem = Memory::unshared(Pages(1), Pages(1)).unwrap();
        let mut buf = [0xabu8; 8];
        assert!(!mem.load(&mut buf, (WASM_PAGE_SIZE - 4) as WasmPtr));
        assert_eq!(buf, [0xab; 8]);
        assert_eq!(mem.read::<u64>((WASM_PAGE_SIZE - 4) as WasmPtr), None);
    }

    #[test]
    fn grow_unshared() {
        let mem = Memory::unshared(Pages(1), Pages(3)).unwrap();

        assert_eq!(mem.size_pages(), Pages(1));
        assert_eq!(mem.grow(Pages(0)), Pages(1));
        assert_eq!(mem.grow(Pages(1)), Pages(1));
        assert_eq!(mem.size_pages(), Pages(2));
        assert_eq!(mem.grow(Pages(2)), Pages::ALLOC_FAILURE);
        assert_eq!(mem.size_pages(), Pages(2));
        assert_eq!(mem.grow(Pages(1)), Pages(2));
        assert_eq!(mem.size_pages(), Pages(3));
        assert_eq!(mem.grow(Pages(1)), Pages::ALLOC_FAILURE);
        assert_eq!(mem.grow(Pages(0)), Pages(3));

        assert_eq!(mem.initial_size_pages(), Pages(1));
    }

    #[test]
    fn grow_very_large() {
        let mem = Memory::unshared(Pages(1), Pages(3)).unwrap();

        assert_eq!(mem.grow(Pages(usize::MAX)), Pages::ALLOC_FAILURE);
        assert_eq!(mem.size_pages(), Pages(1));

        assert_eq!(mem.grow(Pages(1 << (usize::BITS - 1))), Pages::ALLOC_FAILURE);
        assert_eq!(mem.size_pages(), Pages(1));

        assert_eq!(
            mem.grow(Pages(usize::MAX / WASM_PAGE_SIZE)),
            Pages::ALLOC_FAILURE
        );
        assert_eq!(mem.size_pages(), Pages(1));
    }

    #[test]
    #[should_panic]
    fn grow_shared_panics() {
        let mem = Memory::shared(Pages(1), Pages(3)).unwrap();
        mem.grow(Pages(1));
    }

    #[test]
    fn grow_within_preallocated_capacity_keeps_base() {
        let mem = Memory::unshared(Pages(1), Pages(3)).unwrap();
        let base = mem.base_ptr();
        assert_eq!(mem.grow(Pages(2)), Pages(1));
        assert_eq!(mem.base_ptr(), base);
    }

    #[test]
    fn grow_unlimited_preserves_contents() {
        let mem = Memory::unshared(Pages(1), Pages::UNLIMITED).unwrap();
        assert_eq!(mem.current_capacity_pages(), Pages(1));
        assert!(mem.write::<u64>(16, 0x0123_4567_89ab_cdef));

        // Growing past the capacity reallocates; the old contents must
        // survive and the new page must read as zero.
        assert_eq!(mem.grow(Pages(1)), Pages(1));
        assert_eq!(mem.size_pages(), Pages(2));
        assert_eq!(mem.read::<u64>(16), Some(0x0123_4567_89ab_cdef));
        assert_eq!(mem.read::<u64>(WASM_PAGE_SIZE as WasmPtr), Some(0));
    }
}
