//! Fully linked module instances.
//!
//! [`ModuleInstance::instantiate`] is the third and final stage of the
//! pipeline: it resolves every import of a [`Module`] against an
//! [`ImportEnvironment`], allocates the per-instance state (linked
//! functions, unshared memories), and wires the per-slot pointer tables that
//! JIT-compiled code walks through [`VMContext`].

use crate::environment::Environment;
use crate::func::LinkedFunc;
use crate::imports::{ImportEnvironment, ImportModule, LinkError, LinkErrorKind};
use crate::memory::Memory;
use crate::module::{Export, ExternKind, Import, Module};
use crate::vmcontext::{VMContext, VMLinkedFunc, VMMemoryDefinition};
use more_asserts::assert_lt;
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use thiserror::Error;

/// An error while instantiating a module.
#[derive(Debug, Error)]
pub enum InstantiationError {
    /// A runtime resource for the instance could not be allocated.
    #[error("insufficient resources: {0}")]
    Resource(anyhow::Error),

    /// One of the module's imports could not be linked.
    #[error("failed to link module")]
    Link(#[from] LinkError),
}

/// A fully instantiated WebAssembly module, ready for execution.
///
/// An instance owns the linked functions and unshared memories created for
/// it, shares ownership of shared memories with its module, and holds
/// *non-owning* references to everything supplied by its imports. It is the
/// caller's responsibility to drop instances before any instance they import
/// from; the runtime does not track the dependency.
///
/// Instances are handed out boxed because the JIT-visible [`VMContext`]
/// carries a back-pointer to the instance, which therefore must never move.
pub struct ModuleInstance {
    vmctx: UnsafeCell<VMContext>,
    exports: Vec<Export>,
    funcs: Vec<Option<NonNull<LinkedFunc>>>,
    owned_funcs: Vec<Box<LinkedFunc>>,
    memories: Vec<Option<Arc<Memory>>>,
    func_table: Box<[*mut VMLinkedFunc]>,
    memory_table: Box<[*mut VMMemoryDefinition]>,
    env: *const Environment,
}

impl ModuleInstance {
    /// Fully instantiates and links a partially instantiated module.
    ///
    /// Imports are resolved in declaration order; the first failure aborts
    /// the link, discarding the partially built instance. Defined functions
    /// are then linked into the instance, and defined memories are either
    /// reused from the module (shared) or freshly allocated (unshared).
    ///
    /// Every module reachable through `imports` must belong to the same
    /// sandbox as `module`; mixing sandboxes is a contract violation that is
    /// not checked here.
    pub fn instantiate(
        module: &Module,
        imports: &ImportEnvironment<'_>,
    ) -> Result<Box<ModuleInstance>, InstantiationError> {
        let num_funcs = module.funcs.len();
        let num_memories = module.memories.len();

        let mut instance = Box::new(ModuleInstance {
            vmctx: UnsafeCell::new(VMContext {
                memory_table: ptr::null_mut(),
                func_table: ptr::null_mut(),
                container: ptr::null_mut(),
            }),
            exports: module.exports.clone(),
            funcs: vec![None; num_funcs],
            owned_funcs: Vec::new(),
            memories: vec![None; num_memories],
            func_table: vec![ptr::null_mut(); num_funcs].into_boxed_slice(),
            memory_table: vec![ptr::null_mut(); num_memories].into_boxed_slice(),
            env: module.env,
        });
        unsafe {
            let vmctx = instance.vmctx.get();
            (*vmctx).memory_table = instance.memory_table.as_mut_ptr();
            (*vmctx).func_table = instance.func_table.as_mut_ptr();
            (*vmctx).container = &mut *instance as *mut ModuleInstance;
        }

        for import in &module.imports {
            log::trace!(
                "resolving {} import `{}.{}` into slot {}",
                import.kind,
                import.module,
                import.name,
                import.index
            );
            match import.kind {
                ExternKind::Func => {
                    assert_lt!(import.index, num_funcs, "import targets an out-of-range slot");
                    assert!(
                        instance.funcs[import.index].is_none(),
                        "multiple imports target function slot {}",
                        import.index
                    );

                    let func = imports
                        .find_func(import)?
                        .ok_or_else(|| LinkError::new(import.clone(), LinkErrorKind::NotFound))?;
                    let expected = module.import_func_sigs[import.index]
                        .as_ref()
                        .expect("imported function slot has no recorded signature");
                    if func.unlinked().sig_ref() != expected {
                        return Err(
                            LinkError::new(import.clone(), LinkErrorKind::WrongSignature).into()
                        );
                    }

                    instance.func_table[import.index] = func.vmfunc();
                    instance.funcs[import.index] = Some(NonNull::from(func));
                }
                ExternKind::Memory => {
                    assert_lt!(import.index, num_memories, "import targets an out-of-range slot");
                    assert!(
                        instance.memories[import.index].is_none(),
                        "multiple imports target memory slot {}",
                        import.index
                    );

                    let memory = imports
                        .find_memory(import)?
                        .ok_or_else(|| LinkError::new(import.clone(), LinkErrorKind::NotFound))?;
                    let expected = &module.memories[import.index];

                    if memory.is_shared() != expected.is_shared {
                        let kind = if memory.is_shared() {
                            LinkErrorKind::SharedAsUnshared
                        } else {
                            LinkErrorKind::UnsharedAsShared
                        };
                        return Err(LinkError::new(import.clone(), kind).into());
                    }
                    if memory.initial_size_pages() < expected.initial_pages {
                        return Err(LinkError::new(
                            import.clone(),
                            LinkErrorKind::MemoryTooSmall {
                                expected: expected.initial_pages,
                                actual: memory.initial_size_pages(),
                            },
                        )
                        .into());
                    }
                    if memory.max_capacity_pages() > expected.max_pages {
                        return Err(LinkError::new(
                            import.clone(),
                            LinkErrorKind::MemoryMaxTooLarge {
                                expected: expected.max_pages,
                                actual: memory.max_capacity_pages(),
                            },
                        )
                        .into());
                    }

                    instance.memory_table[import.index] = memory.vmmemory();
                    instance.memories[import.index] = Some(memory);
                }
                ExternKind::Table | ExternKind::Global => {
                    panic!("{} imports are not supported", import.kind)
                }
            }
        }

        for (index, slot) in module.funcs.iter().enumerate() {
            match slot {
                Some(unlinked) => {
                    assert!(
                        instance.funcs[index].is_none(),
                        "import overwrote defined function slot {index}"
                    );
                    let linked = LinkedFunc::link(unlinked.clone(), &instance);
                    instance.func_table[index] = linked.vmfunc();
                    instance.funcs[index] = Some(NonNull::from(&*linked));
                    instance.owned_funcs.push(linked);
                }
                None => {
                    assert!(
                        instance.funcs[index].is_some(),
                        "no import provided for function slot {index}"
                    );
                }
            }
        }

        for (index, abstract_mem) in module.memories.iter().enumerate() {
            if abstract_mem.is_import {
                assert!(
                    instance.memories[index].is_some(),
                    "no import provided for memory slot {index}"
                );
                continue;
            }

            assert!(
                instance.memories[index].is_none(),
                "import overwrote defined memory slot {index}"
            );
            let memory = if abstract_mem.is_shared {
                module.shared_memories[index]
                    .clone()
                    .expect("shared memory was not allocated at module creation")
            } else {
                assert!(
                    module.shared_memories[index].is_none(),
                    "unshared memory was allocated at module creation"
                );
                Memory::new(abstract_mem).map_err(InstantiationError::Resource)?
            };
            instance.memory_table[index] = memory.vmmemory();
            instance.memories[index] = Some(memory);
        }

        log::debug!(
            "instantiated module: {num_funcs} funcs, {num_memories} memories, {} exports",
            instance.exports.len()
        );
        Ok(instance)
    }

    /// Returns the JIT-visible record for this instance.
    ///
    /// Only for use by the VM internals and code generators; the record's
    /// layout is not part of the public API.
    pub fn vmctx(&self) -> *mut VMContext {
        self.vmctx.get()
    }

    /// Returns the sandbox this instance lives in.
    pub fn env(&self) -> &Environment {
        unsafe { &*self.env }
    }

    /// Returns the exports provided by this instance.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Returns the number of function slots in this instance.
    pub fn num_funcs(&self) -> usize {
        self.funcs.len()
    }

    /// Returns the number of linear-memory slots in this instance.
    pub fn num_memories(&self) -> usize {
        self.memories.len()
    }

    /// Returns the function linked into the given slot.
    pub fn func(&self, index: usize) -> Option<&LinkedFunc> {
        let slot = *self.funcs.get(index)?;
        let func = slot.expect("function slot was never filled");
        Some(unsafe { &*func.as_ptr() })
    }

    /// Returns the linear memory linked into the given slot.
    pub fn memory(&self, index: usize) -> Option<&Arc<Memory>> {
        let memory = self.memories.get(index)?;
        Some(memory.as_ref().expect("memory slot was never filled"))
    }

    /// Finds the export corresponding to an import's name.
    ///
    /// Export names are not required to be unique; the first match in
    /// declaration order wins.
    pub fn find_export(&self, import: &Import) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == import.name)
    }
}

impl ImportModule for ModuleInstance {
    fn find_func(&self, import: &Import) -> Result<Option<&LinkedFunc>, LinkError> {
        let Some(export) = self.find_export(import) else {
            return Ok(None);
        };
        if export.kind != ExternKind::Func {
            return Err(LinkError::new(
                import.clone(),
                LinkErrorKind::WrongKind {
                    expected: ExternKind::Func,
                    found: export.kind,
                },
            ));
        }
        Ok(Some(
            self.func(export.index)
                .expect("export targets an out-of-range function slot"),
        ))
    }

    fn find_memory(&self, import: &Import) -> Result<Option<Arc<Memory>>, LinkError> {
        let Some(export) = self.find_export(import) else {
            return Ok(None);
        };
        if export.kind != ExternKind::Memory {
            return Err(LinkError::new(
                import.clone(),
                LinkErrorKind::WrongKind {
                    expected: ExternKind::Memory,
                    found: export.kind,
                },
            ));
        }
        Ok(Some(
            self.memory(export.index)
                .expect("export targets an out-of-range memory slot")
                .clone(),
        ))
    }
}
