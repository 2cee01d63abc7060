//! CLI for loading and validating WebAssembly modules.
//!
//! Reads a binary module, validates it under the selected feature set,
//! lowers the sections this runtime models into an abstract module, and
//! partially instantiates it in a fresh sandbox. Exits non-zero on any
//! failure.

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tundra::{
    AbstractFunc, AbstractMemory, AbstractModule, Environment, Export, ExternKind, FuncSig,
    Import, InstructionStream, Module, Pages, ValType,
};
use wasmparser::{
    CompositeInnerType, ExternalKind, Parser, Payload, RefType, TypeRef, Validator, WasmFeatures,
};

/// Loads and validates a WebAssembly module.
#[derive(ClapParser)]
#[command(version)]
struct LoadCommand {
    /// The path of the WebAssembly module to load
    #[arg(index = 1, value_name = "MODULE")]
    module: PathBuf,

    /// Enable the threads proposal (shared memories and atomics)
    #[arg(long)]
    threads: bool,

    /// Enable the multi-memory proposal
    #[arg(long)]
    multi_memory: bool,

    /// Enable the tail-call proposal
    #[arg(long)]
    tail_call: bool,

    /// Enable the relaxed-simd proposal
    #[arg(long)]
    relaxed_simd: bool,
}

impl LoadCommand {
    fn features(&self) -> WasmFeatures {
        let mut features = WasmFeatures::default();
        if self.threads {
            features.insert(WasmFeatures::THREADS);
        }
        if self.multi_memory {
            features.insert(WasmFeatures::MULTI_MEMORY);
        }
        if self.tail_call {
            features.insert(WasmFeatures::TAIL_CALL);
        }
        if self.relaxed_simd {
            features.insert(WasmFeatures::RELAXED_SIMD);
        }
        features
    }

    fn execute(self) -> Result<()> {
        let wasm = fs::read(&self.module)
            .with_context(|| format!("failed to read `{}`", self.module.display()))?;

        Validator::new_with_features(self.features())
            .validate_all(&wasm)
            .context("module failed validation")?;

        let abstract_module = lower(&wasm)?;
        let env = Environment::new();
        let module = Module::new(&abstract_module, &env)?;

        let imported_funcs = module
            .funcs()
            .iter()
            .filter(|slot| slot.is_none())
            .count();
        let imported_memories = module
            .memories()
            .iter()
            .filter(|mem| mem.is_import)
            .count();
        println!(
            "{}: ok ({} functions ({} imported), {} memories ({} imported), {} exports)",
            self.module.display(),
            module.funcs().len(),
            imported_funcs,
            module.memories().len(),
            imported_memories,
            module.exports().len(),
        );
        Ok(())
    }
}

/// Lowers the sections this runtime models into an [`AbstractModule`].
///
/// The input must already have passed validation.
fn lower(wasm: &[u8]) -> Result<AbstractModule> {
    let mut types: Vec<FuncSig> = Vec::new();
    let mut module = AbstractModule::default();
    // Slots of defined functions, in code-section order.
    let mut defined_slots: Vec<usize> = Vec::new();
    let mut next_body = 0;

    for payload in Parser::new(0).parse_all(wasm) {
        match payload? {
            Payload::TypeSection(section) => {
                for group in section {
                    for ty in group?.into_types() {
                        match &ty.composite_type.inner {
                            CompositeInnerType::Func(func) => types.push(lower_sig(func)?),
                            other => bail!("unsupported type definition: {other:?}"),
                        }
                    }
                }
            }
            Payload::ImportSection(section) => {
                for import in section {
                    let import = import?;
                    match import.ty {
                        TypeRef::Func(type_index) => {
                            let sig = func_sig(&types, type_index)?;
                            module.imports.push(Import::new(
                                import.module,
                                import.name,
                                ExternKind::Func,
                                module.funcs.len(),
                            ));
                            module.funcs.push(AbstractFunc::for_import(sig));
                        }
                        TypeRef::Memory(ty) => {
                            module.imports.push(Import::new(
                                import.module,
                                import.name,
                                ExternKind::Memory,
                                module.memories.len(),
                            ));
                            module.memories.push(lower_memory(&ty, true)?);
                        }
                        other => bail!(
                            "unsupported import `{}.{}`: {other:?}",
                            import.module,
                            import.name
                        ),
                    }
                }
            }
            Payload::FunctionSection(section) => {
                for type_index in section {
                    let sig = func_sig(&types, type_index?)?;
                    defined_slots.push(module.funcs.len());
                    module.funcs.push(AbstractFunc {
                        is_import: false,
                        debug_name: String::new(),
                        instrs: None,
                        sig,
                    });
                }
            }
            Payload::MemorySection(section) => {
                for ty in section {
                    module.memories.push(lower_memory(&ty?, false)?);
                }
            }
            Payload::ExportSection(section) => {
                for export in section {
                    let export = export?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExternKind::Func,
                        ExternalKind::Table => ExternKind::Table,
                        ExternalKind::Memory => ExternKind::Memory,
                        ExternalKind::Global => ExternKind::Global,
                        other => bail!("unsupported export `{}`: {other:?}", export.name),
                    };
                    module
                        .exports
                        .push(Export::new(export.name, kind, export.index as usize));
                }
            }
            Payload::CodeSectionEntry(body) => {
                let slot = *defined_slots
                    .get(next_body)
                    .context("code entry without a matching function declaration")?;
                next_body += 1;
                let bytes = wasm[body.range()].to_vec();
                module.funcs[slot].instrs = Some(Arc::new(InstructionStream::new(bytes)));
            }
            other => {
                log::trace!("skipping section {other:?}");
            }
        }
    }

    // The binary format has no function names outside the name section; use
    // export names as debug names where they apply.
    let AbstractModule { exports, funcs, .. } = &mut module;
    for export in exports.iter() {
        if export.kind != ExternKind::Func {
            continue;
        }
        if let Some(func) = funcs.get_mut(export.index) {
            if !func.is_import && func.debug_name.is_empty() {
                func.debug_name = export.name.clone();
            }
        }
    }

    Ok(module)
}

fn func_sig(types: &[FuncSig], type_index: u32) -> Result<FuncSig> {
    types
        .get(type_index as usize)
        .cloned()
        .with_context(|| format!("type index {type_index} out of range"))
}

fn lower_sig(func: &wasmparser::FuncType) -> Result<FuncSig> {
    let params = func
        .params()
        .iter()
        .map(lower_val_type)
        .collect::<Result<_>>()?;
    let returns = func
        .results()
        .iter()
        .map(lower_val_type)
        .collect::<Result<_>>()?;
    Ok(FuncSig::new(params, returns))
}

fn lower_val_type(ty: &wasmparser::ValType) -> Result<ValType> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        wasmparser::ValType::Ref(r) if *r == RefType::FUNCREF => Ok(ValType::FuncRef(None)),
        other => bail!("unsupported value type {other:?}"),
    }
}

fn lower_memory(ty: &wasmparser::MemoryType, is_import: bool) -> Result<AbstractMemory> {
    if ty.memory64 {
        bail!("64-bit memories are not supported");
    }
    if ty.page_size_log2.is_some() {
        bail!("custom page sizes are not supported");
    }
    let initial = Pages(usize::try_from(ty.initial).context("memory initial size overflows")?);
    let max = match ty.maximum {
        Some(max) => Pages(usize::try_from(max).context("memory maximum size overflows")?),
        None => Pages::UNLIMITED,
    };
    Ok(AbstractMemory::new(is_import, ty.shared, initial, max))
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    LoadCommand::parse().execute()
}
