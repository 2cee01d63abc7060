//! Runtime representation of WebAssembly types.
//!
//! Function signatures are deduplicated per sandbox by the [`TypeTable`], so
//! that everywhere else in the runtime two signatures can be compared with a
//! single pointer comparison instead of walking their parameter and return
//! lists. This is what makes indirect-call and import signature checks cheap
//! enough to sit on the hot path.

use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The static part of a WebAssembly value type, with its binary encoding.
///
/// This is the portion of a type that is not dynamically controlled by the
/// module; a typed function reference additionally carries a signature, which
/// lives in [`ValType`] instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrimitiveValType {
    /// The WebAssembly `i32` type.
    I32 = 0x7f,
    /// The WebAssembly `i64` type.
    I64 = 0x7e,
    /// The WebAssembly `f32` type.
    F32 = 0x7d,
    /// The WebAssembly `f64` type.
    F64 = 0x7c,
    /// A WebAssembly function reference.
    FuncRef = 0x70,
}

impl PrimitiveValType {
    /// Decodes a primitive value type from its binary-format byte.
    pub fn from_byte(byte: u8) -> Option<PrimitiveValType> {
        match byte {
            0x7f => Some(PrimitiveValType::I32),
            0x7e => Some(PrimitiveValType::I64),
            0x7d => Some(PrimitiveValType::F32),
            0x7c => Some(PrimitiveValType::F64),
            0x70 => Some(PrimitiveValType::FuncRef),
            _ => None,
        }
    }

    /// Returns the binary-format byte for this type.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A full WebAssembly value type.
///
/// A `FuncRef` optionally names the signature of a typed function reference;
/// `None` is the untyped `funcref` type. Two `FuncRef` types are equal only
/// when their signature handles are *identical*, i.e. they were interned in
/// the same [`TypeTable`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValType {
    /// The WebAssembly `i32` type.
    I32,
    /// The WebAssembly `i64` type.
    I64,
    /// The WebAssembly `f32` type.
    F32,
    /// The WebAssembly `f64` type.
    F64,
    /// A function reference, optionally constrained to a signature.
    FuncRef(Option<SigRef>),
}

impl ValType {
    /// Returns the static part of this type.
    pub fn primitive(&self) -> PrimitiveValType {
        match self {
            ValType::I32 => PrimitiveValType::I32,
            ValType::I64 => PrimitiveValType::I64,
            ValType::F32 => PrimitiveValType::F32,
            ValType::F64 => PrimitiveValType::F64,
            ValType::FuncRef(_) => PrimitiveValType::FuncRef,
        }
    }

    /// Returns the binary-format byte for this type.
    pub fn to_byte(&self) -> u8 {
        self.primitive().to_byte()
    }

    /// Checks whether a value of this type can be written to a slot of type
    /// `dest`.
    ///
    /// Numeric types are only assignable to themselves. A function reference
    /// is assignable to an untyped `funcref` slot, or to a slot whose
    /// signature handle is identical to its own.
    pub fn is_assignable_to(&self, dest: &ValType) -> bool {
        match (dest, self) {
            (ValType::I32, ValType::I32)
            | (ValType::I64, ValType::I64)
            | (ValType::F32, ValType::F32)
            | (ValType::F64, ValType::F64) => true,
            (ValType::FuncRef(dest_sig), ValType::FuncRef(src_sig)) => match dest_sig {
                None => true,
                Some(dest_sig) => src_sig.as_ref() == Some(dest_sig),
            },
            _ => false,
        }
    }
}

/// The signature of a WebAssembly function.
///
/// Parameters and returns are listed in the order they would appear in the
/// text format; multi-value returns are permitted. Equality is structural,
/// which for any embedded function-reference types means identity of their
/// interned signatures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FuncSig {
    /// The types of this function's parameters.
    pub params: Vec<ValType>,
    /// The types of the values returned by this function.
    pub returns: Vec<ValType>,
}

impl FuncSig {
    /// Creates a signature from parameter and return types.
    pub fn new(params: Vec<ValType>, returns: Vec<ValType>) -> FuncSig {
        FuncSig { params, returns }
    }
}

/// A handle to a function signature interned in a [`TypeTable`].
///
/// Handles are cheap to clone and compare by *identity*: two handles are
/// equal exactly when they name the same interned signature, which for
/// handles from the same table coincides with structural equality of the
/// signatures. Handles from different sandboxes must never be mixed.
#[derive(Clone, Debug)]
pub struct SigRef(Arc<FuncSig>);

impl SigRef {
    /// Returns the raw pointer identifying this signature.
    ///
    /// The pointer stays valid for as long as any handle to the signature is
    /// alive; JIT-visible records store it directly.
    pub fn as_raw(&self) -> *const FuncSig {
        Arc::as_ptr(&self.0)
    }
}

impl PartialEq for SigRef {
    fn eq(&self, other: &SigRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SigRef {}

impl Hash for SigRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::ops::Deref for SigRef {
    type Target = FuncSig;

    fn deref(&self) -> &FuncSig {
        &self.0
    }
}

/// A per-sandbox table of deduplicated function signatures.
///
/// The table is append-only: once issued, a [`SigRef`] remains valid and
/// uniquely identifies its signature. Interning uses a linear scan, which is
/// plenty at the signature counts this runtime targets.
#[derive(Debug, Default)]
pub struct TypeTable {
    sigs: RefCell<Vec<SigRef>>,
}

impl TypeTable {
    /// Interns a signature, returning the canonical handle for it.
    ///
    /// Structurally equal signatures yield identical handles; distinct
    /// signatures yield distinct handles.
    pub fn intern(&self, sig: FuncSig) -> SigRef {
        let mut sigs = self.sigs.borrow_mut();
        if let Some(existing) = sigs.iter().find(|s| ***s == sig) {
            return existing.clone();
        }
        let interned = SigRef(Arc::new(sig));
        sigs.push(interned.clone());
        interned
    }
}

/// An untagged WebAssembly value.
///
/// The value carries no type information; callers must know the type from
/// some other source to pick the right view. All views share one 64-bit
/// payload, and the numeric constructors write the full payload so that no
/// bits are left undefined.
#[derive(Copy, Clone)]
#[repr(C)]
pub union Value {
    i32: i32,
    i64: i64,
    f32: u32,
    f64: u64,
    funcref: *const c_void,
}

impl Value {
    /// Creates a value holding an `i32`.
    pub fn i32(value: i32) -> Value {
        Value::i64(i64::from(value))
    }

    /// Creates a value holding an `i64`.
    pub fn i64(value: i64) -> Value {
        Value { i64: value }
    }

    /// Creates a value holding the bits of an `f32`.
    pub fn f32(value: f32) -> Value {
        Value {
            f64: u64::from(value.to_bits()),
        }
    }

    /// Creates a value holding the bits of an `f64`.
    pub fn f64(value: f64) -> Value {
        Value {
            f64: value.to_bits(),
        }
    }

    /// Creates a value holding a function reference.
    pub fn funcref(ptr: *const c_void) -> Value {
        Value { funcref: ptr }
    }

    /// Reads this value as an `i32`.
    pub fn get_i32(&self) -> i32 {
        unsafe { self.i32 }
    }

    /// Reads this value as an `i64`.
    pub fn get_i64(&self) -> i64 {
        unsafe { self.i64 }
    }

    /// Reads this value as an `f32`.
    pub fn get_f32(&self) -> f32 {
        f32::from_bits(unsafe { self.f32 })
    }

    /// Reads this value as an `f64`.
    pub fn get_f64(&self) -> f64 {
        f64::from_bits(unsafe { self.f64 })
    }

    /// Reads this value as a function reference.
    pub fn get_funcref(&self) -> *const c_void {
        unsafe { self.funcref }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value").finish_non_exhaustive()
    }
}

/// A WebAssembly value together with its type.
#[derive(Clone, Debug)]
pub struct TypedValue {
    /// The type of the value.
    pub ty: ValType,
    /// The value itself.
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_equal_signatures_yields_identical_handles() {
        let table = TypeTable::default();
        let a = table.intern(FuncSig::new(vec![ValType::I32], vec![ValType::I64]));
        let b = table.intern(FuncSig::new(vec![ValType::I32], vec![ValType::I64]));
        assert_eq!(a, b);
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn intern_distinct_signatures_yields_distinct_handles() {
        let table = TypeTable::default();
        let a = table.intern(FuncSig::new(vec![ValType::I32], vec![]));
        let b = table.intern(FuncSig::new(vec![ValType::I64], vec![]));
        let c = table.intern(FuncSig::new(vec![ValType::I32], vec![ValType::I32]));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn interned_handles_survive_later_interning() {
        let table = TypeTable::default();
        let first = table.intern(FuncSig::default());
        for n in 0..64 {
            table.intern(FuncSig::new(vec![ValType::I32; n], vec![]));
        }
        let again = table.intern(FuncSig::default());
        assert_eq!(first, again);
    }

    #[test]
    fn numeric_assignability() {
        assert!(ValType::I32.is_assignable_to(&ValType::I32));
        assert!(ValType::F64.is_assignable_to(&ValType::F64));
        assert!(!ValType::I32.is_assignable_to(&ValType::I64));
        assert!(!ValType::F32.is_assignable_to(&ValType::I32));
        assert!(!ValType::I32.is_assignable_to(&ValType::FuncRef(None)));
    }

    #[test]
    fn funcref_assignability() {
        let table = TypeTable::default();
        let sig_a = table.intern(FuncSig::new(vec![ValType::I32], vec![]));
        let sig_b = table.intern(FuncSig::new(vec![ValType::I64], vec![]));

        let untyped = ValType::FuncRef(None);
        let typed_a = ValType::FuncRef(Some(sig_a.clone()));
        let typed_b = ValType::FuncRef(Some(sig_b));

        // Anything funcref-shaped may be assigned to an untyped slot.
        assert!(untyped.is_assignable_to(&untyped));
        assert!(typed_a.is_assignable_to(&untyped));

        // A typed slot only accepts references with the identical signature.
        assert!(typed_a.is_assignable_to(&typed_a));
        assert!(!typed_b.is_assignable_to(&typed_a));
        assert!(!untyped.is_assignable_to(&typed_a));
        assert!(!ValType::I32.is_assignable_to(&typed_a));

        // Same structural signature interned again is the same slot type.
        let sig_a2 = table.intern(FuncSig::new(vec![ValType::I32], vec![]));
        assert!(ValType::FuncRef(Some(sig_a2)).is_assignable_to(&typed_a));
    }

    #[test]
    fn byte_encodings() {
        assert_eq!(ValType::I32.to_byte(), 0x7f);
        assert_eq!(ValType::I64.to_byte(), 0x7e);
        assert_eq!(ValType::F32.to_byte(), 0x7d);
        assert_eq!(ValType::F64.to_byte(), 0x7c);
        assert_eq!(ValType::FuncRef(None).to_byte(), 0x70);
        assert_eq!(
            PrimitiveValType::from_byte(0x7e),
            Some(PrimitiveValType::I64)
        );
        assert_eq!(PrimitiveValType::from_byte(0x00), None);
    }

    #[test]
    fn value_views() {
        assert_eq!(Value::i32(-7).get_i32(), -7);
        assert_eq!(Value::i64(1 << 40).get_i64(), 1 << 40);
        assert_eq!(Value::f32(1.5).get_f32(), 1.5);
        assert_eq!(Value::f64(f64::MAX).get_f64(), f64::MAX);
    }
}
