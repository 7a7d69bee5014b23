//! Native Call Trampoline
//!
//! Performs the actual transfer of control into native code. The default
//! trampoline covers the integer class of the C calling convention: every
//! argument and the return value travel in general purpose registers.

use std::fmt;

use crate::descriptor::{LayoutCalculator, TypeDescriptor, TypeKind};
use crate::error::{MarshalError, MarshalResult};
use crate::marshal::NativeBuffer;

/// Maximum arguments supported by [`RegisterTrampoline`]
pub const MAX_REGISTER_ARGS: usize = 8;

/// Address of a native function
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFunctionPointer(usize);

impl NativeFunctionPointer {
    /// Wrap a raw entry address; null addresses are rejected
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    pub fn addr(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for NativeFunctionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunctionPointer({:#x})", self.0)
    }
}

/// Calls a native entry point with already-encoded argument words
pub trait Trampoline: Send + Sync {
    /// Reject signatures this trampoline cannot call
    fn supports(&self, return_type: &TypeDescriptor, params: &[TypeDescriptor]) -> MarshalResult<()>;

    /// Invoke `entry` once. Each argument is one register-sized word; the
    /// returned buffer holds the raw return value in native byte order.
    ///
    /// # Safety
    ///
    /// `entry` must be a live function whose real signature matches the
    /// argument words, and every address in `args` must stay valid for
    /// the duration of the call.
    unsafe fn invoke(
        &self,
        entry: NativeFunctionPointer,
        args: &[u64],
        return_type: &TypeDescriptor,
    ) -> MarshalResult<NativeBuffer>;
}

/// Arity-dispatched `extern "C"` calls with integer-class arguments
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterTrampoline;

impl RegisterTrampoline {
    pub fn new() -> Self {
        Self
    }
}

/// Whether a descriptor travels in a general purpose register
fn is_register_class(ty: &TypeDescriptor) -> bool {
    match ty.resolved().kind() {
        TypeKind::Primitive(kind, _) => !kind.is_float(),
        TypeKind::Pointer(_) => true,
        TypeKind::Opaque(_) => LayoutCalculator::size_of(ty)
            .map(|size| size <= 8)
            .unwrap_or(false),
        _ => false,
    }
}

impl Trampoline for RegisterTrampoline {
    fn supports(&self, return_type: &TypeDescriptor, params: &[TypeDescriptor]) -> MarshalResult<()> {
        if params.len() > MAX_REGISTER_ARGS {
            return Err(MarshalError::UnsupportedSignature(format!(
                "{} parameters (max {})",
                params.len(),
                MAX_REGISTER_ARGS
            )));
        }
        if let Some((i, param)) = params.iter().enumerate().find(|(_, p)| !is_register_class(p)) {
            return Err(MarshalError::UnsupportedSignature(format!(
                "parameter {} of type {} is not passed in an integer register",
                i, param
            )));
        }
        if !return_type.is_void() && !is_register_class(return_type) {
            return Err(MarshalError::UnsupportedSignature(format!(
                "return type {} is not returned in an integer register",
                return_type
            )));
        }
        Ok(())
    }

    unsafe fn invoke(
        &self,
        entry: NativeFunctionPointer,
        args: &[u64],
        _return_type: &TypeDescriptor,
    ) -> MarshalResult<NativeBuffer> {
        let addr = entry.addr();
        let a = |i: usize| args[i];

        // Rust needs the exact parameter count at compile time, so each
        // arity gets its own function pointer type.
        let result = match args.len() {
            0 => {
                type Fn0 = extern "C" fn() -> u64;
                let f: Fn0 = std::mem::transmute(addr);
                f()
            }
            1 => {
                type Fn1 = extern "C" fn(u64) -> u64;
                let f: Fn1 = std::mem::transmute(addr);
                f(a(0))
            }
            2 => {
                type Fn2 = extern "C" fn(u64, u64) -> u64;
                let f: Fn2 = std::mem::transmute(addr);
                f(a(0), a(1))
            }
            3 => {
                type Fn3 = extern "C" fn(u64, u64, u64) -> u64;
                let f: Fn3 = std::mem::transmute(addr);
                f(a(0), a(1), a(2))
            }
            4 => {
                type Fn4 = extern "C" fn(u64, u64, u64, u64) -> u64;
                let f: Fn4 = std::mem::transmute(addr);
                f(a(0), a(1), a(2), a(3))
            }
            5 => {
                type Fn5 = extern "C" fn(u64, u64, u64, u64, u64) -> u64;
                let f: Fn5 = std::mem::transmute(addr);
                f(a(0), a(1), a(2), a(3), a(4))
            }
            6 => {
                type Fn6 = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;
                let f: Fn6 = std::mem::transmute(addr);
                f(a(0), a(1), a(2), a(3), a(4), a(5))
            }
            7 => {
                type Fn7 = extern "C" fn(u64, u64, u64, u64, u64, u64, u64) -> u64;
                let f: Fn7 = std::mem::transmute(addr);
                f(a(0), a(1), a(2), a(3), a(4), a(5), a(6))
            }
            8 => {
                type Fn8 = extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64) -> u64;
                let f: Fn8 = std::mem::transmute(addr);
                f(a(0), a(1), a(2), a(3), a(4), a(5), a(6), a(7))
            }
            n => {
                return Err(MarshalError::UnsupportedSignature(format!(
                    "{} arguments (max {})",
                    n, MAX_REGISTER_ARGS
                )))
            }
        };

        Ok(NativeBuffer::from_bytes(&result.to_le_bytes()))
    }
}
