//! Managed Values
//!
//! The closed value model exchanged with native code. Encoders and decoders
//! match on it exhaustively; a value of the wrong shape for its descriptor is
//! a `TypeMismatch`, never a silent coercion.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A managed value tree
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedValue {
    /// Null pointer, or an absent optional value
    Null,
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    Float(f64),
    String(String),
    /// Raw bytes for byte arrays and opaque blobs
    Bytes(Vec<u8>),
    Array(Vec<ManagedValue>),
    /// Struct or union members in declaration order
    Record(Vec<(String, ManagedValue)>),
    /// Raw native address
    Pointer(usize),
    Handle(RawHandle),
    Callback(Callback),
    /// Out parameters only: reserve this many pointee elements
    Capacity(usize),
}

impl ManagedValue {
    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, ManagedValue)>,
        K: Into<String>,
    {
        ManagedValue::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Member of a record
    pub fn get(&self, field: &str) -> Option<&ManagedValue> {
        match self {
            ManagedValue::Record(fields) => {
                fields.iter().find(|(name, _)| name == field).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, field: &str) -> Option<&mut ManagedValue> {
        match self {
            ManagedValue::Record(fields) => fields
                .iter_mut()
                .find(|(name, _)| name == field)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ManagedValue::Int(v) => Some(*v),
            ManagedValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ManagedValue::UInt(v) => Some(*v),
            ManagedValue::Int(v) => u64::try_from(*v).ok(),
            ManagedValue::Pointer(p) => Some(*p as u64),
            ManagedValue::Handle(h) => Some(h.raw as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManagedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ManagedValue]> {
        match self {
            ManagedValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ManagedValue::Null)
    }

    /// Shape name used in mismatch diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            ManagedValue::Null => "null",
            ManagedValue::Bool(_) => "bool",
            ManagedValue::Int(_) => "int",
            ManagedValue::UInt(_) => "uint",
            ManagedValue::Float(_) => "float",
            ManagedValue::String(_) => "string",
            ManagedValue::Bytes(_) => "bytes",
            ManagedValue::Array(_) => "array",
            ManagedValue::Record(_) => "record",
            ManagedValue::Pointer(_) => "pointer",
            ManagedValue::Handle(_) => "handle",
            ManagedValue::Callback(_) => "callback",
            ManagedValue::Capacity(_) => "capacity",
        }
    }
}

impl From<bool> for ManagedValue {
    fn from(v: bool) -> Self {
        ManagedValue::Bool(v)
    }
}

macro_rules! from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for ManagedValue {
            fn from(v: $t) -> Self {
                ManagedValue::Int(v as i64)
            }
        }
    )*};
}

macro_rules! from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for ManagedValue {
            fn from(v: $t) -> Self {
                ManagedValue::UInt(v as u64)
            }
        }
    )*};
}

from_signed!(i8, i16, i32, i64);
from_unsigned!(u8, u16, u32, u64);

impl From<f64> for ManagedValue {
    fn from(v: f64) -> Self {
        ManagedValue::Float(v)
    }
}

impl From<&str> for ManagedValue {
    fn from(v: &str) -> Self {
        ManagedValue::String(v.to_string())
    }
}

impl From<String> for ManagedValue {
    fn from(v: String) -> Self {
        ManagedValue::String(v)
    }
}

impl From<Vec<ManagedValue>> for ManagedValue {
    fn from(v: Vec<ManagedValue>) -> Self {
        ManagedValue::Array(v)
    }
}

/// Handle value as decoded: an address plus the name of its opaque kind.
/// Never dereferenced by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub raw: usize,
    pub kind: Arc<str>,
}

impl RawHandle {
    pub fn new(raw: usize, kind: &str) -> Self {
        Self {
            raw,
            kind: Arc::from(kind),
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw == 0
    }
}

/// Compile-time tag for a family of handles
pub trait HandleKind {
    /// Name of the opaque pointee descriptor
    const NAME: &'static str;
}

/// Typed handle. `K` exists only to keep token handles apart from key
/// handles in signatures.
pub struct Handle<K: HandleKind> {
    raw: usize,
    _kind: PhantomData<K>,
}

impl<K: HandleKind> Handle<K> {
    pub fn from_raw(raw: usize) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    pub fn raw(&self) -> usize {
        self.raw
    }
}

impl<K: HandleKind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: HandleKind> Copy for Handle<K> {}

impl<K: HandleKind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({:#x})", K::NAME, self.raw)
    }
}

impl<K: HandleKind> TryFrom<RawHandle> for Handle<K> {
    type Error = RawHandle;

    fn try_from(handle: RawHandle) -> Result<Self, Self::Error> {
        if &*handle.kind == K::NAME {
            Ok(Self::from_raw(handle.raw))
        } else {
            Err(handle)
        }
    }
}

impl<K: HandleKind> From<Handle<K>> for ManagedValue {
    fn from(handle: Handle<K>) -> Self {
        ManagedValue::Handle(RawHandle::new(handle.raw, K::NAME))
    }
}

type CallbackFn = dyn Fn(&[ManagedValue]) -> ManagedValue + Send + Sync;

/// Managed function exposed to native code through a thunk.
/// Identity (not behavior) decides equality.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[ManagedValue]) -> ManagedValue + Send + Sync + 'static,
    {
        Callback(Arc::new(f))
    }

    pub fn call(&self, args: &[ManagedValue]) -> ManagedValue {
        (self.0)(args)
    }

    /// Stable identity of the underlying closure
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:#x})", self.identity())
    }
}
