//! Type Descriptors
//!
//! Composable, immutable descriptions of native C types. A [`TypeDescriptor`]
//! is a cheap handle (an `Arc`) so descriptor graphs share structure freely.
//!
//! ```text
//! struct SID {                      TypeDescriptor::structure("SID")
//!     BYTE  Revision;                   .field("Revision", u8)
//!     BYTE  SubAuthorityCount;          .field("SubAuthorityCount", u8)
//!     BYTE  IdentifierAuthority[6];     .field("IdentifierAuthority", u8[6])
//!     DWORD SubAuthority[15];           .field("SubAuthority", u32[15])
//! };                                    .counted_by("SubAuthority", "SubAuthorityCount", MaskCapacity)
//! ```
//!
//! Layout facts (size, alignment, field offsets) live in [`layout`].

pub mod layout;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use crate::error::DescriptorError;

pub use layout::{Layout, LayoutCalculator};

/// Native primitive kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// C `bool` (one byte)
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// ANSI code unit
    Char8,
    /// UTF-16 code unit (`WCHAR`)
    Char16,
    /// Pointer-sized unsigned integer (`ULONG_PTR`, `SIZE_T`)
    USize,
}

impl PrimitiveKind {
    const ALL: [PrimitiveKind; 14] = [
        PrimitiveKind::Bool,
        PrimitiveKind::I8,
        PrimitiveKind::I16,
        PrimitiveKind::I32,
        PrimitiveKind::I64,
        PrimitiveKind::U8,
        PrimitiveKind::U16,
        PrimitiveKind::U32,
        PrimitiveKind::U64,
        PrimitiveKind::F32,
        PrimitiveKind::F64,
        PrimitiveKind::Char8,
        PrimitiveKind::Char16,
        PrimitiveKind::USize,
    ];

    /// Size in bytes on the target ABI
    pub fn size(&self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::I8 | PrimitiveKind::U8 | PrimitiveKind::Char8 => 1,
            PrimitiveKind::I16 | PrimitiveKind::U16 | PrimitiveKind::Char16 => 2,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::I64 | PrimitiveKind::U64 | PrimitiveKind::F64 => 8,
            PrimitiveKind::USize => std::mem::size_of::<usize>(),
        }
    }

    /// Primitives are naturally aligned
    pub fn alignment(&self) -> usize {
        self.size()
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, PrimitiveKind::Bool | PrimitiveKind::F32 | PrimitiveKind::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            PrimitiveKind::I8 | PrimitiveKind::I16 | PrimitiveKind::I32 | PrimitiveKind::I64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, PrimitiveKind::F32 | PrimitiveKind::F64)
    }

    pub fn is_char(&self) -> bool {
        matches!(self, PrimitiveKind::Char8 | PrimitiveKind::Char16)
    }

    /// Parse a C or Windows type name
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bool" | "_bool" | "boolean" => Some(PrimitiveKind::Bool),
            "i8" | "int8" | "int8_t" | "char" | "signed char" => Some(PrimitiveKind::I8),
            "i16" | "int16" | "int16_t" | "short" => Some(PrimitiveKind::I16),
            "i32" | "int32" | "int32_t" | "int" | "long" => Some(PrimitiveKind::I32),
            "i64" | "int64" | "int64_t" | "long long" => Some(PrimitiveKind::I64),
            "u8" | "uint8" | "uint8_t" | "byte" => Some(PrimitiveKind::U8),
            "u16" | "uint16" | "uint16_t" | "word" | "ushort" => Some(PrimitiveKind::U16),
            "u32" | "uint32" | "uint32_t" | "dword" | "ulong" | "uint" => Some(PrimitiveKind::U32),
            "u64" | "uint64" | "uint64_t" | "qword" | "ulonglong" => Some(PrimitiveKind::U64),
            "f32" | "float" => Some(PrimitiveKind::F32),
            "f64" | "double" => Some(PrimitiveKind::F64),
            "char8" | "achar" => Some(PrimitiveKind::Char8),
            "char16" | "wchar" | "wchar_t" => Some(PrimitiveKind::Char16),
            "usize" | "size_t" | "ulong_ptr" | "uintptr_t" => Some(PrimitiveKind::USize),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::I8 => "int8",
            PrimitiveKind::I16 => "int16",
            PrimitiveKind::I32 => "int32",
            PrimitiveKind::I64 => "int64",
            PrimitiveKind::U8 => "uint8",
            PrimitiveKind::U16 => "uint16",
            PrimitiveKind::U32 => "uint32",
            PrimitiveKind::U64 => "uint64",
            PrimitiveKind::F32 => "float32",
            PrimitiveKind::F64 => "float64",
            PrimitiveKind::Char8 => "char8",
            PrimitiveKind::Char16 => "char16",
            PrimitiveKind::USize => "usize",
        };
        f.write_str(name)
    }
}

/// Byte order of a stored primitive. The target ABI is little-endian;
/// `Big` exists for explicitly big-endian wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    #[default]
    Native,
    Big,
}

/// One named member of a struct or union
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: TypeDescriptor,
}

/// How the true length of an array field is discovered at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentStrategy {
    /// Fixed-capacity inline array; slots at or past the count are zeroed
    MaskCapacity,
    /// Pointer to `count` contiguous elements stored elsewhere
    TrailingPointer,
    /// Inline anchor array (length 0 or 1) followed in memory by the elements
    TrailingInline,
}

/// Binds an array field's length to a sibling integer field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedExtent {
    pub array: String,
    pub count: String,
    pub strategy: ExtentStrategy,
}

/// Struct definition: ordered fields plus optional counted extents
#[derive(Debug)]
pub struct StructDef {
    name: String,
    fields: Vec<Field>,
    extents: Vec<CountedExtent>,
    layout: OnceCell<Layout>,
}

impl StructDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn extents(&self) -> &[CountedExtent] {
        &self.extents
    }

    /// The extent, if any, whose count lives in `field`
    pub fn extent_counted_by(&self, field: &str) -> Option<&CountedExtent> {
        self.extents.iter().find(|e| e.count == field)
    }

    pub fn extent_for_array(&self, field: &str) -> Option<&CountedExtent> {
        self.extents.iter().find(|e| e.array == field)
    }

    /// Cached layout
    pub fn layout(&self) -> Result<&Layout, DescriptorError> {
        self.layout
            .get_or_try_init(|| LayoutCalculator::compute_struct(&self.fields))
    }
}

impl PartialEq for StructDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields && self.extents == other.extents
    }
}

/// Union definition: every member starts at offset zero
#[derive(Debug)]
pub struct UnionDef {
    name: String,
    fields: Vec<Field>,
    layout: OnceCell<Layout>,
}

impl UnionDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn layout(&self) -> Result<&Layout, DescriptorError> {
        self.layout
            .get_or_try_init(|| LayoutCalculator::compute_union(&self.fields))
    }
}

impl PartialEq for UnionDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields
    }
}

/// Deliberately unmodeled type, optionally refined later to a real definition.
#[derive(Debug)]
pub struct OpaqueType {
    name: String,
    size_hint: Option<usize>,
    refined: OnceCell<TypeDescriptor>,
}

impl OpaqueType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_hint(&self) -> Option<usize> {
        self.size_hint
    }

    pub fn refinement(&self) -> Option<&TypeDescriptor> {
        self.refined.get()
    }
}

/// Callback prototype. Only valid as a pointee.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionPrototype {
    pub return_type: TypeDescriptor,
    pub param_types: Vec<TypeDescriptor>,
}

/// The shape behind a [`TypeDescriptor`]
#[derive(Debug)]
pub enum TypeKind {
    /// Return type only
    Void,
    Primitive(PrimitiveKind, ByteOrder),
    Pointer(TypeDescriptor),
    FixedArray {
        element: TypeDescriptor,
        count: usize,
    },
    Struct(StructDef),
    Union(UnionDef),
    Opaque(OpaqueType),
    Function(FunctionPrototype),
}

/// Immutable, shareable description of one native type
#[derive(Clone)]
pub struct TypeDescriptor(Arc<TypeKind>);

static PRIMITIVES: Lazy<Vec<TypeDescriptor>> = Lazy::new(|| {
    PrimitiveKind::ALL
        .iter()
        .map(|&k| TypeDescriptor::from_kind(TypeKind::Primitive(k, ByteOrder::Native)))
        .collect()
});

static VOID: Lazy<TypeDescriptor> = Lazy::new(|| TypeDescriptor::from_kind(TypeKind::Void));

impl TypeDescriptor {
    fn from_kind(kind: TypeKind) -> Self {
        TypeDescriptor(Arc::new(kind))
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0
    }

    /// Identity comparison
    pub fn same(&self, other: &TypeDescriptor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address identity, stable for the lifetime of any clone
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn void() -> Self {
        VOID.clone()
    }

    /// Interned native-order primitive
    pub fn primitive(kind: PrimitiveKind) -> Self {
        let index = PrimitiveKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        PRIMITIVES[index].clone()
    }

    /// Big-endian integer primitive
    pub fn big_endian(kind: PrimitiveKind) -> Self {
        Self::from_kind(TypeKind::Primitive(kind, ByteOrder::Big))
    }

    pub fn bool() -> Self {
        Self::primitive(PrimitiveKind::Bool)
    }
    pub fn i8() -> Self {
        Self::primitive(PrimitiveKind::I8)
    }
    pub fn i16() -> Self {
        Self::primitive(PrimitiveKind::I16)
    }
    pub fn i32() -> Self {
        Self::primitive(PrimitiveKind::I32)
    }
    pub fn i64() -> Self {
        Self::primitive(PrimitiveKind::I64)
    }
    pub fn u8() -> Self {
        Self::primitive(PrimitiveKind::U8)
    }
    pub fn u16() -> Self {
        Self::primitive(PrimitiveKind::U16)
    }
    pub fn u32() -> Self {
        Self::primitive(PrimitiveKind::U32)
    }
    pub fn u64() -> Self {
        Self::primitive(PrimitiveKind::U64)
    }
    pub fn f32() -> Self {
        Self::primitive(PrimitiveKind::F32)
    }
    pub fn f64() -> Self {
        Self::primitive(PrimitiveKind::F64)
    }
    pub fn char8() -> Self {
        Self::primitive(PrimitiveKind::Char8)
    }
    pub fn char16() -> Self {
        Self::primitive(PrimitiveKind::Char16)
    }
    pub fn usize() -> Self {
        Self::primitive(PrimitiveKind::USize)
    }

    pub fn pointer(pointee: TypeDescriptor) -> Self {
        Self::from_kind(TypeKind::Pointer(pointee))
    }

    /// `LPCWSTR` / `LPWSTR`
    pub fn wide_string() -> Self {
        Self::pointer(Self::char16())
    }

    /// `LPCSTR` / `LPSTR`
    pub fn ansi_string() -> Self {
        Self::pointer(Self::char8())
    }

    /// Fixed array. `count == 0` is a zero-length tail anchor.
    pub fn array(element: TypeDescriptor, count: usize) -> Result<Self, DescriptorError> {
        ensure_defined(&element, "array element")?;
        Ok(Self::from_kind(TypeKind::FixedArray { element, count }))
    }

    pub fn structure(name: impl Into<String>) -> StructBuilder {
        StructBuilder {
            name: name.into(),
            fields: Vec::new(),
            extents: Vec::new(),
        }
    }

    pub fn union(name: impl Into<String>) -> UnionBuilder {
        UnionBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Opaque placeholder, e.g. the pointee of a handle type
    pub fn opaque(name: impl Into<String>, size_hint: Option<usize>) -> Self {
        Self::from_kind(TypeKind::Opaque(OpaqueType {
            name: name.into(),
            size_hint,
            refined: OnceCell::new(),
        }))
    }

    pub fn function(return_type: TypeDescriptor, param_types: Vec<TypeDescriptor>) -> Self {
        Self::from_kind(TypeKind::Function(FunctionPrototype {
            return_type,
            param_types,
        }))
    }

    /// Refine an opaque forward declaration. Refinement is set-once: repeating
    /// it with the same definition is a no-op, anything else is rejected.
    pub fn refine(&self, definition: TypeDescriptor) -> Result<(), DescriptorError> {
        let TypeKind::Opaque(opaque) = self.kind() else {
            return Err(DescriptorError::ConflictingRefinement {
                name: self.to_string(),
                reason: "only opaque types can be refined".to_string(),
            });
        };
        ensure_defined(&definition, &opaque.name)?;
        if definition.resolved().same(self) {
            return Err(DescriptorError::ConflictingRefinement {
                name: opaque.name.clone(),
                reason: "refinement leads back to itself".to_string(),
            });
        }
        if let Some(hint) = opaque.size_hint {
            let size = LayoutCalculator::size_of(&definition)?;
            if size != hint {
                return Err(DescriptorError::ConflictingRefinement {
                    name: opaque.name.clone(),
                    reason: format!("size hint {} but definition has size {}", hint, size),
                });
            }
        }
        let stored = opaque.refined.get_or_init(|| definition.clone());
        if stored.same(&definition) || *stored == definition {
            log::debug!("[descriptor] refined opaque '{}' as {}", opaque.name, definition);
            Ok(())
        } else {
            Err(DescriptorError::ConflictingRefinement {
                name: opaque.name.clone(),
                reason: "already refined to a different definition".to_string(),
            })
        }
    }

    /// Follow opaque refinements to the effective descriptor
    pub fn resolved(&self) -> &TypeDescriptor {
        let mut current = self;
        while let TypeKind::Opaque(opaque) = current.kind() {
            match opaque.refined.get() {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    pub fn as_struct(&self) -> Option<&StructDef> {
        match self.resolved().kind() {
            TypeKind::Struct(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<(PrimitiveKind, ByteOrder)> {
        match self.resolved().kind() {
            TypeKind::Primitive(kind, order) => Some((*kind, *order)),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind(), TypeKind::Void)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.resolved().kind(), TypeKind::Pointer(_))
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        if self.same(other) {
            return true;
        }
        match (self.kind(), other.kind()) {
            (TypeKind::Void, TypeKind::Void) => true,
            (TypeKind::Primitive(a, ao), TypeKind::Primitive(b, bo)) => a == b && ao == bo,
            (TypeKind::Pointer(a), TypeKind::Pointer(b)) => a == b,
            (
                TypeKind::FixedArray { element: a, count: ac },
                TypeKind::FixedArray { element: b, count: bc },
            ) => ac == bc && a == b,
            (TypeKind::Struct(a), TypeKind::Struct(b)) => a == b,
            (TypeKind::Union(a), TypeKind::Union(b)) => a == b,
            (TypeKind::Function(a), TypeKind::Function(b)) => a == b,
            // Opaque types are nominal; identity was checked above
            _ => false,
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDescriptor({})", self)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Primitive(kind, ByteOrder::Native) => write!(f, "{}", kind),
            TypeKind::Primitive(kind, ByteOrder::Big) => write!(f, "{}be", kind),
            TypeKind::Pointer(pointee) => match pointee.kind() {
                // Avoid walking self-referential structs
                TypeKind::Struct(def) => write!(f, "struct {}*", def.name),
                TypeKind::Union(def) => write!(f, "union {}*", def.name),
                TypeKind::Opaque(opaque) => write!(f, "{}*", opaque.name),
                _ => write!(f, "{}*", pointee),
            },
            TypeKind::FixedArray { element, count } => write!(f, "{}[{}]", element, count),
            TypeKind::Struct(def) => write!(f, "struct {}", def.name),
            TypeKind::Union(def) => write!(f, "union {}", def.name),
            TypeKind::Opaque(opaque) => write!(f, "opaque {}", opaque.name),
            TypeKind::Function(proto) => {
                write!(f, "fn(")?;
                for (i, param) in proto.param_types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ") -> {}", proto.return_type)
            }
        }
    }
}

/// Check that a type can be stored inline (not behind a pointer).
fn ensure_defined(ty: &TypeDescriptor, context: &str) -> Result<(), DescriptorError> {
    match ty.resolved().kind() {
        TypeKind::Opaque(opaque) if opaque.size_hint.is_none() => {
            Err(DescriptorError::UnresolvedForward {
                name: opaque.name.clone(),
            })
        }
        TypeKind::Void | TypeKind::Function(_) => Err(DescriptorError::Unsized {
            what: format!("{} ({})", ty, context),
        }),
        _ => Ok(()),
    }
}

fn check_fields(owner: &str, fields: &[Field]) -> Result<(), DescriptorError> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(DescriptorError::DuplicateField {
                owner: owner.to_string(),
                field: field.name.clone(),
            });
        }
        // Pointer fields may reference placeholders refined later
        if !matches!(field.ty.kind(), TypeKind::Pointer(_)) {
            ensure_defined(&field.ty, &field.name)?;
        }
    }
    Ok(())
}

/// Builder for struct descriptors
#[derive(Debug)]
pub struct StructBuilder {
    name: String,
    fields: Vec<Field>,
    extents: Vec<CountedExtent>,
}

impl StructBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
        });
        self
    }

    /// Declare that `array`'s meaningful length is the value of `count`
    pub fn counted_by(
        mut self,
        array: impl Into<String>,
        count: impl Into<String>,
        strategy: ExtentStrategy,
    ) -> Self {
        self.extents.push(CountedExtent {
            array: array.into(),
            count: count.into(),
            strategy,
        });
        self
    }

    pub fn build(self) -> Result<TypeDescriptor, DescriptorError> {
        check_fields(&self.name, &self.fields)?;
        for extent in &self.extents {
            check_extent(&self.name, &self.fields, extent)?;
        }
        Ok(TypeDescriptor::from_kind(TypeKind::Struct(StructDef {
            name: self.name,
            fields: self.fields,
            extents: self.extents,
            layout: OnceCell::new(),
        })))
    }
}

fn check_extent(
    owner: &str,
    fields: &[Field],
    extent: &CountedExtent,
) -> Result<(), DescriptorError> {
    let invalid = |reason: String| DescriptorError::InvalidExtent {
        owner: owner.to_string(),
        reason,
    };
    let lookup = |name: &str| {
        fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| DescriptorError::UnknownField {
                owner: owner.to_string(),
                field: name.to_string(),
            })
    };

    let count_index = lookup(&extent.count)?;
    let array_index = lookup(&extent.array)?;

    match fields[count_index].ty.as_primitive() {
        Some((kind, _)) if kind.is_integer() => {}
        _ => {
            return Err(invalid(format!(
                "count field '{}' must be an integer",
                extent.count
            )))
        }
    }

    let array_ty = fields[array_index].ty.resolved();
    match (extent.strategy, array_ty.kind()) {
        (ExtentStrategy::MaskCapacity, TypeKind::FixedArray { .. }) => Ok(()),
        (ExtentStrategy::TrailingPointer, TypeKind::Pointer(_)) => Ok(()),
        (ExtentStrategy::TrailingInline, TypeKind::FixedArray { count, .. }) => {
            if array_index + 1 != fields.len() {
                Err(invalid(format!(
                    "inline tail '{}' must be the last field",
                    extent.array
                )))
            } else if *count > 1 {
                Err(invalid(format!(
                    "inline tail '{}' must be declared with length 0 or 1",
                    extent.array
                )))
            } else {
                Ok(())
            }
        }
        (strategy, _) => Err(invalid(format!(
            "field '{}' of type {} cannot use {:?}",
            extent.array, array_ty, strategy
        ))),
    }
}

/// Builder for union descriptors
#[derive(Debug)]
pub struct UnionBuilder {
    name: String,
    fields: Vec<Field>,
}

impl UnionBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn build(self) -> Result<TypeDescriptor, DescriptorError> {
        check_fields(&self.name, &self.fields)?;
        Ok(TypeDescriptor::from_kind(TypeKind::Union(UnionDef {
            name: self.name,
            fields: self.fields,
            layout: OnceCell::new(),
        })))
    }
}
