//! Layout Calculator
//!
//! Natural C layout (no `#pragma pack`): each field is placed at the running
//! offset rounded up to its alignment, and the aggregate size is rounded up to
//! the largest member alignment.

use crate::error::DescriptorError;

use super::{Field, TypeDescriptor, TypeKind};

/// Size, alignment and member offsets of a native type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub size: usize,
    pub alignment: usize,
    field_offsets: Vec<(String, usize)>,
}

impl Layout {
    fn scalar(size: usize, alignment: usize) -> Self {
        Self {
            size,
            alignment,
            field_offsets: Vec::new(),
        }
    }

    /// Byte offset of a struct/union member
    pub fn offset_of(&self, field: &str) -> Option<usize> {
        self.field_offsets
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, offset)| *offset)
    }

    /// Member offsets in declaration order
    pub fn field_offsets(&self) -> impl Iterator<Item = (&str, usize)> {
        self.field_offsets.iter().map(|(n, o)| (n.as_str(), *o))
    }
}

/// Pure layout computations over descriptors
pub struct LayoutCalculator;

impl LayoutCalculator {
    /// Layout of any sized type. Struct and union layouts come from the
    /// per-definition cache.
    pub fn layout_of(ty: &TypeDescriptor) -> Result<Layout, DescriptorError> {
        let ty = ty.resolved();
        match ty.kind() {
            TypeKind::Struct(def) => def.layout().cloned(),
            TypeKind::Union(def) => def.layout().cloned(),
            _ => Ok(Layout::scalar(Self::size_of(ty)?, Self::align_of(ty)?)),
        }
    }

    pub fn size_of(ty: &TypeDescriptor) -> Result<usize, DescriptorError> {
        let ty = ty.resolved();
        match ty.kind() {
            TypeKind::Primitive(kind, _) => Ok(kind.size()),
            TypeKind::Pointer(_) => Ok(std::mem::size_of::<usize>()),
            TypeKind::FixedArray { element, count } => Self::size_of(element)?
                .checked_mul(*count)
                .ok_or_else(|| oversized(ty)),
            TypeKind::Struct(def) => Ok(def.layout()?.size),
            TypeKind::Union(def) => Ok(def.layout()?.size),
            TypeKind::Opaque(opaque) => {
                opaque
                    .size_hint()
                    .ok_or_else(|| DescriptorError::UnresolvedForward {
                        name: opaque.name().to_string(),
                    })
            }
            TypeKind::Void | TypeKind::Function(_) => Err(DescriptorError::Unsized {
                what: ty.to_string(),
            }),
        }
    }

    pub fn align_of(ty: &TypeDescriptor) -> Result<usize, DescriptorError> {
        let ty = ty.resolved();
        match ty.kind() {
            TypeKind::Primitive(kind, _) => Ok(kind.alignment()),
            TypeKind::Pointer(_) => Ok(std::mem::align_of::<usize>()),
            TypeKind::FixedArray { element, .. } => Self::align_of(element),
            TypeKind::Struct(def) => Ok(def.layout()?.alignment),
            TypeKind::Union(def) => Ok(def.layout()?.alignment),
            TypeKind::Opaque(opaque) => match opaque.size_hint() {
                Some(_) => Ok(1),
                None => Err(DescriptorError::UnresolvedForward {
                    name: opaque.name().to_string(),
                }),
            },
            TypeKind::Void | TypeKind::Function(_) => Err(DescriptorError::Unsized {
                what: ty.to_string(),
            }),
        }
    }

    /// Stride between consecutive array elements
    pub fn stride_of(element: &TypeDescriptor) -> Result<usize, DescriptorError> {
        checked_align_up(Self::size_of(element)?, Self::align_of(element)?)
            .ok_or_else(|| oversized(element))
    }

    pub(crate) fn compute_struct(fields: &[Field]) -> Result<Layout, DescriptorError> {
        let mut offset = 0usize;
        let mut alignment = 1usize;
        let mut field_offsets = Vec::with_capacity(fields.len());

        for field in fields {
            let field_align = Self::align_of(&field.ty)?;
            let field_size = Self::size_of(&field.ty)?;
            offset = checked_align_up(offset, field_align)
                .ok_or_else(|| oversized(&field.ty))?;
            field_offsets.push((field.name.clone(), offset));
            // A zero-length tail anchor occupies no space
            offset = offset
                .checked_add(field_size)
                .ok_or_else(|| oversized(&field.ty))?;
            alignment = alignment.max(field_align);
        }

        Ok(Layout {
            size: checked_align_up(offset, alignment).ok_or_else(|| DescriptorError::Oversized {
                what: "struct".to_string(),
            })?,
            alignment,
            field_offsets,
        })
    }

    pub(crate) fn compute_union(fields: &[Field]) -> Result<Layout, DescriptorError> {
        let mut size = 0usize;
        let mut alignment = 1usize;
        let mut field_offsets = Vec::with_capacity(fields.len());

        for field in fields {
            size = size.max(Self::size_of(&field.ty)?);
            alignment = alignment.max(Self::align_of(&field.ty)?);
            field_offsets.push((field.name.clone(), 0));
        }

        Ok(Layout {
            size: checked_align_up(size, alignment).ok_or_else(|| DescriptorError::Oversized {
                what: "union".to_string(),
            })?,
            alignment,
            field_offsets,
        })
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// `align_up` that reports overflow instead of wrapping
pub fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

fn oversized(ty: &TypeDescriptor) -> DescriptorError {
    DescriptorError::Oversized {
        what: ty.to_string(),
    }
}
