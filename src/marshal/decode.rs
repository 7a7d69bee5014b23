//! Decoder: native bytes -> managed value tree.
//!
//! Fixed shapes decode in one pass. Structs with counted extents decode in
//! two: the fixed part first (leaving extent arrays unresolved), then each
//! extent region is re-read as a `FixedArray` of the count just discovered
//! and spliced into the record.

use crate::config::DecodeConfig;
use crate::descriptor::{
    ByteOrder, CountedExtent, ExtentStrategy, LayoutCalculator, PrimitiveKind, StructDef,
    TypeDescriptor, TypeKind, UnionDef,
};
use crate::error::{DescriptorError, FieldPath, MarshalError, MarshalResult};
use crate::value::{ManagedValue, RawHandle};

use super::buffer::{decode_ansi, decode_wide, read_uint};
use super::encode::array_element;
use super::memory::Memory;
use super::variant::VariantTable;

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Reads managed values out of native layout
#[derive(Clone, Copy)]
pub struct Decoder<'m> {
    memory: Option<&'m dyn Memory>,
    max_pointer_depth: usize,
    max_string_units: usize,
}

impl Decoder<'static> {
    /// Decoder without memory access: every pointer decodes to its address
    pub fn detached() -> Self {
        let limits = DecodeConfig::default();
        Decoder {
            memory: None,
            max_pointer_depth: limits.max_pointer_depth,
            max_string_units: limits.max_string_units,
        }
    }
}

impl<'m> Decoder<'m> {
    /// Decoder that follows pointers through `memory`
    pub fn new(memory: &'m dyn Memory) -> Self {
        let limits = DecodeConfig::default();
        Decoder {
            memory: Some(memory),
            max_pointer_depth: limits.max_pointer_depth,
            max_string_units: limits.max_string_units,
        }
    }

    pub fn with_limits(mut self, limits: &DecodeConfig) -> Self {
        self.max_pointer_depth = limits.max_pointer_depth;
        self.max_string_units = limits.max_string_units;
        self
    }

    /// Decode `ty` from `source` at `base`
    pub fn decode(
        &self,
        source: &[u8],
        ty: &TypeDescriptor,
        base: usize,
    ) -> MarshalResult<ManagedValue> {
        self.decode_at(source, ty, base, &FieldPath::root(), 0)
    }

    /// Decode `ty` stored at a native address
    pub fn decode_address(&self, addr: usize, ty: &TypeDescriptor) -> MarshalResult<ManagedValue> {
        self.decode_pointee(addr, ty, &FieldPath::root(), 0)
    }

    /// Decode a wide string of an explicitly returned length (no NUL scan)
    pub fn decode_wide_str_len(
        &self,
        source: &[u8],
        base: usize,
        units: usize,
    ) -> MarshalResult<String> {
        let end = span_end(base, units, 2, source.len())?;
        if end > source.len() {
            return Err(MarshalError::BufferTooSmall {
                required: end,
                available: source.len(),
            });
        }
        let units: Vec<u16> = source[base..end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// Decode a NUL-terminated wide string held in `source`
    pub fn decode_wide_str(&self, source: &[u8], base: usize) -> MarshalResult<String> {
        if base > source.len() {
            return Err(MarshalError::BufferTooSmall {
                required: base,
                available: source.len(),
            });
        }
        Ok(decode_wide(&source[base..]))
    }

    /// Decode a buffer whose shape is chosen by an out-of-band discriminant
    pub fn decode_variant(
        &self,
        source: &[u8],
        table: &VariantTable,
        discriminant: u32,
    ) -> MarshalResult<ManagedValue> {
        table.decode(self, source, discriminant)
    }

    fn decode_at(
        &self,
        source: &[u8],
        ty: &TypeDescriptor,
        base: usize,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        let ty = ty.resolved();
        match ty.kind() {
            TypeKind::Void => Ok(ManagedValue::Null),
            TypeKind::Primitive(kind, order) => {
                let bits = read_uint(source, base, kind.size(), *order)?;
                Ok(primitive_value(bits, *kind))
            }
            TypeKind::Pointer(pointee) => {
                let addr = read_uint(source, base, POINTER_SIZE, ByteOrder::Native)? as usize;
                self.decode_pointer(addr, pointee, path, depth)
            }
            TypeKind::FixedArray { element, count } => {
                self.decode_array(source, element, *count, base, path, depth)
            }
            TypeKind::Struct(def) => self.decode_struct(source, def, base, path, depth),
            TypeKind::Union(def) => self.decode_union(source, def, base, path, depth),
            TypeKind::Opaque(opaque) => {
                let size = LayoutCalculator::size_of(ty)?;
                let end = base + size;
                if end > source.len() {
                    return Err(MarshalError::BufferTooSmall {
                        required: end,
                        available: source.len(),
                    });
                }
                log::trace!("[decode] opaque {} blob at {}", opaque.name(), base);
                Ok(ManagedValue::Bytes(source[base..end].to_vec()))
            }
            TypeKind::Function(_) => Err(DescriptorError::Unsized {
                what: ty.to_string(),
            }
            .into()),
        }
    }

    fn decode_pointer(
        &self,
        addr: usize,
        pointee: &TypeDescriptor,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        if addr == 0 {
            return Ok(ManagedValue::Null);
        }
        let target = pointee.resolved();
        match target.kind() {
            TypeKind::Opaque(opaque) => Ok(ManagedValue::Handle(RawHandle::new(addr, opaque.name()))),
            TypeKind::Void | TypeKind::Function(_) => Ok(ManagedValue::Pointer(addr)),
            _ if self.memory.is_none() || depth >= self.max_pointer_depth => {
                Ok(ManagedValue::Pointer(addr))
            }
            TypeKind::Primitive(kind, _) if kind.is_char() => {
                let memory = self.require_memory(addr)?;
                let bytes = memory.read_terminated(addr, kind.size(), self.max_string_units)?;
                Ok(ManagedValue::String(match kind {
                    PrimitiveKind::Char16 => decode_wide(&bytes),
                    _ => decode_ansi(&bytes),
                }))
            }
            _ => self.decode_pointee(addr, target, &path.deref(), depth + 1),
        }
    }

    /// Read a pointee out of native memory
    fn decode_pointee(
        &self,
        addr: usize,
        ty: &TypeDescriptor,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        let memory = self.require_memory(addr)?;
        let ty = ty.resolved();
        let bytes = match ty.as_struct() {
            Some(def) => read_struct(memory, addr, def)?,
            None => memory.read(addr, LayoutCalculator::size_of(ty)?)?,
        };
        self.decode_at(&bytes, ty, 0, path, depth)
    }

    fn require_memory(&self, addr: usize) -> MarshalResult<&'m dyn Memory> {
        self.memory.ok_or(MarshalError::InvalidAddress { addr })
    }

    fn decode_array(
        &self,
        source: &[u8],
        element: &TypeDescriptor,
        count: usize,
        base: usize,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        let stride = LayoutCalculator::stride_of(element)?;
        let end = span_end(base, count, stride, source.len())?;
        if end > source.len() {
            return Err(MarshalError::BufferTooSmall {
                required: end,
                available: source.len(),
            });
        }

        match element.as_primitive() {
            Some((PrimitiveKind::Char16, ByteOrder::Native)) => {
                Ok(ManagedValue::String(decode_wide(&source[base..end])))
            }
            Some((PrimitiveKind::Char8, _)) => {
                Ok(ManagedValue::String(decode_ansi(&source[base..end])))
            }
            _ => {
                let mut items = Vec::with_capacity(count);
                for i in 0..count {
                    items.push(self.decode_at(
                        source,
                        element,
                        base + i * stride,
                        &path.index(i),
                        depth,
                    )?);
                }
                Ok(ManagedValue::Array(items))
            }
        }
    }

    fn decode_struct(
        &self,
        source: &[u8],
        def: &StructDef,
        base: usize,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        let layout = def.layout()?;
        if base + layout.size > source.len() {
            return Err(MarshalError::BufferTooSmall {
                required: base + layout.size,
                available: source.len(),
            });
        }
        log::trace!("[decode] struct {} at {} ({})", def.name(), base, path);

        // Phase one: fixed part, extent arrays left unresolved
        let mut members = Vec::with_capacity(def.fields().len());
        for (field, (_, offset)) in def.fields().iter().zip(layout.field_offsets()) {
            let offset = base + offset;
            let field_path = path.field(&field.name);
            let value = match def.extent_for_array(&field.name).map(|e| e.strategy) {
                Some(ExtentStrategy::TrailingPointer) => {
                    let addr = read_uint(source, offset, POINTER_SIZE, ByteOrder::Native)?;
                    ManagedValue::Pointer(addr as usize)
                }
                Some(ExtentStrategy::TrailingInline) => ManagedValue::Null,
                _ => self.decode_at(source, &field.ty, offset, &field_path, depth)?,
            };
            members.push((field.name.clone(), value));
        }
        let mut record = ManagedValue::Record(members);

        // Phase two: re-decode each extent with its discovered count
        for extent in def.extents() {
            let resolved = self.resolve_extent(source, def, extent, &record, base, path, depth)?;
            if let Some(slot) = record.get_mut(&extent.array) {
                *slot = resolved;
            }
        }
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_extent(
        &self,
        source: &[u8],
        def: &StructDef,
        extent: &CountedExtent,
        record: &ManagedValue,
        base: usize,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        let array_path = path.field(&extent.array);
        let count = record
            .get(&extent.count)
            .and_then(ManagedValue::as_u64)
            .ok_or_else(|| MarshalError::mismatch(&path.field(&extent.count), "count", "non-integer"))?
            as usize;
        let field = def.field(&extent.array).ok_or_else(|| DescriptorError::UnknownField {
            owner: def.name().to_string(),
            field: extent.array.clone(),
        })?;
        let element = array_element(&field.ty).ok_or_else(|| DescriptorError::InvalidExtent {
            owner: def.name().to_string(),
            reason: format!("field '{}' does not hold an array", extent.array),
        })?;
        let offset = base + def.layout()?.offset_of(&extent.array).unwrap_or_default();

        match extent.strategy {
            ExtentStrategy::MaskCapacity => {
                let capacity = match field.ty.resolved().kind() {
                    TypeKind::FixedArray { count, .. } => *count,
                    _ => 0,
                };
                if count > capacity {
                    return Err(MarshalError::mismatch(
                        &path.field(&extent.count),
                        format!("count at most {}", capacity),
                        count.to_string(),
                    ));
                }
                let current = record.get(&extent.array).cloned().unwrap_or(ManagedValue::Null);
                self.mask_capacity(source, current, &element, count, offset, &array_path, depth)
            }
            ExtentStrategy::TrailingPointer => {
                let addr = match record.get(&extent.array) {
                    Some(ManagedValue::Pointer(addr)) => *addr,
                    _ => 0,
                };
                if count == 0 {
                    return Ok(ManagedValue::Array(Vec::new()));
                }
                if addr == 0 {
                    return Err(MarshalError::mismatch(
                        &array_path,
                        format!("pointer to {} elements", count),
                        "null pointer",
                    ));
                }
                let memory = self.require_memory(addr)?;
                if depth >= self.max_pointer_depth {
                    return Ok(ManagedValue::Pointer(addr));
                }
                let len = span_end(0, count, LayoutCalculator::stride_of(&element)?, 0)?;
                let region = TypeDescriptor::array(element.clone(), count)?;
                let bytes = memory.read(addr, len)?;
                log::trace!(
                    "[decode] {} trailing elements of {} at {:#x}",
                    count,
                    element,
                    addr
                );
                self.decode_at(&bytes, &region, 0, &array_path, depth + 1)
            }
            ExtentStrategy::TrailingInline => {
                let region = TypeDescriptor::array(element, count)?;
                self.decode_at(source, &region, offset, &array_path, depth)
            }
        }
    }

    /// Zero every capacity slot at or past `count`
    #[allow(clippy::too_many_arguments)]
    fn mask_capacity(
        &self,
        source: &[u8],
        current: ManagedValue,
        element: &TypeDescriptor,
        count: usize,
        offset: usize,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        match current {
            ManagedValue::Array(mut items) => {
                let zero = zero_value(element)?;
                let mut residual = 0usize;
                for slot in items.iter_mut().skip(count) {
                    if *slot != zero {
                        residual += 1;
                    }
                    *slot = zero.clone();
                }
                if residual > 0 {
                    log::warn!(
                        "[decode] masked {} residual slots past count {} at {}",
                        residual,
                        count,
                        path
                    );
                }
                Ok(ManagedValue::Array(items))
            }
            ManagedValue::String(_) => {
                // Character capacity: only the counted units are text
                let region = TypeDescriptor::array(element.clone(), count)?;
                self.decode_at(source, &region, offset, path, depth)
            }
            other => Ok(other),
        }
    }

    fn decode_union(
        &self,
        source: &[u8],
        def: &UnionDef,
        base: usize,
        path: &FieldPath,
        depth: usize,
    ) -> MarshalResult<ManagedValue> {
        let layout = def.layout()?;
        if base + layout.size > source.len() {
            return Err(MarshalError::BufferTooSmall {
                required: base + layout.size,
                available: source.len(),
            });
        }
        // Every arm is a view of the same bytes. Only one arm is live, so
        // pointers inside arms stay raw addresses.
        let mut arms = Vec::with_capacity(def.fields().len());
        for field in def.fields() {
            let arm_path = path.field(&field.name);
            let value =
                self.decode_at(source, &field.ty, base, &arm_path, depth.max(self.max_pointer_depth))?;
            arms.push((field.name.clone(), value));
        }
        Ok(ManagedValue::Record(arms))
    }
}

/// Copy a struct out of native memory without reading past what the native
/// side owns: a trailing capacity array is read only up to its count (the
/// rest of the capacity is zero-filled), and an inline tail is read in full.
fn read_struct(memory: &dyn Memory, addr: usize, def: &StructDef) -> MarshalResult<Vec<u8>> {
    let layout = def.layout()?;
    let len = match def.fields().last() {
        Some(last) => match def.extent_for_array(&last.name) {
            Some(extent) if extent.strategy == ExtentStrategy::MaskCapacity => {
                counted_prefix_len(memory, addr, def, extent, &last.ty)?
            }
            _ => layout.size,
        },
        None => layout.size,
    };

    let mut bytes = memory.read(addr, len)?;
    bytes.resize(layout.size, 0);
    let total = inline_extent_end(def, &bytes, 0)?;
    if total > bytes.len() {
        bytes = memory.read(addr, total)?;
    }
    Ok(bytes)
}

/// Bytes of a struct up to the last counted element of its final
/// capacity array
fn counted_prefix_len(
    memory: &dyn Memory,
    addr: usize,
    def: &StructDef,
    extent: &CountedExtent,
    array_ty: &TypeDescriptor,
) -> MarshalResult<usize> {
    let layout = def.layout()?;
    let array_offset = layout.offset_of(&extent.array).unwrap_or(layout.size);
    let count_offset = layout.offset_of(&extent.count).unwrap_or(layout.size);
    let (Some((kind, order)), Some(element)) = (
        def.field(&extent.count).and_then(|f| f.ty.as_primitive()),
        array_element(array_ty),
    ) else {
        return Ok(layout.size);
    };
    if count_offset + kind.size() > array_offset {
        return Ok(layout.size);
    }

    let prefix = memory.read(addr, array_offset)?;
    let count = read_uint(&prefix, count_offset, kind.size(), order)? as usize;
    let stride = LayoutCalculator::stride_of(&element)?;
    Ok(count
        .saturating_mul(stride)
        .saturating_add(array_offset)
        .min(layout.size))
}

/// End offset of a struct including any inline counted tail, read from the
/// header bytes already in `source`
pub(crate) fn inline_extent_end(def: &StructDef, source: &[u8], base: usize) -> MarshalResult<usize> {
    let layout = def.layout()?;
    let mut end = base + layout.size;
    for extent in def.extents() {
        if extent.strategy != ExtentStrategy::TrailingInline {
            continue;
        }
        let (Some(count_field), Some(array_field)) = (def.field(&extent.count), def.field(&extent.array)) else {
            continue;
        };
        let Some((kind, order)) = count_field.ty.as_primitive() else {
            continue;
        };
        let count_offset = base + layout.offset_of(&extent.count).unwrap_or_default();
        let count = read_uint(source, count_offset, kind.size(), order)? as usize;
        let element = array_element(&array_field.ty).ok_or_else(|| DescriptorError::InvalidExtent {
            owner: def.name().to_string(),
            reason: format!("field '{}' does not hold an array", extent.array),
        })?;
        let array_offset = base + layout.offset_of(&extent.array).unwrap_or_default();
        let stride = LayoutCalculator::stride_of(&element)?;
        end = end.max(span_end(array_offset, count, stride, source.len())?);
    }
    Ok(end)
}

/// `base + count * stride`, or `BufferTooSmall` when it overflows
pub(crate) fn span_end(base: usize, count: usize, stride: usize, available: usize) -> MarshalResult<usize> {
    count
        .checked_mul(stride)
        .and_then(|len| len.checked_add(base))
        .ok_or(MarshalError::BufferTooSmall {
            required: usize::MAX,
            available,
        })
}

/// Decoded form of an all-zero element
fn zero_value(element: &TypeDescriptor) -> MarshalResult<ManagedValue> {
    let size = LayoutCalculator::size_of(element)?;
    Decoder::detached().decode(&vec![0u8; size], element, 0)
}

fn primitive_value(bits: u64, kind: PrimitiveKind) -> ManagedValue {
    let width = kind.size() * 8;
    match kind {
        PrimitiveKind::Bool => ManagedValue::Bool(bits != 0),
        PrimitiveKind::F32 => ManagedValue::Float(f32::from_bits(bits as u32) as f64),
        PrimitiveKind::F64 => ManagedValue::Float(f64::from_bits(bits)),
        _ if kind.is_signed() => {
            let shift = 64 - width;
            ManagedValue::Int(((bits << shift) as i64) >> shift)
        }
        _ => ManagedValue::UInt(bits),
    }
}
