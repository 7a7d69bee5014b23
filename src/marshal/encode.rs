//! Encoder: managed value tree -> native bytes.
//!
//! Pointer targets (strings, boxed values, arrays) are allocated in the
//! caller's [`CallArena`] and stay valid until the arena is dropped, which
//! the call binder does only after the native call has returned.

use crate::descriptor::{
    ByteOrder, CountedExtent, ExtentStrategy, LayoutCalculator, OpaqueType, PrimitiveKind,
    StructDef, TypeDescriptor, TypeKind, UnionDef,
};
use crate::error::{DescriptorError, FieldPath, MarshalError, MarshalResult};
use crate::ffi::HandleRegistry;
use crate::value::ManagedValue;

use super::buffer::{encode_ansi, encode_wide, write_uint, zero_fill, CallArena, NativeBuffer};
use super::decode::span_end;

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Writes managed values into native layout
pub struct Encoder<'a> {
    arena: &'a mut CallArena,
    callbacks: Option<&'a HandleRegistry>,
}

impl<'a> Encoder<'a> {
    pub fn new(arena: &'a mut CallArena) -> Self {
        Self {
            arena,
            callbacks: None,
        }
    }

    /// Allow callback values, registering them with `registry`
    pub fn with_callbacks(mut self, registry: &'a HandleRegistry) -> Self {
        self.callbacks = Some(registry);
        self
    }

    /// Encode `value` as `ty` into `target` at `base`
    pub fn encode(
        &mut self,
        value: &ManagedValue,
        ty: &TypeDescriptor,
        target: &mut [u8],
        base: usize,
    ) -> MarshalResult<()> {
        self.encode_at(value, ty, target, base, &FieldPath::root())
    }

    /// Encode into a fresh buffer sized for the value (including inline tails)
    pub fn encode_to_buffer(
        &mut self,
        value: &ManagedValue,
        ty: &TypeDescriptor,
    ) -> MarshalResult<NativeBuffer> {
        let mut buffer = NativeBuffer::zeroed(encoded_size(value, ty)?);
        self.encode(value, ty, buffer.as_mut_bytes(), 0)?;
        Ok(buffer)
    }

    pub(crate) fn encode_at(
        &mut self,
        value: &ManagedValue,
        ty: &TypeDescriptor,
        target: &mut [u8],
        base: usize,
        path: &FieldPath,
    ) -> MarshalResult<()> {
        let ty = ty.resolved();
        match ty.kind() {
            TypeKind::Primitive(kind, order) => {
                let bits = primitive_bits(value, *kind, path)?;
                write_uint(target, base, kind.size(), bits, *order)
            }
            TypeKind::Pointer(pointee) => {
                let address = self.pointer_address(value, pointee, path)?;
                write_uint(target, base, POINTER_SIZE, address as u64, ByteOrder::Native)
            }
            TypeKind::FixedArray { element, count } => {
                self.encode_array(value, element, *count, target, base, path)
            }
            TypeKind::Struct(def) => self.encode_struct(value, def, target, base, path),
            TypeKind::Union(def) => self.encode_union(value, def, target, base, path),
            TypeKind::Opaque(opaque) => encode_blob(value, opaque, target, base, path),
            TypeKind::Void | TypeKind::Function(_) => Err(DescriptorError::Unsized {
                what: ty.to_string(),
            }
            .into()),
        }
    }

    fn pointer_address(
        &mut self,
        value: &ManagedValue,
        pointee: &TypeDescriptor,
        path: &FieldPath,
    ) -> MarshalResult<usize> {
        let target = pointee.resolved();
        match value {
            ManagedValue::Null => Ok(0),
            ManagedValue::Pointer(addr) => Ok(*addr),
            ManagedValue::Handle(handle) => {
                if let TypeKind::Opaque(opaque) = target.kind() {
                    if opaque.name() != &*handle.kind {
                        return Err(MarshalError::mismatch(
                            path,
                            format!("{} handle", opaque.name()),
                            format!("{} handle", handle.kind),
                        ));
                    }
                }
                Ok(handle.raw)
            }
            ManagedValue::Callback(callback) => {
                if !matches!(target.kind(), TypeKind::Function(_)) {
                    return Err(MarshalError::mismatch(path, pointee.to_string(), "callback"));
                }
                let registry = self.callbacks.ok_or_else(|| {
                    MarshalError::mismatch(path, "callback with a handle registry", "callback")
                })?;
                registry.register(callback, target)
            }
            ManagedValue::Capacity(n) => {
                let stride = LayoutCalculator::stride_of(target)?;
                let (_, addr) = self.arena.alloc(span_end(0, *n, stride, 0)?);
                Ok(addr)
            }
            ManagedValue::String(s) => match target.as_primitive() {
                Some((PrimitiveKind::Char16, _)) => Ok(self.arena.alloc_bytes(&encode_wide(s))),
                Some((PrimitiveKind::Char8, _)) => Ok(self.arena.alloc_bytes(&encode_ansi(s))),
                _ => self.boxed(value, target, path),
            },
            ManagedValue::Bytes(bytes) if is_byte_like(target) => Ok(self.arena.alloc_bytes(bytes)),
            ManagedValue::Array(items) if !matches!(target.kind(), TypeKind::FixedArray { .. }) => {
                // Pointer to the first element of a run
                self.element_run(items, target, path)
            }
            _ => self.boxed(value, target, path),
        }
    }

    /// Encode `value` as a standalone pointee and return its address
    fn boxed(
        &mut self,
        value: &ManagedValue,
        pointee: &TypeDescriptor,
        path: &FieldPath,
    ) -> MarshalResult<usize> {
        let mut block = NativeBuffer::zeroed(encoded_size(value, pointee)?);
        self.encode_at(value, pointee, block.as_mut_bytes(), 0, &path.deref())?;
        Ok(self.arena.adopt(block))
    }

    fn element_run(
        &mut self,
        items: &[ManagedValue],
        element: &TypeDescriptor,
        path: &FieldPath,
    ) -> MarshalResult<usize> {
        let stride = LayoutCalculator::stride_of(element)?;
        let mut block = NativeBuffer::zeroed(items.len() * stride);
        let run = path.deref();
        for (i, item) in items.iter().enumerate() {
            self.encode_at(item, element, block.as_mut_bytes(), i * stride, &run.index(i))?;
        }
        Ok(self.arena.adopt(block))
    }

    fn encode_array(
        &mut self,
        value: &ManagedValue,
        element: &TypeDescriptor,
        count: usize,
        target: &mut [u8],
        base: usize,
        path: &FieldPath,
    ) -> MarshalResult<()> {
        let stride = LayoutCalculator::stride_of(element)?;
        let too_long = |len: usize| {
            MarshalError::mismatch(
                path,
                format!("at most {} elements of {}", count, element),
                format!("{} elements", len),
            )
        };

        match (value, element.as_primitive()) {
            (ManagedValue::String(s), Some((PrimitiveKind::Char16, order))) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                if units.len() > count {
                    return Err(too_long(units.len()));
                }
                zero_fill(target, base, count * stride)?;
                for (i, unit) in units.iter().enumerate() {
                    write_uint(target, base + i * stride, 2, *unit as u64, order)?;
                }
                Ok(())
            }
            (ManagedValue::String(s), Some((PrimitiveKind::Char8, _))) => {
                copy_bytes(s.as_bytes(), count, target, base).map_err(|_| too_long(s.len()))
            }
            (ManagedValue::Bytes(bytes), _) if is_byte_like(element) => {
                copy_bytes(bytes, count, target, base).map_err(|_| too_long(bytes.len()))
            }
            (ManagedValue::Array(items), _) => {
                if items.len() > count {
                    return Err(too_long(items.len()));
                }
                zero_fill(target, base, count * stride)?;
                for (i, item) in items.iter().enumerate() {
                    self.encode_at(item, element, target, base + i * stride, &path.index(i))?;
                }
                Ok(())
            }
            _ => Err(MarshalError::mismatch(
                path,
                format!("{}[{}]", element, count),
                value.type_name(),
            )),
        }
    }

    fn encode_struct(
        &mut self,
        value: &ManagedValue,
        def: &StructDef,
        target: &mut [u8],
        base: usize,
        path: &FieldPath,
    ) -> MarshalResult<()> {
        let ManagedValue::Record(members) = value else {
            return Err(MarshalError::mismatch(
                path,
                format!("struct {}", def.name()),
                value.type_name(),
            ));
        };
        for (name, _) in members {
            if def.field(name).is_none() {
                return Err(MarshalError::mismatch(
                    &path.field(name),
                    format!("a member of struct {}", def.name()),
                    "unknown member",
                ));
            }
        }

        let layout = def.layout()?;
        zero_fill(target, base, layout.size)?;
        log::trace!("[encode] struct {} at {} ({})", def.name(), base, path);

        for (field, (_, offset)) in def.fields().iter().zip(layout.field_offsets()) {
            let offset = base + offset;
            let field_path = path.field(&field.name);

            if let Some(extent) = def.extent_counted_by(&field.name) {
                let count = extent_count(value, def, extent, &field_path)?;
                self.encode_at(&ManagedValue::UInt(count as u64), &field.ty, target, offset, &field_path)?;
                continue;
            }

            let member = value.get(&field.name);
            match def.extent_for_array(&field.name).map(|e| e.strategy) {
                Some(ExtentStrategy::TrailingPointer) => {
                    let address = match member {
                        None | Some(ManagedValue::Null) => 0,
                        Some(ManagedValue::Array(items)) if items.is_empty() => 0,
                        Some(other) => match field.ty.resolved().kind() {
                            TypeKind::Pointer(pointee) => {
                                self.pointer_address(other, pointee, &field_path)?
                            }
                            _ => return Err(extent_error(def, &field.name)),
                        },
                    };
                    write_uint(target, offset, POINTER_SIZE, address as u64, ByteOrder::Native)?;
                }
                Some(ExtentStrategy::TrailingInline) => {
                    let element = array_element(&field.ty)
                        .ok_or_else(|| extent_error(def, &field.name))?;
                    let stride = LayoutCalculator::stride_of(&element)?;
                    match member {
                        None | Some(ManagedValue::Null) => {}
                        Some(ManagedValue::Array(items)) => {
                            for (i, item) in items.iter().enumerate() {
                                self.encode_at(
                                    item,
                                    &element,
                                    target,
                                    offset + i * stride,
                                    &field_path.index(i),
                                )?;
                            }
                        }
                        Some(other) => {
                            return Err(MarshalError::mismatch(
                                &field_path,
                                format!("array of {}", element),
                                other.type_name(),
                            ))
                        }
                    }
                }
                Some(ExtentStrategy::MaskCapacity) | None => {
                    if let Some(member) = member {
                        self.encode_at(member, &field.ty, target, offset, &field_path)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn encode_union(
        &mut self,
        value: &ManagedValue,
        def: &UnionDef,
        target: &mut [u8],
        base: usize,
        path: &FieldPath,
    ) -> MarshalResult<()> {
        let ManagedValue::Record(members) = value else {
            return Err(MarshalError::mismatch(
                path,
                format!("union {}", def.name()),
                value.type_name(),
            ));
        };
        for (name, _) in members {
            if def.field(name).is_none() {
                return Err(MarshalError::mismatch(
                    &path.field(name),
                    format!("an arm of union {}", def.name()),
                    "unknown arm",
                ));
            }
        }

        let layout = def.layout()?;
        zero_fill(target, base, layout.size)?;
        // Arms overlap; later arms overwrite earlier ones
        for field in def.fields() {
            if let Some(member) = value.get(&field.name) {
                self.encode_at(member, &field.ty, target, base, &path.field(&field.name))?;
            }
        }
        Ok(())
    }
}

/// Bytes needed to encode `value` as `ty`, including inline trailing elements
pub fn encoded_size(value: &ManagedValue, ty: &TypeDescriptor) -> MarshalResult<usize> {
    let ty = ty.resolved();
    let size = LayoutCalculator::size_of(ty)?;
    let Some(def) = ty.as_struct() else {
        return Ok(size);
    };

    let layout = def.layout()?;
    let mut total = size;
    for extent in def.extents() {
        if extent.strategy != ExtentStrategy::TrailingInline {
            continue;
        }
        let field = def
            .field(&extent.array)
            .ok_or_else(|| extent_error(def, &extent.array))?;
        let element = array_element(&field.ty).ok_or_else(|| extent_error(def, &extent.array))?;
        let offset = layout.offset_of(&extent.array).unwrap_or(size);
        let n = value.get(&extent.array).map(element_count).unwrap_or(0);
        total = total.max(span_end(offset, n, LayoutCalculator::stride_of(&element)?, size)?);
    }
    Ok(total)
}

/// Resolve the value written to an extent's count field
fn extent_count(
    value: &ManagedValue,
    def: &StructDef,
    extent: &CountedExtent,
    path: &FieldPath,
) -> MarshalResult<usize> {
    let len = value.get(&extent.array).map(element_count).unwrap_or(0);
    let declared = match value.get(&extent.count) {
        None => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            MarshalError::mismatch(path, "unsigned count", v.type_name())
        })? as usize),
    };

    match extent.strategy {
        ExtentStrategy::MaskCapacity => {
            let capacity = def
                .field(&extent.array)
                .and_then(|f| match f.ty.resolved().kind() {
                    TypeKind::FixedArray { count, .. } => Some(*count),
                    _ => None,
                })
                .ok_or_else(|| extent_error(def, &extent.array))?;
            let count = declared.unwrap_or(len);
            if count > capacity {
                return Err(MarshalError::mismatch(
                    path,
                    format!("count at most {}", capacity),
                    count.to_string(),
                ));
            }
            Ok(count)
        }
        ExtentStrategy::TrailingPointer | ExtentStrategy::TrailingInline => match declared {
            Some(count) if count != len => Err(MarshalError::mismatch(
                path,
                format!("{} (length of {})", len, extent.array),
                count.to_string(),
            )),
            _ => Ok(len),
        },
    }
}

fn element_count(value: &ManagedValue) -> usize {
    match value {
        ManagedValue::Array(items) => items.len(),
        ManagedValue::Bytes(bytes) => bytes.len(),
        _ => 0,
    }
}

/// Element type of an inline array or the pointee of a pointer
pub(crate) fn array_element(ty: &TypeDescriptor) -> Option<TypeDescriptor> {
    match ty.resolved().kind() {
        TypeKind::FixedArray { element, .. } => Some(element.clone()),
        TypeKind::Pointer(pointee) => Some(pointee.clone()),
        _ => None,
    }
}

fn extent_error(def: &StructDef, field: &str) -> MarshalError {
    DescriptorError::InvalidExtent {
        owner: def.name().to_string(),
        reason: format!("field '{}' does not hold an array", field),
    }
    .into()
}

fn is_byte_like(ty: &TypeDescriptor) -> bool {
    match ty.resolved().kind() {
        TypeKind::Primitive(kind, _) => kind.size() == 1,
        TypeKind::Opaque(_) => true,
        _ => false,
    }
}

fn copy_bytes(bytes: &[u8], count: usize, target: &mut [u8], base: usize) -> MarshalResult<()> {
    if bytes.len() > count {
        return Err(MarshalError::BufferTooSmall {
            required: bytes.len(),
            available: count,
        });
    }
    zero_fill(target, base, count)?;
    target[base..base + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn encode_blob(
    value: &ManagedValue,
    opaque: &OpaqueType,
    target: &mut [u8],
    base: usize,
    path: &FieldPath,
) -> MarshalResult<()> {
    let size = opaque
        .size_hint()
        .ok_or_else(|| DescriptorError::UnresolvedForward {
            name: opaque.name().to_string(),
        })?;
    match value {
        ManagedValue::Null => zero_fill(target, base, size),
        ManagedValue::Bytes(bytes) => copy_bytes(bytes, size, target, base).map_err(|_| {
            MarshalError::mismatch(path, format!("at most {} bytes", size), bytes.len().to_string())
        }),
        other => Err(MarshalError::mismatch(
            path,
            format!("opaque {} bytes", opaque.name()),
            other.type_name(),
        )),
    }
}

/// Convert a scalar value to the raw bits of `kind`, range-checked
pub(crate) fn primitive_bits(
    value: &ManagedValue,
    kind: PrimitiveKind,
    path: &FieldPath,
) -> MarshalResult<u64> {
    let mismatch = || MarshalError::mismatch(path, kind.to_string(), value.type_name());
    let out_of_range = |shown: String| MarshalError::mismatch(path, format!("{} in range", kind), shown);
    let width = kind.size() * 8;

    match kind {
        PrimitiveKind::Bool => match value {
            ManagedValue::Bool(b) => Ok(*b as u64),
            _ => Err(mismatch()),
        },
        PrimitiveKind::F32 => match value {
            ManagedValue::Float(f) => Ok((*f as f32).to_bits() as u64),
            _ => Err(mismatch()),
        },
        PrimitiveKind::F64 => match value {
            ManagedValue::Float(f) => Ok(f.to_bits()),
            _ => Err(mismatch()),
        },
        _ if kind.is_signed() => {
            let v = match value {
                ManagedValue::Int(v) => *v,
                ManagedValue::UInt(v) => i64::try_from(*v).map_err(|_| out_of_range(v.to_string()))?,
                _ => return Err(mismatch()),
            };
            let min = -(1i128 << (width - 1));
            let max = (1i128 << (width - 1)) - 1;
            if (v as i128) < min || (v as i128) > max {
                return Err(out_of_range(v.to_string()));
            }
            Ok((v as u64) & low_mask(width))
        }
        _ => {
            let v = match value {
                ManagedValue::UInt(v) => *v,
                ManagedValue::Int(v) => u64::try_from(*v).map_err(|_| out_of_range(v.to_string()))?,
                ManagedValue::Pointer(p) if kind == PrimitiveKind::USize => *p as u64,
                ManagedValue::Handle(h) if kind == PrimitiveKind::USize => h.raw as u64,
                _ => return Err(mismatch()),
            };
            if width < 64 && v >> width != 0 {
                return Err(out_of_range(v.to_string()));
            }
            Ok(v)
        }
    }
}

fn low_mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
