//! Registry value data
//!
//! `RegQueryValueExW` returns raw bytes plus a `REG_*` type code; the type
//! code selects the decoding.

use once_cell::sync::OnceCell;

use crate::descriptor::{PrimitiveKind, TypeDescriptor};
use crate::error::{FieldPath, MarshalError, MarshalResult};
use crate::marshal::{encode_wide, CallArena, Decoder, Encoder, VariantTable};
use crate::value::ManagedValue;

pub const REG_NONE: u32 = 0;
pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;
pub const REG_DWORD_BIG_ENDIAN: u32 = 5;
pub const REG_MULTI_SZ: u32 = 7;
pub const REG_QWORD: u32 = 11;

fn wide_units(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

fn decode_sz(decoder: &Decoder<'_>, bytes: &[u8]) -> MarshalResult<ManagedValue> {
    // Stored strings are not guaranteed to be terminated
    Ok(ManagedValue::String(decoder.decode_wide_str(bytes, 0)?))
}

fn decode_multi_sz(_: &Decoder<'_>, bytes: &[u8]) -> MarshalResult<ManagedValue> {
    let units: Vec<u16> = wide_units(bytes).collect();
    let strings = units
        .split(|&unit| unit == 0)
        .take_while(|s| !s.is_empty())
        .map(|s| ManagedValue::String(String::from_utf16_lossy(s)))
        .collect();
    Ok(ManagedValue::Array(strings))
}

fn decode_binary(_: &Decoder<'_>, bytes: &[u8]) -> MarshalResult<ManagedValue> {
    Ok(ManagedValue::Bytes(bytes.to_vec()))
}

/// `REG_*` type code -> value shape
pub fn registry_value_table() -> &'static VariantTable {
    static TABLE: OnceCell<VariantTable> = OnceCell::new();
    TABLE.get_or_init(|| {
        VariantTable::new("REG_TYPE")
            .register_raw(REG_NONE, decode_binary)
            .register_raw(REG_SZ, decode_sz)
            .register_raw(REG_EXPAND_SZ, decode_sz)
            .register_raw(REG_BINARY, decode_binary)
            .register(REG_DWORD, TypeDescriptor::u32())
            .register(REG_DWORD_BIG_ENDIAN, TypeDescriptor::big_endian(PrimitiveKind::U32))
            .register_raw(REG_MULTI_SZ, decode_multi_sz)
            .register(REG_QWORD, TypeDescriptor::u64())
    })
}

/// Decode value data returned alongside `value_type`
pub fn decode_registry_value(data: &[u8], value_type: u32) -> MarshalResult<ManagedValue> {
    Decoder::detached().decode_variant(data, registry_value_table(), value_type)
}

/// Encode `value` as registry data of `value_type`
pub fn encode_registry_value(value: &ManagedValue, value_type: u32) -> MarshalResult<Vec<u8>> {
    let root = FieldPath::root();
    match value_type {
        REG_SZ | REG_EXPAND_SZ => value
            .as_str()
            .map(encode_wide)
            .ok_or_else(|| MarshalError::mismatch(&root, "string", value.type_name())),
        REG_MULTI_SZ => {
            let items = value
                .as_array()
                .ok_or_else(|| MarshalError::mismatch(&root, "array of strings", value.type_name()))?;
            let mut data = Vec::new();
            for (i, item) in items.iter().enumerate() {
                let s = item
                    .as_str()
                    .ok_or_else(|| MarshalError::mismatch(&root.index(i), "string", item.type_name()))?;
                data.extend(encode_wide(s));
            }
            data.extend_from_slice(&[0, 0]);
            Ok(data)
        }
        REG_NONE | REG_BINARY => match value {
            ManagedValue::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(MarshalError::mismatch(&root, "bytes", other.type_name())),
        },
        _ => match registry_value_table().get(value_type) {
            Some(crate::marshal::VariantShape::Typed { descriptor, .. }) => {
                let mut arena = CallArena::new();
                let buffer = Encoder::new(&mut arena).encode_to_buffer(value, descriptor)?;
                Ok(buffer.as_bytes().to_vec())
            }
            _ => Err(MarshalError::UnsupportedDiscriminant {
                table: registry_value_table().name().to_string(),
                discriminant: value_type,
            }),
        },
    }
}
