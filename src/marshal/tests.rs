//! Marshal Module Tests

use std::collections::BTreeMap;

use super::*;
use crate::descriptor::{ExtentStrategy, LayoutCalculator, PrimitiveKind, TypeDescriptor};
use crate::error::{FieldPath, MarshalError, MarshalResult};
use crate::value::{Callback, ManagedValue, RawHandle};

/// Memory backed by a few fake regions keyed by start address
#[derive(Default)]
struct FakeMemory {
    regions: BTreeMap<usize, Vec<u8>>,
}

impl FakeMemory {
    fn with(mut self, addr: usize, bytes: Vec<u8>) -> Self {
        self.regions.insert(addr, bytes);
        self
    }
}

impl Memory for FakeMemory {
    fn read(&self, addr: usize, len: usize) -> MarshalResult<Vec<u8>> {
        let (start, bytes) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(MarshalError::InvalidAddress { addr })?;
        let offset = addr - start;
        if offset + len > bytes.len() {
            return Err(MarshalError::InvalidAddress { addr });
        }
        Ok(bytes[offset..offset + len].to_vec())
    }
}

fn point() -> TypeDescriptor {
    TypeDescriptor::structure("POINT")
        .field("x", TypeDescriptor::i32())
        .field("y", TypeDescriptor::i32())
        .build()
        .unwrap()
}

fn masked_sid() -> TypeDescriptor {
    TypeDescriptor::structure("SID")
        .field("Revision", TypeDescriptor::u8())
        .field("SubAuthorityCount", TypeDescriptor::u8())
        .field("IdentifierAuthority", TypeDescriptor::array(TypeDescriptor::u8(), 6).unwrap())
        .field("SubAuthority", TypeDescriptor::array(TypeDescriptor::u32(), 15).unwrap())
        .counted_by("SubAuthority", "SubAuthorityCount", ExtentStrategy::MaskCapacity)
        .build()
        .unwrap()
}

fn pointer_list() -> TypeDescriptor {
    TypeDescriptor::structure("LIST")
        .field("Count", TypeDescriptor::u32())
        .field("Items", TypeDescriptor::pointer(TypeDescriptor::u16()))
        .counted_by("Items", "Count", ExtentStrategy::TrailingPointer)
        .build()
        .unwrap()
}

fn inline_list() -> TypeDescriptor {
    TypeDescriptor::structure("INLINE_LIST")
        .field("Count", TypeDescriptor::u32())
        .field("Items", TypeDescriptor::array(TypeDescriptor::u32(), 1).unwrap())
        .counted_by("Items", "Count", ExtentStrategy::TrailingInline)
        .build()
        .unwrap()
}

fn encode(value: &ManagedValue, ty: &TypeDescriptor) -> MarshalResult<Vec<u8>> {
    let mut arena = CallArena::new();
    let buffer = Encoder::new(&mut arena).encode_to_buffer(value, ty)?;
    Ok(buffer.as_bytes().to_vec())
}

fn uints(values: &[u64]) -> ManagedValue {
    ManagedValue::Array(values.iter().map(|&v| ManagedValue::UInt(v)).collect())
}

#[test]
fn test_encode_point() {
    let value = ManagedValue::record([("x", 10i32.into()), ("y", (-5i32).into())]);
    let bytes = encode(&value, &point()).unwrap();
    assert_eq!(bytes, vec![0x0A, 0, 0, 0, 0xFB, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn test_fixed_shape_round_trip() {
    let record = TypeDescriptor::structure("RECORD")
        .field("flag", TypeDescriptor::bool())
        .field("small", TypeDescriptor::i8())
        .field("wide", TypeDescriptor::u64())
        .field("ratio", TypeDescriptor::f64())
        .field("name", TypeDescriptor::array(TypeDescriptor::char16(), 8).unwrap())
        .field("origin", point())
        .field("path", TypeDescriptor::array(point(), 2).unwrap())
        .field("tag", TypeDescriptor::array(TypeDescriptor::char8(), 4).unwrap())
        .build()
        .unwrap();

    let value = ManagedValue::record([
        ("flag", true.into()),
        ("small", (-7i8).into()),
        ("wide", u64::MAX.into()),
        ("ratio", 0.5f64.into()),
        ("name", "Hi".into()),
        ("origin", ManagedValue::record([("x", 1i32.into()), ("y", 2i32.into())])),
        (
            "path",
            ManagedValue::Array(vec![
                ManagedValue::record([("x", (-1i32).into()), ("y", 0i32.into())]),
                ManagedValue::record([("x", 3i32.into()), ("y", i32::MIN.into())]),
            ]),
        ),
        ("tag", "abc".into()),
    ]);

    let bytes = encode(&value, &record).unwrap();
    assert_eq!(bytes.len(), LayoutCalculator::size_of(&record).unwrap());
    let decoded = Decoder::detached().decode(&bytes, &record, 0).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn test_char16_array_decodes_le_unit() {
    // One UTF-16LE unit: 52 00 is 'R', not the two ASCII bytes "AR"
    let ty = TypeDescriptor::array(TypeDescriptor::char16(), 1).unwrap();
    let decoded = Decoder::detached().decode(&[0x52, 0x00], &ty, 0).unwrap();
    assert_eq!(decoded, ManagedValue::String("R".to_string()));
    assert_eq!(decoded.as_str().map(|s| s.encode_utf16().count()), Some(1));
}

#[test]
fn test_ascii_bytes_in_char16_array() {
    // The bytes of "AR" form the single unit 0x5241
    let wide = TypeDescriptor::array(TypeDescriptor::char16(), 1).unwrap();
    let decoded = Decoder::detached().decode(b"AR", &wide, 0).unwrap();
    assert_eq!(decoded, ManagedValue::String("\u{5241}".to_string()));

    let narrow = TypeDescriptor::array(TypeDescriptor::char8(), 2).unwrap();
    let decoded = Decoder::detached().decode(b"AR", &narrow, 0).unwrap();
    assert_eq!(decoded, ManagedValue::String("AR".to_string()));
}

#[test]
fn test_unmapped_discriminant() {
    let table = VariantTable::new("INFO_CLASS")
        .register(1, TypeDescriptor::u32())
        .register(2, TypeDescriptor::u64())
        .register(3, point());
    let err = Decoder::detached()
        .decode_variant(&[0u8; 16], &table, 7)
        .unwrap_err();
    assert_eq!(
        err,
        MarshalError::UnsupportedDiscriminant {
            table: "INFO_CLASS".to_string(),
            discriminant: 7
        }
    );
    assert_eq!(table.discriminants().collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn test_variant_shapes() {
    let table = VariantTable::new("SHAPES")
        .register(1, point())
        .register_with_post(2, TypeDescriptor::u32(), |v| {
            Ok(ManagedValue::Bool(v.as_u64() == Some(1)))
        })
        .register_raw(3, |_, bytes| Ok(ManagedValue::Bytes(bytes.to_vec())));
    let decoder = Decoder::detached();

    let bytes = [1, 0, 0, 0, 2, 0, 0, 0];
    assert_eq!(
        decoder.decode_variant(&bytes, &table, 1).unwrap(),
        ManagedValue::record([("x", 1i32.into()), ("y", 2i32.into())])
    );
    assert_eq!(
        decoder.decode_variant(&bytes, &table, 2).unwrap(),
        ManagedValue::Bool(true)
    );
    assert_eq!(
        decoder.decode_variant(&bytes[..3], &table, 3).unwrap(),
        ManagedValue::Bytes(vec![1, 0, 0])
    );
}

#[test]
fn test_capacity_slots_are_masked() {
    let sid = masked_sid();
    let mut bytes = vec![0u8; LayoutCalculator::size_of(&sid).unwrap()];
    assert_eq!(bytes.len(), 68);
    bytes[0] = 1;
    bytes[1] = 2;
    bytes[7] = 5;
    bytes[8..12].copy_from_slice(&32u32.to_le_bytes());
    bytes[12..16].copy_from_slice(&544u32.to_le_bytes());
    for slot in 2..15 {
        let at = 8 + slot * 4;
        bytes[at..at + 4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    }

    let decoded = Decoder::detached().decode(&bytes, &sid, 0).unwrap();
    let subs = decoded.get("SubAuthority").and_then(|v| v.as_array()).unwrap();
    assert_eq!(subs.len(), 15);
    assert_eq!(subs[0], ManagedValue::UInt(32));
    assert_eq!(subs[1], ManagedValue::UInt(544));
    assert!(subs[2..].iter().all(|v| *v == ManagedValue::UInt(0)));
}

#[test]
fn test_capacity_count_over_limit() {
    let sid = masked_sid();
    let mut bytes = vec![0u8; 68];
    bytes[1] = 16;
    let err = Decoder::detached().decode(&bytes, &sid, 0).unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { .. }));
}

#[test]
fn test_capacity_encode_fills_count() {
    let sid = masked_sid();
    let value = ManagedValue::record([
        ("Revision", 1u8.into()),
        ("IdentifierAuthority", uints(&[0, 0, 0, 0, 0, 5])),
        ("SubAuthority", uints(&[32, 544])),
    ]);
    let bytes = encode(&value, &sid).unwrap();
    assert_eq!(bytes[1], 2);
    assert!(bytes[16..].iter().all(|&b| b == 0));

    let too_many = ManagedValue::record([
        ("SubAuthorityCount", 3u8.into()),
        ("SubAuthority", uints(&[1; 16])),
    ]);
    assert!(encode(&too_many, &sid).is_err());
}

#[test]
fn test_two_phase_pointer_count() {
    let list = pointer_list();
    let mut header = vec![0u8; 16];
    header[0..4].copy_from_slice(&3u32.to_le_bytes());
    header[8..16].copy_from_slice(&0x1000u64.to_le_bytes());

    // Allocation holds four elements; only three are counted
    let memory = FakeMemory::default().with(0x1000, vec![1, 0, 2, 0, 3, 0, 9, 9]);
    let decoded = Decoder::new(&memory).decode(&header, &list, 0).unwrap();
    assert_eq!(decoded.get("Count"), Some(&ManagedValue::UInt(3)));
    assert_eq!(decoded.get("Items"), Some(&uints(&[1, 2, 3])));
}

#[test]
fn test_pointer_count_edge_cases() {
    let list = pointer_list();

    let empty = vec![0u8; 16];
    let decoded = Decoder::detached().decode(&empty, &list, 0).unwrap();
    assert_eq!(decoded.get("Items"), Some(&ManagedValue::Array(Vec::new())));

    let mut dangling = vec![0u8; 16];
    dangling[0] = 2;
    let err = Decoder::detached().decode(&dangling, &list, 0).unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { .. }));

    dangling[8] = 0x40;
    let err = Decoder::detached().decode(&dangling, &list, 0).unwrap_err();
    assert_eq!(err, MarshalError::InvalidAddress { addr: 0x40 });
}

#[test]
fn test_pointer_count_encode_rejects_mismatch() {
    let value = ManagedValue::record([("Count", 5u32.into()), ("Items", uints(&[1, 2]))]);
    let err = encode(&value, &pointer_list()).unwrap_err();
    match err {
        MarshalError::TypeMismatch { path, .. } => assert_eq!(path.to_string(), "Count"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_inline_tail_round_trip() {
    let list = inline_list();
    let value = ManagedValue::record([("Items", uints(&[7, 8, 9]))]);
    assert_eq!(encoded_size(&value, &list).unwrap(), 16);

    let bytes = encode(&value, &list).unwrap();
    assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
    assert_eq!(&bytes[12..16], &9u32.to_le_bytes());

    let decoded = Decoder::detached().decode(&bytes, &list, 0).unwrap();
    assert_eq!(
        decoded,
        ManagedValue::record([("Count", 3u32.into()), ("Items", uints(&[7, 8, 9]))])
    );
}

#[test]
fn test_inline_tail_short_buffer() {
    let mut bytes = vec![0u8; 8];
    bytes[0] = 4;
    let err = Decoder::detached().decode(&bytes, &inline_list(), 0).unwrap_err();
    assert!(matches!(err, MarshalError::BufferTooSmall { .. }));
}

#[test]
fn test_union_arms_share_offset() {
    let value_union = TypeDescriptor::union("VALUE")
        .field("dword", TypeDescriptor::u32())
        .field("bytes", TypeDescriptor::array(TypeDescriptor::u8(), 4).unwrap())
        .build()
        .unwrap();
    let value = ManagedValue::record([
        ("dword", 0x0403_0201u32.into()),
        ("bytes", uints(&[1, 2, 3, 4])),
    ]);
    let bytes = encode(&value, &value_union).unwrap();
    assert_eq!(bytes, vec![1, 2, 3, 4]);
    assert_eq!(Decoder::detached().decode(&bytes, &value_union, 0).unwrap(), value);

    let one_arm = ManagedValue::record([("dword", 0xFFu32.into())]);
    let decoded = Decoder::detached()
        .decode(&encode(&one_arm, &value_union).unwrap(), &value_union, 0)
        .unwrap();
    assert_eq!(decoded.get("bytes"), Some(&uints(&[0xFF, 0, 0, 0])));
}

#[test]
fn test_union_pointer_arm_is_not_followed() {
    let number_or_text = TypeDescriptor::union("NUMBER_OR_TEXT")
        .field("num", TypeDescriptor::u64())
        .field("text", TypeDescriptor::wide_string())
        .field("next", TypeDescriptor::pointer(point()))
        .build()
        .unwrap();
    let memory = FakeMemory::default().with(0x9000, vec![0x41, 0, 0, 0]);

    let bytes = 0x1234u64.to_le_bytes();
    let decoded = Decoder::new(&memory).decode(&bytes, &number_or_text, 0).unwrap();
    assert_eq!(decoded.get("num"), Some(&ManagedValue::UInt(0x1234)));
    assert_eq!(decoded.get("text"), Some(&ManagedValue::Pointer(0x1234)));
    assert_eq!(decoded.get("next"), Some(&ManagedValue::Pointer(0x1234)));

    // Even a readable address stays raw inside a union
    let bytes = 0x9000u64.to_le_bytes();
    let decoded = Decoder::new(&memory).decode(&bytes, &number_or_text, 0).unwrap();
    assert_eq!(decoded.get("text"), Some(&ManagedValue::Pointer(0x9000)));
}

#[test]
fn test_union_inside_struct_keeps_sibling_pointers_followed() {
    let arm = TypeDescriptor::union("ARM")
        .field("raw", TypeDescriptor::u64())
        .field("ptr", TypeDescriptor::pointer(TypeDescriptor::u32()))
        .build()
        .unwrap();
    let holder = TypeDescriptor::structure("HOLDER")
        .field("value", arm)
        .field("direct", TypeDescriptor::pointer(TypeDescriptor::u32()))
        .build()
        .unwrap();
    let memory = FakeMemory::default().with(0x7000, 77u32.to_le_bytes().to_vec());

    let mut bytes = vec![0u8; 16];
    bytes[0..8].copy_from_slice(&0x7000u64.to_le_bytes());
    bytes[8..16].copy_from_slice(&0x7000u64.to_le_bytes());
    let decoded = Decoder::new(&memory).decode(&bytes, &holder, 0).unwrap();
    let value = decoded.get("value").unwrap();
    assert_eq!(value.get("ptr"), Some(&ManagedValue::Pointer(0x7000)));
    assert_eq!(decoded.get("direct"), Some(&ManagedValue::UInt(77)));
}

#[test]
fn test_huge_native_counts_do_not_overflow() {
    let wide_count = TypeDescriptor::structure("WIDE_COUNT")
        .field("Count", TypeDescriptor::u64())
        .field("Items", TypeDescriptor::array(TypeDescriptor::u32(), 0).unwrap())
        .counted_by("Items", "Count", ExtentStrategy::TrailingInline)
        .build()
        .unwrap();

    for count in [u64::MAX / 2, u64::MAX, (usize::MAX / 4) as u64 + 1] {
        let bytes = count.to_le_bytes();
        let err = Decoder::detached().decode(&bytes, &wide_count, 0).unwrap_err();
        assert_eq!(
            err,
            MarshalError::BufferTooSmall {
                required: usize::MAX,
                available: 8,
            }
        );
    }

    // Large but representable counts are still just a short buffer
    let bytes = 1000u64.to_le_bytes();
    let err = Decoder::detached().decode(&bytes, &wide_count, 0).unwrap_err();
    assert_eq!(
        err,
        MarshalError::BufferTooSmall {
            required: 8 + 4000,
            available: 8,
        }
    );
}

#[test]
fn test_huge_pointer_count_does_not_overflow() {
    let list = TypeDescriptor::structure("WIDE_LIST")
        .field("Count", TypeDescriptor::u64())
        .field("Items", TypeDescriptor::pointer(TypeDescriptor::u64()))
        .counted_by("Items", "Count", ExtentStrategy::TrailingPointer)
        .build()
        .unwrap();
    let memory = FakeMemory::default().with(0x1000, vec![0; 64]);
    let mut header = vec![0u8; 16];
    header[0..8].copy_from_slice(&u64::MAX.to_le_bytes());
    header[8..16].copy_from_slice(&0x1000u64.to_le_bytes());

    let err = Decoder::new(&memory).decode(&header, &list, 0).unwrap_err();
    assert!(matches!(
        err,
        MarshalError::BufferTooSmall {
            required: usize::MAX,
            ..
        }
    ));
}

#[test]
fn test_explicit_length_overflow() {
    let err = Decoder::detached()
        .decode_wide_str_len(&[0x41, 0x00], 0, usize::MAX)
        .unwrap_err();
    assert!(matches!(
        err,
        MarshalError::BufferTooSmall {
            required: usize::MAX,
            ..
        }
    ));
}

#[test]
fn test_mismatch_reports_path() {
    let outer = TypeDescriptor::structure("OUTER")
        .field("points", TypeDescriptor::array(point(), 2).unwrap())
        .build()
        .unwrap();
    let value = ManagedValue::record([(
        "points",
        ManagedValue::Array(vec![
            ManagedValue::record([("x", 1i32.into())]),
            ManagedValue::record([("x", "oops".into())]),
        ]),
    )]);
    match encode(&value, &outer).unwrap_err() {
        MarshalError::TypeMismatch {
            path,
            expected,
            found,
        } => {
            assert_eq!(path.to_string(), "points[1].x");
            assert_eq!(expected, "int32");
            assert_eq!(found, "string");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_unknown_member_rejected() {
    let value = ManagedValue::record([("x", 1i32.into()), ("z", 2i32.into())]);
    let err = encode(&value, &point()).unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { ref path, .. } if path.to_string() == "z"));
}

#[test]
fn test_missing_members_encode_as_zero() {
    let bytes = encode(&ManagedValue::record([("y", 7i32.into())]), &point()).unwrap();
    assert_eq!(bytes, vec![0, 0, 0, 0, 7, 0, 0, 0]);
}

#[test]
fn test_range_checks() {
    let err = encode(&ManagedValue::Int(300), &TypeDescriptor::u8()).unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { .. }));
    let err = encode(&ManagedValue::Int(-1), &TypeDescriptor::u32()).unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { .. }));
    assert_eq!(
        encode(&ManagedValue::UInt(127), &TypeDescriptor::i8()).unwrap(),
        vec![0x7F]
    );
}

#[test]
fn test_big_endian_primitives() {
    let ty = TypeDescriptor::big_endian(PrimitiveKind::U32);
    let bytes = encode(&ManagedValue::UInt(0x0102_0304), &ty).unwrap();
    assert_eq!(bytes, vec![1, 2, 3, 4]);
    assert_eq!(
        Decoder::detached().decode(&bytes, &ty, 0).unwrap(),
        ManagedValue::UInt(0x0102_0304)
    );
}

#[test]
fn test_signed_values_sign_extend() {
    let decoded = Decoder::detached()
        .decode(&[0xFE, 0xFF], &TypeDescriptor::i16(), 0)
        .unwrap();
    assert_eq!(decoded, ManagedValue::Int(-2));
}

#[test]
fn test_explicit_length_wide_string() {
    let bytes = encode_wide("Hello");
    let decoder = Decoder::detached();
    assert_eq!(decoder.decode_wide_str_len(&bytes, 2, 3).unwrap(), "ell");
    assert_eq!(decoder.decode_wide_str(&bytes, 0).unwrap(), "Hello");
    assert!(matches!(
        decoder.decode_wide_str_len(&bytes, 0, 64),
        Err(MarshalError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_string_pointer_lives_in_arena() {
    let mut arena = CallArena::new();
    let mut word = [0u8; 8];
    Encoder::new(&mut arena)
        .encode(&"Hi".into(), &TypeDescriptor::wide_string(), &mut word, 0)
        .unwrap();
    assert_eq!(arena.len(), 1);

    let memory = unsafe { ProcessMemory::new() };
    let decoded = Decoder::new(&memory)
        .decode(&word, &TypeDescriptor::wide_string(), 0)
        .unwrap();
    assert_eq!(decoded, ManagedValue::String("Hi".to_string()));

    let detached = Decoder::detached()
        .decode(&word, &TypeDescriptor::wide_string(), 0)
        .unwrap();
    assert_eq!(detached, ManagedValue::Pointer(u64::from_le_bytes(word) as usize));
}

#[test]
fn test_pointer_following_and_depth() {
    let ptr_ptr = TypeDescriptor::pointer(TypeDescriptor::pointer(TypeDescriptor::u32()));
    let memory = FakeMemory::default()
        .with(0x2000, 0x3000u64.to_le_bytes().to_vec())
        .with(0x3000, 42u32.to_le_bytes().to_vec());
    let source = 0x2000u64.to_le_bytes();

    let decoded = Decoder::new(&memory).decode(&source, &ptr_ptr, 0).unwrap();
    assert_eq!(decoded, ManagedValue::UInt(42));

    let limits = crate::config::DecodeConfig {
        max_pointer_depth: 1,
        ..Default::default()
    };
    let shallow = Decoder::new(&memory)
        .with_limits(&limits)
        .decode(&source, &ptr_ptr, 0)
        .unwrap();
    assert_eq!(shallow, ManagedValue::Pointer(0x3000));
}

#[test]
fn test_opaque_pointers_decode_to_handles() {
    let handle_ty = TypeDescriptor::pointer(TypeDescriptor::opaque("TOKEN", None));
    let source = 0x1234u64.to_le_bytes();
    assert_eq!(
        Decoder::detached().decode(&source, &handle_ty, 0).unwrap(),
        ManagedValue::Handle(RawHandle::new(0x1234, "TOKEN"))
    );

    let err = encode(
        &ManagedValue::Handle(RawHandle::new(0x1234, "HKEY")),
        &handle_ty,
    )
    .unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { .. }));
}

#[test]
fn test_pointed_to_capacity_struct_reads_counted_prefix() {
    let sid = masked_sid();
    // Only 16 bytes exist: header plus two sub-authorities
    let mut native = vec![1u8, 2, 0, 0, 0, 0, 0, 5];
    native.extend_from_slice(&32u32.to_le_bytes());
    native.extend_from_slice(&544u32.to_le_bytes());
    let memory = FakeMemory::default().with(0x5000, native);

    let decoded = Decoder::new(&memory).decode_address(0x5000, &sid).unwrap();
    let subs = decoded.get("SubAuthority").and_then(|v| v.as_array()).unwrap();
    assert_eq!(subs.len(), 15);
    assert_eq!(&subs[..2], &[ManagedValue::UInt(32), ManagedValue::UInt(544)]);
}

#[test]
fn test_capacity_reserves_elements() {
    let mut arena = CallArena::new();
    let mut word = [0u8; 8];
    Encoder::new(&mut arena)
        .encode(
            &ManagedValue::Capacity(16),
            &TypeDescriptor::wide_string(),
            &mut word,
            0,
        )
        .unwrap();
    assert_eq!(arena.allocated_bytes(), 32);
    assert_ne!(u64::from_le_bytes(word), 0);
}

#[test]
fn test_callback_requires_registry() {
    let proto = TypeDescriptor::function(TypeDescriptor::i32(), vec![]);
    let callback = Callback::new(|_| ManagedValue::Int(0));
    let err = encode(&ManagedValue::Callback(callback), &TypeDescriptor::pointer(proto)).unwrap_err();
    match err {
        MarshalError::TypeMismatch { path, .. } => assert!(path.is_root()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_errors_carry_param_paths() {
    let mut arena = CallArena::new();
    let mut word = [0u8; 8];
    let err = Encoder::new(&mut arena)
        .encode_at(
            &ManagedValue::Bool(true),
            &TypeDescriptor::u32(),
            &mut word,
            0,
            &FieldPath::param(1),
        )
        .unwrap_err();
    assert!(err.to_string().contains("arg1"));
}
