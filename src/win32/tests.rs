//! Win32 Catalogue Tests

use std::sync::Arc;

use super::*;
use crate::descriptor::{LayoutCalculator, TypeDescriptor};
use crate::error::MarshalError;
use crate::ffi::{
    BoundCallable, CallBinder, DirectionQualifier, NativeFunctionPointer, RegisterTrampoline,
    SuccessPredicate, Trampoline,
};
use crate::marshal::{CallArena, Decoder, Encoder, NativeBuffer, ProcessMemory};
use crate::value::{Handle, ManagedValue, RawHandle};

const SE_GROUP_ENABLED: u32 = 0x4;
const SE_GROUP_MANDATORY: u32 = 0x1;

/// Native `SID` bytes for a textual SID, trimmed to its counted length
fn sid_bytes(text: &str) -> Vec<u8> {
    let value = parse_sid(text).unwrap();
    let mut arena = CallArena::new();
    let buffer = Encoder::new(&mut arena)
        .encode_to_buffer(&value, &sid().unwrap())
        .unwrap();
    let count = buffer.as_bytes()[1] as usize;
    buffer.as_bytes()[..8 + 4 * count].to_vec()
}

/// `TOKEN_GROUPS` bytes whose `Sid` members point into `sids`
fn token_groups_bytes(sids: &[Vec<u8>], attributes: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; 8 + 16 * sids.len()];
    bytes[0..4].copy_from_slice(&(sids.len() as u32).to_le_bytes());
    for (i, (sid, attrs)) in sids.iter().zip(attributes).enumerate() {
        let at = 8 + 16 * i;
        bytes[at..at + 8].copy_from_slice(&(sid.as_ptr() as u64).to_le_bytes());
        bytes[at + 8..at + 12].copy_from_slice(&attrs.to_le_bytes());
    }
    bytes
}

#[test]
fn test_sid_layout() {
    let sid = sid().unwrap();
    let layout = LayoutCalculator::layout_of(&sid).unwrap();
    assert_eq!(layout.size, 68);
    assert_eq!(layout.offset_of("IdentifierAuthority"), Some(2));
    assert_eq!(layout.offset_of("SubAuthority"), Some(8));

    let entry = LayoutCalculator::layout_of(&sid_and_attributes().unwrap()).unwrap();
    assert_eq!(entry.offset_of("Attributes"), Some(8));
    assert_eq!(entry.size, 16);
}

#[test]
fn test_sid_string_round_trip() {
    let sid = sid().unwrap();
    let bytes = sid_bytes("S-1-5-32-544");
    assert_eq!(bytes.len(), 16);

    let mut full = bytes.clone();
    full.resize(68, 0xCC);
    let decoded = Decoder::detached().decode(&full, &sid, 0).unwrap();
    assert_eq!(sid_to_string(&decoded).unwrap(), "S-1-5-32-544");
    let subs = decoded.get("SubAuthority").and_then(|v| v.as_array()).unwrap();
    assert!(subs[2..].iter().all(|v| *v == ManagedValue::UInt(0)));
}

#[test]
fn test_wide_authority_renders_hex() {
    let value = parse_sid("S-1-0x123456789ABC-7").unwrap();
    assert_eq!(sid_to_string(&value).unwrap(), "S-1-0x123456789ABC-7");

    let nt = parse_sid("S-1-5-18").unwrap();
    let authority = nt.get("IdentifierAuthority").and_then(|v| v.as_array()).unwrap();
    let bytes: Vec<u8> = authority.iter().map(|b| b.as_u64().unwrap() as u8).collect();
    assert_eq!(bytes, SECURITY_NT_AUTHORITY);
}

#[test]
fn test_malformed_sids() {
    assert!(parse_sid("X-1-5-18").is_err());
    assert!(parse_sid("S-1-5-abc").is_err());
    assert!(parse_sid("S-1").is_err());
    let too_long = format!("S-1-5{}", "-1".repeat(SID_MAX_SUB_AUTHORITIES + 1));
    assert!(parse_sid(&too_long).is_err());

    let broken = ManagedValue::record([
        ("Revision", 1u8.into()),
        ("SubAuthorityCount", 3u8.into()),
        ("IdentifierAuthority", ManagedValue::Array(vec![0u8.into(); 6])),
        ("SubAuthority", ManagedValue::Array(vec![1u32.into()])),
    ]);
    assert!(sid_to_string(&broken).is_err());
    assert!(sid_to_string(&ManagedValue::Int(1)).is_err());
}

#[test]
fn test_token_groups_decode() {
    let sids = vec![sid_bytes("S-1-5-32-544"), sid_bytes("S-1-1-0")];
    let bytes = token_groups_bytes(&sids, &[SE_GROUP_ENABLED | SE_GROUP_MANDATORY, SE_GROUP_ENABLED]);
    assert_eq!(bytes.len(), 40);

    let memory = unsafe { ProcessMemory::new() };
    let decoded = Decoder::new(&memory)
        .decode_variant(&bytes, token_information_table().unwrap(), TokenInformationClass::Groups.value())
        .unwrap();
    assert_eq!(decoded.get("GroupCount"), Some(&ManagedValue::UInt(2)));

    let groups = decoded.get("Groups").and_then(|v| v.as_array()).unwrap();
    assert_eq!(groups.len(), 2);
    let rendered: Vec<String> = groups
        .iter()
        .map(|g| sid_to_string(g.get("Sid").unwrap()).unwrap())
        .collect();
    assert_eq!(rendered, vec!["S-1-5-32-544", "S-1-1-0"]);
    assert_eq!(groups[0].get("Attributes"), Some(&ManagedValue::UInt(5)));
    assert_eq!(groups[1].get("Attributes"), Some(&ManagedValue::UInt(4)));
}

#[test]
fn test_token_privileges_decode() {
    let mut bytes = vec![0u8; 4 + 12 * 2];
    bytes[0] = 2;
    bytes[4] = 0x14; // SeDebugPrivilege
    bytes[12] = 0x2;
    bytes[16] = 0x17;
    let decoded = Decoder::detached()
        .decode(&bytes, &token_privileges().unwrap(), 0)
        .unwrap();
    let privileges = decoded.get("Privileges").and_then(|v| v.as_array()).unwrap();
    assert_eq!(privileges.len(), 2);
    assert_eq!(
        privileges[0].get("Luid"),
        Some(&ManagedValue::record([("LowPart", 0x14u32.into()), ("HighPart", 0i32.into())]))
    );
    assert_eq!(privileges[0].get("Attributes"), Some(&ManagedValue::UInt(2)));
    assert_eq!(
        privileges[1].get("Luid").and_then(|l| l.get("LowPart")),
        Some(&ManagedValue::UInt(0x17))
    );
}

#[test]
fn test_token_table_post_processing() {
    let table = token_information_table().unwrap();
    let decoder = Decoder::detached();
    assert_eq!(
        decoder.decode_variant(&[1, 0, 0, 0], table, TokenInformationClass::Type.value()).unwrap(),
        ManagedValue::String("Primary".into())
    );
    assert_eq!(
        decoder.decode_variant(&[2, 0, 0, 0], table, TokenInformationClass::Type.value()).unwrap(),
        ManagedValue::String("Impersonation".into())
    );
    assert_eq!(
        decoder
            .decode_variant(&[1, 0, 0, 0], table, TokenInformationClass::Elevation.value())
            .unwrap(),
        ManagedValue::Bool(true)
    );
    assert!(matches!(
        decoder.decode_variant(&[0; 8], table, 7),
        Err(MarshalError::UnsupportedDiscriminant { discriminant: 7, .. })
    ));
}

#[test]
fn test_token_user_detached_leaves_sid_address() {
    let mut bytes = vec![0u8; 16];
    bytes[0..8].copy_from_slice(&0xABCDu64.to_le_bytes());
    let decoded = Decoder::detached()
        .decode_variant(&bytes, token_information_table().unwrap(), TokenInformationClass::User.value())
        .unwrap();
    assert_eq!(
        decoded.get("User").and_then(|u| u.get("Sid")),
        Some(&ManagedValue::Pointer(0xABCD))
    );
}

#[test]
fn test_handle_descriptors() {
    let decoded = Decoder::detached()
        .decode(&0x44u64.to_le_bytes(), &token_handle(), 0)
        .unwrap();
    let ManagedValue::Handle(raw) = decoded else {
        panic!("expected a handle, got {decoded:?}");
    };
    assert_eq!(raw, RawHandle::new(0x44, Token::NAME));
    assert!(Handle::<Token>::try_from(raw.clone()).is_ok());
    assert!(Handle::<RegistryKey>::try_from(raw).is_err());
    assert_ne!(token_handle(), key_handle());
    assert_eq!(process_handle(), process_handle());
}

#[test]
fn test_registry_strings() {
    let mut data: Vec<u8> = "hello".encode_utf16().flat_map(u16::to_le_bytes).collect();
    assert_eq!(
        decode_registry_value(&data, REG_SZ).unwrap(),
        ManagedValue::String("hello".into())
    );
    data.extend_from_slice(&[0, 0, b'x', 0]);
    assert_eq!(
        decode_registry_value(&data, REG_EXPAND_SZ).unwrap(),
        ManagedValue::String("hello".into())
    );

    let list = ManagedValue::Array(vec!["alpha".into(), "beta".into()]);
    let encoded = encode_registry_value(&list, REG_MULTI_SZ).unwrap();
    assert_eq!(&encoded[encoded.len() - 4..], &[0, 0, 0, 0]);
    assert_eq!(decode_registry_value(&encoded, REG_MULTI_SZ).unwrap(), list);

    assert!(encode_registry_value(&ManagedValue::Int(1), REG_SZ).is_err());
}

#[test]
fn test_registry_numbers() {
    assert_eq!(
        decode_registry_value(&[1, 0, 0, 0], REG_DWORD).unwrap(),
        ManagedValue::UInt(1)
    );
    assert_eq!(
        decode_registry_value(&[0, 0, 1, 0], REG_DWORD_BIG_ENDIAN).unwrap(),
        ManagedValue::UInt(256)
    );
    assert_eq!(
        decode_registry_value(&u64::MAX.to_le_bytes(), REG_QWORD).unwrap(),
        ManagedValue::UInt(u64::MAX)
    );
    assert_eq!(
        encode_registry_value(&ManagedValue::UInt(0x0102_0304), REG_DWORD_BIG_ENDIAN).unwrap(),
        vec![1, 2, 3, 4]
    );
    assert!(matches!(
        decode_registry_value(&[0, 0], REG_DWORD),
        Err(MarshalError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_registry_binary_and_unknown_types() {
    let blob = ManagedValue::Bytes(vec![0xDE, 0xAD]);
    assert_eq!(encode_registry_value(&blob, REG_BINARY).unwrap(), vec![0xDE, 0xAD]);
    assert_eq!(decode_registry_value(&[0xDE, 0xAD], REG_BINARY).unwrap(), blob);
    assert_eq!(decode_registry_value(&[], REG_NONE).unwrap(), ManagedValue::Bytes(vec![]));
    assert!(matches!(
        decode_registry_value(&[0; 4], 99),
        Err(MarshalError::UnsupportedDiscriminant { discriminant: 99, .. })
    ));
    assert!(encode_registry_value(&ManagedValue::UInt(1), 99).is_err());
}

/// Plays `GetTokenInformation` for the groups class
struct FakeTokenApi {
    sids: Arc<Vec<Vec<u8>>>,
}

impl Trampoline for FakeTokenApi {
    fn supports(
        &self,
        return_type: &TypeDescriptor,
        params: &[TypeDescriptor],
    ) -> crate::error::MarshalResult<()> {
        RegisterTrampoline::new().supports(return_type, params)
    }

    unsafe fn invoke(
        &self,
        _entry: NativeFunctionPointer,
        args: &[u64],
        _return_type: &TypeDescriptor,
    ) -> crate::error::MarshalResult<NativeBuffer> {
        assert_eq!(args[1], TokenInformationClass::Groups.value() as u64);
        let bytes = token_groups_bytes(&self.sids, &[SE_GROUP_ENABLED, SE_GROUP_ENABLED]);
        *(args[4] as *mut u32) = bytes.len() as u32;
        let ok = if args[2] == 0 || (args[3] as usize) < bytes.len() {
            0
        } else {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), args[2] as *mut u8, bytes.len());
            1
        };
        Ok(NativeBuffer::from_bytes(&(ok as u64).to_le_bytes()))
    }
}

#[test]
fn test_query_token_information_two_calls() {
    let sids = Arc::new(vec![sid_bytes("S-1-5-11"), sid_bytes("S-1-5-32-545")]);
    let binder = CallBinder::new().with_trampoline(FakeTokenApi {
        sids: Arc::clone(&sids),
    });
    let callable = BoundCallable::from_address(
        "GetTokenInformation",
        NativeFunctionPointer::new(0x1000).unwrap(),
        TypeDescriptor::i32(),
        vec![
            DirectionQualifier::input(token_handle()),
            DirectionQualifier::input(TypeDescriptor::u32()),
            DirectionQualifier::input(TypeDescriptor::pointer(TypeDescriptor::void())),
            DirectionQualifier::input(TypeDescriptor::u32()),
            DirectionQualifier::output(TypeDescriptor::pointer(TypeDescriptor::u32())).unwrap(),
        ],
    )
    .with_success(SuccessPredicate::NonZero);

    let token = RawHandle::new(0x88, Token::NAME);
    let groups = unsafe {
        query_token_information(&binder, &callable, &token, TokenInformationClass::Groups)
    }
    .unwrap();

    let rendered: Vec<String> = groups
        .get("Groups")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|g| sid_to_string(g.get("Sid").unwrap()).unwrap())
        .collect();
    assert_eq!(rendered, vec!["S-1-5-11", "S-1-5-32-545"]);

    let wrong_kind = RawHandle::new(0x88, RegistryKey::NAME);
    let err = unsafe {
        query_token_information(&binder, &callable, &wrong_kind, TokenInformationClass::Groups)
    }
    .unwrap_err();
    assert!(matches!(err, MarshalError::TypeMismatch { .. }));
}
