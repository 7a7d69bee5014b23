//! Access token information
//!
//! `GetTokenInformation` fills one buffer whose layout is chosen by the
//! `TOKEN_INFORMATION_CLASS` argument. The class never appears in the
//! buffer, so decoding goes through [`token_information_table`].

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::descriptor::{ExtentStrategy, TypeDescriptor};
use crate::error::{DescriptorError, MarshalError, MarshalResult};
use crate::ffi::{BindingTable, BoundCallable, CallBinder, DirectionQualifier, SuccessPredicate};
use crate::marshal::{Decoder, NativeBuffer, ProcessMemory, VariantTable};
use crate::value::{ManagedValue, RawHandle};

use super::sid::{sid, sid_and_attributes};
use super::token_handle;

/// `TOKEN_INFORMATION_CLASS` values with a registered decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TokenInformationClass {
    User = 1,
    Groups = 2,
    Privileges = 3,
    Owner = 4,
    PrimaryGroup = 5,
    Type = 8,
    Elevation = 20,
}

impl TokenInformationClass {
    pub fn value(self) -> u32 {
        self as u32
    }
}

/// `TOKEN_GROUPS { DWORD GroupCount; SID_AND_ATTRIBUTES Groups[ANYSIZE_ARRAY]; }`
pub fn token_groups() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("TOKEN_GROUPS")
            .field("GroupCount", TypeDescriptor::u32())
            .field("Groups", TypeDescriptor::array(sid_and_attributes()?, 1)?)
            .counted_by("Groups", "GroupCount", ExtentStrategy::TrailingInline)
            .build()
    })
    .cloned()
}

/// `TOKEN_USER { SID_AND_ATTRIBUTES User; }`
pub fn token_user() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("TOKEN_USER")
            .field("User", sid_and_attributes()?)
            .build()
    })
    .cloned()
}

pub fn luid() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("LUID")
            .field("LowPart", TypeDescriptor::u32())
            .field("HighPart", TypeDescriptor::i32())
            .build()
    })
    .cloned()
}

pub fn luid_and_attributes() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("LUID_AND_ATTRIBUTES")
            .field("Luid", luid()?)
            .field("Attributes", TypeDescriptor::u32())
            .build()
    })
    .cloned()
}

/// `TOKEN_PRIVILEGES { DWORD PrivilegeCount; LUID_AND_ATTRIBUTES Privileges[ANYSIZE_ARRAY]; }`
pub fn token_privileges() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("TOKEN_PRIVILEGES")
            .field("PrivilegeCount", TypeDescriptor::u32())
            .field("Privileges", TypeDescriptor::array(luid_and_attributes()?, 1)?)
            .counted_by("Privileges", "PrivilegeCount", ExtentStrategy::TrailingInline)
            .build()
    })
    .cloned()
}

pub fn token_owner() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("TOKEN_OWNER")
            .field("Owner", TypeDescriptor::pointer(sid()?))
            .build()
    })
    .cloned()
}

pub fn token_primary_group() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("TOKEN_PRIMARY_GROUP")
            .field("PrimaryGroup", TypeDescriptor::pointer(sid()?))
            .build()
    })
    .cloned()
}

pub fn token_elevation() -> Result<TypeDescriptor, DescriptorError> {
    static CELL: OnceCell<TypeDescriptor> = OnceCell::new();
    CELL.get_or_try_init(|| {
        TypeDescriptor::structure("TOKEN_ELEVATION")
            .field("TokenIsElevated", TypeDescriptor::u32())
            .build()
    })
    .cloned()
}

fn token_type_name(value: ManagedValue) -> MarshalResult<ManagedValue> {
    match value.as_u64() {
        Some(1) => Ok("Primary".into()),
        Some(2) => Ok("Impersonation".into()),
        _ => Ok(value),
    }
}

fn elevation_flag(value: ManagedValue) -> MarshalResult<ManagedValue> {
    let flag = value
        .get("TokenIsElevated")
        .and_then(ManagedValue::as_u64)
        .unwrap_or_default();
    Ok(ManagedValue::Bool(flag != 0))
}

/// Token information class -> buffer shape
pub fn token_information_table() -> MarshalResult<&'static VariantTable> {
    static TABLE: OnceCell<VariantTable> = OnceCell::new();
    TABLE.get_or_try_init(|| {
        use TokenInformationClass as Class;
        Ok::<_, MarshalError>(
            VariantTable::new("TOKEN_INFORMATION_CLASS")
                .register(Class::User.value(), token_user()?)
                .register(Class::Groups.value(), token_groups()?)
                .register(Class::Privileges.value(), token_privileges()?)
                .register(Class::Owner.value(), token_owner()?)
                .register(Class::PrimaryGroup.value(), token_primary_group()?)
                .register_with_post(Class::Type.value(), TypeDescriptor::u32(), token_type_name)
                .register_with_post(Class::Elevation.value(), token_elevation()?, elevation_flag),
        )
    })
}

/// Bind `BOOL GetTokenInformation(HANDLE, TOKEN_INFORMATION_CLASS, LPVOID, DWORD, PDWORD)`
pub fn bind_get_token_information(table: &BindingTable) -> MarshalResult<Arc<BoundCallable>> {
    Ok(table.bind_checked(
        "GetTokenInformation",
        TypeDescriptor::i32(),
        vec![
            DirectionQualifier::input(token_handle()),
            DirectionQualifier::input(TypeDescriptor::u32()),
            DirectionQualifier::input(TypeDescriptor::pointer(TypeDescriptor::void())),
            DirectionQualifier::input(TypeDescriptor::u32()),
            DirectionQualifier::output(TypeDescriptor::pointer(TypeDescriptor::u32()))?,
        ],
        SuccessPredicate::NonZero,
    ))
}

/// Query one information class of `token`.
///
/// Makes the usual two calls: a size probe with no buffer, then the real
/// query into a buffer of the reported length.
///
/// # Safety
///
/// `callable` must be bound to a real `GetTokenInformation` (or a stand-in
/// honoring its contract) and `token` must be an open token handle.
pub unsafe fn query_token_information(
    binder: &CallBinder,
    callable: &BoundCallable,
    token: &RawHandle,
    class: TokenInformationClass,
) -> MarshalResult<ManagedValue> {
    let table = token_information_table()?;
    let handle = ManagedValue::Handle(token.clone());
    let selector = ManagedValue::UInt(class.value() as u64);

    let probe = binder.invoke(
        callable,
        &[
            handle.clone(),
            selector.clone(),
            ManagedValue::Null,
            ManagedValue::UInt(0),
            ManagedValue::Null,
        ],
    )?;
    let required = probe
        .outputs
        .get(4)
        .cloned()
        .flatten()
        .transpose()?
        .and_then(|v| v.as_u64())
        .unwrap_or_default() as usize;
    if required == 0 {
        return Err(MarshalError::NativeCallFailure {
            symbol: callable.symbol().to_string(),
            returned: format!("{:?} without a required length", probe.return_value),
        });
    }

    let buffer = NativeBuffer::zeroed(required);
    binder
        .invoke(
            callable,
            &[
                handle,
                selector,
                ManagedValue::Pointer(buffer.address()),
                ManagedValue::UInt(required as u64),
                ManagedValue::Null,
            ],
        )?
        .checked()?;

    let memory = ProcessMemory::new();
    Decoder::new(&memory).decode_variant(buffer.as_bytes(), table, class.value())
}
