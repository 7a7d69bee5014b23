//! Windows Descriptor Catalogue
//!
//! Descriptors and decoders for the security and registry structures the
//! marshalling engine was built around. Everything here is plain data
//! description; nothing links against Windows, so the decoders work on any
//! host given the right bytes.

mod registry;
mod sid;
mod token;

use once_cell::sync::Lazy;

use crate::descriptor::TypeDescriptor;
use crate::value::HandleKind;

pub use registry::{
    decode_registry_value, encode_registry_value, registry_value_table, REG_BINARY, REG_DWORD,
    REG_DWORD_BIG_ENDIAN, REG_EXPAND_SZ, REG_MULTI_SZ, REG_NONE, REG_QWORD, REG_SZ,
};
pub use sid::{
    parse_sid, sid, sid_and_attributes, sid_to_string, SECURITY_NT_AUTHORITY, SID_MAX_SUB_AUTHORITIES,
    SID_REVISION,
};
pub use token::{
    bind_get_token_information, luid, luid_and_attributes, query_token_information,
    token_elevation, token_groups, token_information_table, token_owner, token_primary_group,
    token_privileges, token_user, TokenInformationClass,
};

/// Access token handles
pub struct Token;
impl HandleKind for Token {
    const NAME: &'static str = "TOKEN";
}

/// Process handles
pub struct Process;
impl HandleKind for Process {
    const NAME: &'static str = "PROCESS";
}

/// Registry key handles
pub struct RegistryKey;
impl HandleKind for RegistryKey {
    const NAME: &'static str = "HKEY";
}

static TOKEN_HANDLE: Lazy<TypeDescriptor> =
    Lazy::new(|| TypeDescriptor::pointer(TypeDescriptor::opaque(Token::NAME, None)));
static PROCESS_HANDLE: Lazy<TypeDescriptor> =
    Lazy::new(|| TypeDescriptor::pointer(TypeDescriptor::opaque(Process::NAME, None)));
static KEY_HANDLE: Lazy<TypeDescriptor> =
    Lazy::new(|| TypeDescriptor::pointer(TypeDescriptor::opaque(RegistryKey::NAME, None)));

/// `HANDLE` to an access token
pub fn token_handle() -> TypeDescriptor {
    TOKEN_HANDLE.clone()
}

pub fn process_handle() -> TypeDescriptor {
    PROCESS_HANDLE.clone()
}

/// `HKEY`
pub fn key_handle() -> TypeDescriptor {
    KEY_HANDLE.clone()
}

#[cfg(test)]
mod tests;
