//! Security identifiers
//!
//! `SID` is modeled at its maximum size: the sub-authority array has room
//! for 15 entries and `SubAuthorityCount` says how many are real. Decoding
//! zeroes every slot past the count.

use once_cell::sync::OnceCell;

use crate::descriptor::{ExtentStrategy, TypeDescriptor};
use crate::error::{DescriptorError, FieldPath, MarshalError, MarshalResult};
use crate::value::ManagedValue;

pub const SID_REVISION: u8 = 1;
pub const SID_MAX_SUB_AUTHORITIES: usize = 15;

/// `SECURITY_NT_AUTHORITY` identifier authority
pub const SECURITY_NT_AUTHORITY: [u8; 6] = [0, 0, 0, 0, 0, 5];

static SID: OnceCell<TypeDescriptor> = OnceCell::new();
static SID_AND_ATTRIBUTES: OnceCell<TypeDescriptor> = OnceCell::new();

/// `SID` with a masked sub-authority capacity
pub fn sid() -> Result<TypeDescriptor, DescriptorError> {
    SID.get_or_try_init(|| {
        TypeDescriptor::structure("SID")
            .field("Revision", TypeDescriptor::u8())
            .field("SubAuthorityCount", TypeDescriptor::u8())
            .field("IdentifierAuthority", TypeDescriptor::array(TypeDescriptor::u8(), 6)?)
            .field(
                "SubAuthority",
                TypeDescriptor::array(TypeDescriptor::u32(), SID_MAX_SUB_AUTHORITIES)?,
            )
            .counted_by("SubAuthority", "SubAuthorityCount", ExtentStrategy::MaskCapacity)
            .build()
    })
    .cloned()
}

/// `SID_AND_ATTRIBUTES { PSID Sid; DWORD Attributes; }`
pub fn sid_and_attributes() -> Result<TypeDescriptor, DescriptorError> {
    SID_AND_ATTRIBUTES
        .get_or_try_init(|| {
            TypeDescriptor::structure("SID_AND_ATTRIBUTES")
                .field("Sid", TypeDescriptor::pointer(sid()?))
                .field("Attributes", TypeDescriptor::u32())
                .build()
        })
        .cloned()
}

fn malformed(expected: &str, found: impl Into<String>) -> MarshalError {
    MarshalError::mismatch(&FieldPath::root(), expected, found)
}

/// Render a decoded `SID` record as `S-1-5-32-544`
pub fn sid_to_string(sid: &ManagedValue) -> MarshalResult<String> {
    let revision = sid
        .get("Revision")
        .and_then(ManagedValue::as_u64)
        .ok_or_else(|| malformed("SID record", sid.type_name()))?;
    let count = sid
        .get("SubAuthorityCount")
        .and_then(ManagedValue::as_u64)
        .ok_or_else(|| malformed("SID record", sid.type_name()))? as usize;

    let authority_bytes = sid
        .get("IdentifierAuthority")
        .and_then(ManagedValue::as_array)
        .ok_or_else(|| malformed("6-byte identifier authority", "missing"))?;
    if authority_bytes.len() != 6 {
        return Err(malformed(
            "6-byte identifier authority",
            authority_bytes.len().to_string(),
        ));
    }
    // 48-bit big-endian value
    let mut authority = 0u64;
    for byte in authority_bytes {
        let byte = byte
            .as_u64()
            .ok_or_else(|| malformed("authority byte", byte.type_name()))?;
        authority = (authority << 8) | (byte & 0xff);
    }

    let sub_authorities = sid
        .get("SubAuthority")
        .and_then(ManagedValue::as_array)
        .ok_or_else(|| malformed("sub-authority array", "missing"))?;
    if count > sub_authorities.len() {
        return Err(malformed(
            &format!("at most {} sub-authorities", sub_authorities.len()),
            count.to_string(),
        ));
    }

    let mut rendered = if authority >= 1 << 32 {
        format!("S-{}-0x{:012X}", revision, authority)
    } else {
        format!("S-{}-{}", revision, authority)
    };
    for sub in &sub_authorities[..count] {
        let sub = sub
            .as_u64()
            .ok_or_else(|| malformed("sub-authority", sub.type_name()))?;
        rendered.push_str(&format!("-{}", sub));
    }
    Ok(rendered)
}

/// Parse `S-R-I-S...` into a `SID` record suitable for encoding
pub fn parse_sid(text: &str) -> MarshalResult<ManagedValue> {
    let bad = || malformed("SID string", text);
    let mut parts = text.split('-');
    if !parts.next().is_some_and(|p| p.eq_ignore_ascii_case("S")) {
        return Err(bad());
    }
    let revision: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let authority_text = parts.next().ok_or_else(bad)?;
    let authority = match authority_text.strip_prefix("0x").or_else(|| authority_text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).map_err(|_| bad())?,
        None => authority_text.parse::<u64>().map_err(|_| bad())?,
    };
    if authority >= 1 << 48 {
        return Err(bad());
    }
    let subs = parts
        .map(|p| p.parse::<u32>().map_err(|_| bad()))
        .collect::<MarshalResult<Vec<u32>>>()?;
    if subs.len() > SID_MAX_SUB_AUTHORITIES {
        return Err(bad());
    }

    let authority_bytes: Vec<ManagedValue> = authority.to_be_bytes()[2..]
        .iter()
        .map(|&b| ManagedValue::UInt(b as u64))
        .collect();
    Ok(ManagedValue::record([
        ("Revision", ManagedValue::UInt(revision as u64)),
        ("SubAuthorityCount", ManagedValue::UInt(subs.len() as u64)),
        ("IdentifierAuthority", ManagedValue::Array(authority_bytes)),
        (
            "SubAuthority",
            ManagedValue::Array(subs.into_iter().map(|s| ManagedValue::UInt(s as u64)).collect()),
        ),
    ]))
}
