// SPDX-License-Identifier: Apache-2.0 OR MIT
// Process-wide registry of user-defined component types

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

/// Attributes a type reports about a captured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeAttributes {
    /// The decoded form is human-readable text.
    pub printable: bool,
    /// The decoded form is a numeric quantity.
    pub numeric: bool,
}

/// A registered user type.
///
/// `encoded_len` declares how many payload bytes `encode` will produce
/// for a captured value; `encode` returns the count actually written.
/// Writing more than declared is a contract violation: debug builds
/// assert, release builds truncate to the declared length.
#[derive(Clone, Copy)]
pub struct UserType {
    pub name: &'static str,
    pub encoded_len: fn(&[u8]) -> usize,
    pub encode: fn(&[u8], &mut [u8]) -> usize,
    pub decode: fn(&[u8]) -> String,
    pub classify: fn(&[u8]) -> TypeAttributes,
}

impl UserType {
    /// A pass-through type: payload bytes are copied verbatim and
    /// decoded as hex.
    pub fn opaque(name: &'static str) -> UserType {
        UserType {
            name,
            encoded_len: |bytes| bytes.len(),
            encode: |bytes, out| {
                out[..bytes.len()].copy_from_slice(bytes);
                bytes.len()
            },
            decode: hex_string,
            classify: |_| TypeAttributes::default(),
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeRegistryError {
    #[error("type id 0 is reserved")]
    ReservedId,

    #[error("type id {0} is already registered")]
    Duplicate(u16),

    #[error("the type registry is sealed; register before initialization")]
    Sealed,
}

static STAGING: Mutex<Vec<(u16, UserType)>> = Mutex::new(Vec::new());
static SEALED: OnceLock<HashMap<u16, UserType>> = OnceLock::new();

/// Register a user type. Registration is append-only: duplicate ids
/// fail, and no registration is accepted once the registry has been
/// sealed by initialization.
pub fn register_type(type_id: u16, def: UserType) -> Result<(), TypeRegistryError> {
    if type_id == 0 {
        return Err(TypeRegistryError::ReservedId);
    }
    if SEALED.get().is_some() {
        return Err(TypeRegistryError::Sealed);
    }
    let mut staging = STAGING.lock().unwrap_or_else(|e| e.into_inner());
    if staging.iter().any(|(id, _)| *id == type_id) {
        return Err(TypeRegistryError::Duplicate(type_id));
    }
    staging.push((type_id, def));
    Ok(())
}

/// Seal the registry. Lookups afterwards are lock-free.
pub(crate) fn seal() {
    let _ = SEALED.get_or_init(|| {
        let staging = STAGING.lock().unwrap_or_else(|e| e.into_inner());
        staging.iter().cloned().collect()
    });
}

/// Look up a registered type.
pub(crate) fn lookup(type_id: u16) -> Option<UserType> {
    if let Some(sealed) = SEALED.get() {
        return sealed.get(&type_id).copied();
    }
    let staging = STAGING.lock().unwrap_or_else(|e| e.into_inner());
    staging
        .iter()
        .find(|(id, _)| *id == type_id)
        .map(|(_, def)| *def)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global, so every id used in tests is
    // namespaced high to stay clear of the integration suites.
    const BASE: u16 = 0x7e00;

    #[test]
    fn test_reserved_id_rejected() {
        // Checked ahead of the seal, so this holds in any test order.
        assert_eq!(
            register_type(0, UserType::opaque("zero")),
            Err(TypeRegistryError::ReservedId)
        );
    }

    #[test]
    fn test_register_lookup_and_duplicates() {
        match register_type(BASE, UserType::opaque("first")) {
            Ok(()) => {
                assert_eq!(lookup(BASE).map(|def| def.name), Some("first"));
                assert_eq!(
                    register_type(BASE, UserType::opaque("second")),
                    Err(TypeRegistryError::Duplicate(BASE))
                );
            }
            // A sibling test already initialized a runtime and sealed
            // the registry; registration stays rejected wholesale.
            Err(TypeRegistryError::Sealed) => {
                assert_eq!(
                    register_type(BASE, UserType::opaque("first")),
                    Err(TypeRegistryError::Sealed)
                );
            }
            Err(other) => panic!("unexpected {:?}", other),
        }
        assert!(lookup(0xffff).is_none());
    }

    #[test]
    fn test_opaque_roundtrip() {
        let def = UserType::opaque("blob");
        let payload = [0xde, 0xad, 0xbe, 0xef];
        assert_eq!((def.encoded_len)(&payload), 4);
        let mut out = [0u8; 4];
        assert_eq!((def.encode)(&payload, &mut out), 4);
        assert_eq!(out, payload);
        assert_eq!((def.decode)(&out), "deadbeef");
    }
}
