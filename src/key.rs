//! Key decoration: prefixing a key's binary form with routing metadata a
//! partitioned service needs, without disturbing how the key itself
//! compares or serializes.
//!
//! Decoration is idempotent in both directions: decorating an
//! already-decorated key, or undecorating a plain one, is a no-op rather
//! than an error, since callers on both sides of a channel can't always
//! tell which form they were handed.

use crate::message::Binary;

const DECORATION_MARKER: u8 = 0xDA;

/// Prefix `key` with its association-key bytes so a partitioned backend
/// can route on it without deserializing the payload. A no-op if `key` is
/// already decorated.
pub fn to_decorated(key: &Binary, association_key: &Binary) -> Binary {
    if is_decorated(key) {
        return key.clone();
    }
    let mut out = Vec::with_capacity(1 + 4 + association_key.len() + key.len());
    out.push(DECORATION_MARKER);
    out.extend_from_slice(&(association_key.len() as u32).to_be_bytes());
    out.extend_from_slice(association_key);
    out.extend_from_slice(key);
    out
}

/// Strip decoration added by [`to_decorated`], returning the original key
/// bytes. A no-op if `key` carries no decoration.
pub fn to_undecorated(key: &Binary) -> Binary {
    match decoration_len(key) {
        Some(prefix_len) => key[prefix_len..].to_vec(),
        None => key.clone(),
    }
}

/// The association key recorded by [`to_decorated`], if any.
pub fn association_key(key: &Binary) -> Option<Binary> {
    if key.first() != Some(&DECORATION_MARKER) || key.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes(key[1..5].try_into().ok()?) as usize;
    key.get(5..5 + len).map(|s| s.to_vec())
}

fn is_decorated(key: &Binary) -> bool {
    decoration_len(key).is_some()
}

fn decoration_len(key: &Binary) -> Option<usize> {
    if key.first() != Some(&DECORATION_MARKER) || key.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes(key[1..5].try_into().ok()?) as usize;
    let total = 5usize.checked_add(len)?;
    (total <= key.len()).then_some(total)
}

/// A domain type that knows which key a partitioned service should route
/// requests for it on, instead of its own key (e.g. "all orders for this
/// customer land on the customer's partition"). Resolving this is deferred
/// until the key is actually about to go on the wire, since computing it
/// may be non-trivial.
pub trait KeyAssociation {
    fn associated_key(&self) -> Option<Binary>;
}

/// Resolve the binary a request should be decorated with: the explicit
/// association key if the domain key provides one, otherwise the key
/// itself (it is its own association).
pub fn resolve_association(key: &Binary, association: &dyn KeyAssociation) -> Binary {
    association.associated_key().unwrap_or_else(|| key.clone())
}
