//! Deterministic cache keys
//!
//! A key is the service's prefix followed by 32 hex characters: two
//! differently seeded 64-bit fx-style hashes of the service name and the
//! canonical (key-sorted, whitespace-free) JSON of the request parameters.
//! The hashes are fast, not collision resistant. Parameter order never
//! changes the key.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Cache key for one (service, params) pair
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    /// Digest of service + canonical params (fast comparison)
    hash: u64,
    service: String,
    /// Full storage key: prefix + hex digest
    key: String,
}

impl CacheKey {
    /// Derive the key for `params` under `service`
    pub fn derive(service: &str, prefix: &str, params: &Value) -> Self {
        let canonical = canonical_json(params);

        let mut material = Vec::with_capacity(service.len() + 1 + canonical.len());
        material.extend_from_slice(service.as_bytes());
        material.push(0);
        material.extend_from_slice(canonical.as_bytes());

        let hi = fx_hash(&material, SEED_HI);
        let lo = fx_hash(&material, SEED_LO);

        Self {
            hash: hi ^ lo,
            service: service.to_string(),
            key: format!("{}{:016x}{:016x}", prefix, hi, lo),
        }
    }

    /// Storage key
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Pre-computed digest
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

const SEED_HI: u64 = 0x517c_c1b7_2722_0a95;
const SEED_LO: u64 = 0x9e37_79b9_7f4a_7c15;

/// FxHash-style mixing, non-cryptographic
#[inline]
pub(crate) fn fx_hash(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED_HI);
    }
    hash
}

/// Fingerprint of a raw payload, used to detect upstream data changes
pub fn fingerprint(bytes: &[u8]) -> u64 {
    fx_hash(bytes, SEED_LO)
}

/// Serialize `value` with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
