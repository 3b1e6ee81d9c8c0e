use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The identity of a resource: a SHA-256 hash of the canonical JSON form of its options.
///
/// Canonicalization sorts object keys, so the order in which fields are serialized does not
/// matter. Integers are kept exact, even beyond the range a double can represent.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionsHash([u8; 32]);

impl OptionsHash {
    /// Hashes `options`.
    pub fn new<T: Serialize>(options: &T) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(&sort_keys(serde_json::to_value(options)?))?;
        Ok(Self(Sha256::digest(&canonical).into()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Rebuilds every object with its keys in sorted order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let sorted: BTreeMap<_, _> = object
                .into_iter()
                .map(|(key, value)| (key, sort_keys(value)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        value => value,
    }
}

impl fmt::Display for OptionsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OptionsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptionsHash({self})")
    }
}
