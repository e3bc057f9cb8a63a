//! Idempotency keys: stable content hashes of job payloads.
//!
//! The key is the lower-case hex SHA-256 of the payload's canonical JSON form.
//! Canonicalisation sorts object keys recursively (arrays keep their order),
//! so two structurally equal payloads always hash identically regardless of
//! how their maps were built. The server uses the key to recognise a repeated
//! delivery and answer 409/412 instead of applying it twice.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

const MAX_KEY_LEN: usize = 256;

/// Idempotency key attached to every delivery attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = ValidationError;

    /// Accept an externally supplied key. It must be usable verbatim as an
    /// HTTP header value: non-empty, bounded, visible ASCII only.
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if raw.is_empty() {
            return Err(ValidationError::invalid_key("key must not be empty"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(ValidationError::invalid_key(format!(
                "key longer than {MAX_KEY_LEN} bytes"
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ValidationError::invalid_key(
                "key must contain visible ASCII characters only",
            ));
        }
        Ok(Self(raw))
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

/// Derive the idempotency key of a single payload.
pub fn derive(payload: &Value) -> IdempotencyKey {
    IdempotencyKey(sha256_hex(&canonical_json(payload)))
}

/// Derive one key over a whole batch of payloads, in order.
pub fn derive_batch(payloads: &[Value]) -> IdempotencyKey {
    derive(&Value::Array(payloads.to_vec()))
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

// Rebuild maps in sorted key order. With serde_json's default `BTreeMap`
// this is already the iteration order; with `preserve_order` enabled the
// insertion order we produce here becomes the serialization order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), sorted(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
