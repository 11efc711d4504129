//! # Wire Documents
//!
//! Tokens are carried on the wire as an ordered key/value [`Document`] with a
//! small set of value kinds. The document itself knows nothing about tokens;
//! [`crate::token`] maps token fields onto fixed short keys.
//!
//! Documents are serialized using bincode with size limits to prevent memory
//! exhaustion when decoding untrusted input.

use std::collections::BTreeMap;

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Maximum buffer size for document deserialization.
///
/// A token document is a few hundred bytes plus at most one attribute block,
/// so 16 KiB leaves room for nesting tokens inside larger messages.
pub const MAX_DOCUMENT_SIZE: u64 = 16 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DOCUMENT_SIZE)
        .with_fixint_encoding()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Double(f64),
    UShort(u16),
    /// Binary value. Fixed-length fields (keys, signatures) are length-checked
    /// by the reader, not by the document.
    Bin(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Double(_) => "double",
            Value::UShort(_) => "unsigned short",
            Value::Bin(_) => "binary",
        }
    }
}

/// Ordered key/value document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    entries: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key`, replacing any previous value.
    pub fn replace(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode_options().serialize(self)
    }

    /// Deserialize with size bounds enforced.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode_options().deserialize(bytes)
    }
}
