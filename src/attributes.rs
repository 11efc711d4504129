//! # Attribute Store
//!
//! A bounded, typed key/value blob embedded in every token. It is independent
//! of the generic [`crate::document::Document`] used for wire transport: the
//! attribute signature covers the raw block bytes, so the block must keep an
//! exact, self-describing byte layout.
//!
//! ## Layout
//!
//! ```text
//! total_size: u32 LE              (whole block, header included)
//! entry*:
//!   key_len:   u8
//!   key:       [u8; key_len]      (UTF-8)
//!   type:      u8                 (1=bin, 2=int, 3=uint, 4=str)
//!   value_len: u32 LE
//!   value:     [u8; value_len]
//! ```
//!
//! The block never exceeds [`ATTRIBUTE_BLOCK_CAPACITY`] bytes. `set` replaces
//! an existing key in place and appends new keys, so the byte order reflects
//! insertion history. The attribute signature covers exactly these bytes.

/// Maximum size of an encoded attribute block.
pub const ATTRIBUTE_BLOCK_CAPACITY: usize = 1024;

/// Maximum length of an attribute key in bytes.
pub const MAX_ATTRIBUTE_KEY_LEN: usize = 255;

const HEADER_LEN: usize = 4;
const ENTRY_OVERHEAD: usize = 1 + 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeError {
    /// Writing the entry would overflow the fixed block size.
    CapacityExceeded { required: usize, capacity: usize },
    /// Key is empty or longer than [`MAX_ATTRIBUTE_KEY_LEN`].
    InvalidKey(usize),
    /// Declared and actual sizes disagree, or an entry is malformed.
    Corrupt(&'static str),
}

impl std::fmt::Display for AttributeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded { required, capacity } => {
                write!(
                    f,
                    "attribute block capacity exceeded: need {required} bytes, have {capacity}"
                )
            }
            Self::InvalidKey(len) => write!(f, "invalid attribute key length {len}"),
            Self::Corrupt(what) => write!(f, "corrupt attribute block: {what}"),
        }
    }
}

impl std::error::Error for AttributeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeType {
    Bin = 1,
    Int = 2,
    UnsignedInt = 3,
    Str = 4,
}

impl AttributeType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Bin),
            2 => Some(Self::Int),
            3 => Some(Self::UnsignedInt),
            4 => Some(Self::Str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bin(Vec<u8>),
    Int(i32),
    UnsignedInt(u32),
    Str(String),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeType {
        match self {
            Self::Bin(_) => AttributeType::Bin,
            Self::Int(_) => AttributeType::Int,
            Self::UnsignedInt(_) => AttributeType::UnsignedInt,
            Self::Str(_) => AttributeType::Str,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Bin(b) => b.len(),
            Self::Int(_) | Self::UnsignedInt(_) => 4,
            Self::Str(s) => s.len(),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bin(b) => out.extend_from_slice(b),
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::UnsignedInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(s) => out.extend_from_slice(s.as_bytes()),
        }
    }

    fn decode(kind: AttributeType, bytes: &[u8]) -> Result<Self, AttributeError> {
        match kind {
            AttributeType::Bin => Ok(Self::Bin(bytes.to_vec())),
            AttributeType::Int => {
                let arr: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| AttributeError::Corrupt("int value is not 4 bytes"))?;
                Ok(Self::Int(i32::from_le_bytes(arr)))
            }
            AttributeType::UnsignedInt => {
                let arr: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| AttributeError::Corrupt("uint value is not 4 bytes"))?;
                Ok(Self::UnsignedInt(u32::from_le_bytes(arr)))
            }
            AttributeType::Str => std::str::from_utf8(bytes)
                .map(|s| Self::Str(s.to_string()))
                .map_err(|_| AttributeError::Corrupt("string value is not UTF-8")),
        }
    }
}

/// Borrowing cursor over the entries of a block.
struct Entries<'a> {
    rest: &'a [u8],
}

impl<'a> Entries<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], AttributeError> {
        if self.rest.len() < n {
            return Err(AttributeError::Corrupt("entry runs past end of block"));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn next_entry(&mut self) -> Result<(&'a str, AttributeValue), AttributeError> {
        let key_len = self.take(1)?[0] as usize;
        if key_len == 0 {
            return Err(AttributeError::Corrupt("empty key"));
        }
        let key = std::str::from_utf8(self.take(key_len)?)
            .map_err(|_| AttributeError::Corrupt("key is not UTF-8"))?;
        let kind = AttributeType::from_tag(self.take(1)?[0])
            .ok_or(AttributeError::Corrupt("unknown value type"))?;
        let len_bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| AttributeError::Corrupt("truncated value length"))?;
        let value_len = u32::from_le_bytes(len_bytes) as usize;
        let value = AttributeValue::decode(kind, self.take(value_len)?)?;
        Ok((key, value))
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<(&'a str, AttributeValue), AttributeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let item = self.next_entry();
        if item.is_err() {
            self.rest = &[];
        }
        Some(item)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AttributeStore {
    block: Vec<u8>,
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeStore {
    pub fn new() -> Self {
        Self {
            block: (HEADER_LEN as u32).to_le_bytes().to_vec(),
        }
    }

    /// Parse and validate a block received from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AttributeError> {
        if bytes.len() < HEADER_LEN {
            return Err(AttributeError::Corrupt("block shorter than header"));
        }
        if bytes.len() > ATTRIBUTE_BLOCK_CAPACITY {
            return Err(AttributeError::CapacityExceeded {
                required: bytes.len(),
                capacity: ATTRIBUTE_BLOCK_CAPACITY,
            });
        }
        let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if declared != bytes.len() {
            return Err(AttributeError::Corrupt("declared size does not match block size"));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in (Entries { rest: &bytes[HEADER_LEN..] }) {
            let (key, _) = entry?;
            if !seen.insert(key) {
                return Err(AttributeError::Corrupt("duplicate key"));
            }
        }

        Ok(Self {
            block: bytes.to_vec(),
        })
    }

    /// Raw block bytes, exactly as covered by the attribute signature.
    pub fn as_bytes(&self) -> &[u8] {
        &self.block
    }

    pub fn total_size(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.len() == HEADER_LEN
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, AttributeValue)> {
        // The block is validated on every path that creates it.
        Entries {
            rest: &self.block[HEADER_LEN..],
        }
        .map_while(Result::ok)
    }

    pub fn keys(&self) -> Vec<String> {
        self.iter().map(|(k, _)| k.to_string()).collect()
    }

    pub fn get(&self, key: &str) -> Option<AttributeValue> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            AttributeValue::UnsignedInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_bin(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key)? {
            AttributeValue::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// Insert or replace `key`.
    ///
    /// On failure the block is left untouched.
    pub fn set(&mut self, key: &str, value: AttributeValue) -> Result<(), AttributeError> {
        if key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_LEN {
            return Err(AttributeError::InvalidKey(key.len()));
        }

        let mut entries: Vec<(String, AttributeValue)> =
            self.iter().map(|(k, v)| (k.to_string(), v)).collect();
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => entries.push((key.to_string(), value)),
        }

        self.block = Self::serialize(&entries)?;
        Ok(())
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        let mut entries: Vec<(String, AttributeValue)> =
            self.iter().map(|(k, v)| (k.to_string(), v)).collect();
        let idx = entries.iter().position(|(k, _)| k == key)?;
        let (_, old) = entries.remove(idx);
        // Shrinking can never overflow.
        self.block = Self::serialize(&entries).ok()?;
        Some(old)
    }

    fn serialize(entries: &[(String, AttributeValue)]) -> Result<Vec<u8>, AttributeError> {
        let required = HEADER_LEN
            + entries
                .iter()
                .map(|(k, v)| ENTRY_OVERHEAD + k.len() + v.encoded_len())
                .sum::<usize>();
        if required > ATTRIBUTE_BLOCK_CAPACITY {
            return Err(AttributeError::CapacityExceeded {
                required,
                capacity: ATTRIBUTE_BLOCK_CAPACITY,
            });
        }

        let mut out = Vec::with_capacity(required);
        out.extend_from_slice(&(required as u32).to_le_bytes());
        for (key, value) in entries {
            out.push(key.len() as u8);
            out.extend_from_slice(key.as_bytes());
            out.push(value.kind() as u8);
            out.extend_from_slice(&(value.encoded_len() as u32).to_le_bytes());
            value.write_to(&mut out);
        }
        debug_assert_eq!(out.len(), required);
        Ok(out)
    }
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
