//! Encoded keys, immutable key snapshots and range-tombstone payloads.
//!
//! Keys compare as unsigned byte strings over their encoded form. A
//! [`KeyState`] is a frozen copy of a [`Key`] and is interchangeable with it
//! wherever keys are hashed, compared or ordered.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use thiserror::Error;

/// Maximum length of an encoded key, in bytes.
pub const MAX_KEY_LENGTH: usize = 2047;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid key: {reason}")]
    InvalidKey { reason: &'static str },
}

fn invalid(reason: &'static str) -> KeyError {
    KeyError::InvalidKey { reason }
}

/// Deterministic key hash: `h = ((h * 17) ^ b) & 0x7FFF_FFFF` folded over
/// the encoded bytes. Always non-negative in its 32-bit representation.
fn key_hash(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = (h.wrapping_mul(17) ^ b as u32) & 0x7FFF_FFFF;
    }
    h
}

/// A mutable, encoded key under construction.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key from already-encoded bytes, copied verbatim.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() > MAX_KEY_LENGTH {
            return Err(invalid("encoded key exceeds maximum length"));
        }
        Ok(Self { bytes: bytes.to_vec() })
    }

    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Replace the encoded form wholesale.
    pub fn set_encoded(&mut self, bytes: &[u8]) -> Result<(), KeyError> {
        if bytes.len() > MAX_KEY_LENGTH {
            return Err(invalid("encoded key exceeds maximum length"));
        }
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    /// Append encoded bytes.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), KeyError> {
        if self.bytes.len() + bytes.len() > MAX_KEY_LENGTH {
            return Err(invalid("encoded key exceeds maximum length"));
        }
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    /// The deterministic key hash of the encoded form.
    pub fn state_hash(&self) -> u32 {
        key_hash(&self.bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:02x?})", self.bytes)
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.state_hash());
    }
}

/// An immutable snapshot of a [`Key`].
///
/// Hashes, compares and equates exactly like the key it was taken from, so
/// the two are interchangeable as map keys. The hash is memoized on first
/// use.
#[derive(Clone)]
pub struct KeyState {
    bytes: Box<[u8]>,
    hash: OnceLock<u32>,
}

impl KeyState {
    pub fn new(key: &Key) -> Self {
        Self {
            bytes: key.encoded().into(),
            hash: OnceLock::new(),
        }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    /// The deterministic key hash, computed once.
    pub fn state_hash(&self) -> u32 {
        *self.hash.get_or_init(|| key_hash(&self.bytes))
    }

    pub fn to_key(&self) -> Key {
        Key { bytes: self.bytes.to_vec() }
    }
}

impl From<&Key> for KeyState {
    fn from(key: &Key) -> Self {
        Self::new(key)
    }
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyState({:02x?})", self.bytes)
    }
}

impl PartialEq for KeyState {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for KeyState {}

impl PartialOrd for KeyState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl Hash for KeyState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.state_hash());
    }
}

impl PartialEq<Key> for KeyState {
    fn eq(&self, other: &Key) -> bool {
        *self.bytes == *other.bytes
    }
}

impl PartialEq<KeyState> for Key {
    fn eq(&self, other: &KeyState) -> bool {
        *self.bytes == *other.bytes
    }
}

impl PartialOrd<Key> for KeyState {
    fn partial_cmp(&self, other: &Key) -> Option<Ordering> {
        Some(self.bytes.as_ref().cmp(other.bytes.as_slice()))
    }
}

impl PartialOrd<KeyState> for Key {
    fn partial_cmp(&self, other: &KeyState) -> Option<Ordering> {
        Some(self.bytes.as_slice().cmp(other.bytes.as_ref()))
    }
}

/// A range-tombstone payload: the upper bound of a deleted key range,
/// stored with its common prefix elided against a base key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AntiValue {
    elision: u16,
    suffix: Box<[u8]>,
}

impl AntiValue {
    /// Bytes of the serialized form in front of the suffix.
    pub const OVERHEAD: usize = 2;

    /// Encode the upper bound `key2` against the base `key1`: the elision
    /// count is the length of their common prefix, and only the remainder
    /// of `key2` is kept.
    pub fn between(key1: &Key, key2: &Key) -> Result<Self, KeyError> {
        let elision = key1
            .encoded()
            .iter()
            .zip(key2.encoded())
            .take_while(|(a, b)| a == b)
            .count();
        Self::from_parts(elision as u16, &key2.encoded()[elision..])
    }

    pub fn from_parts(elision: u16, suffix: &[u8]) -> Result<Self, KeyError> {
        if elision as usize + suffix.len() > MAX_KEY_LENGTH {
            return Err(invalid("anti-value bound exceeds maximum key length"));
        }
        Ok(Self {
            elision,
            suffix: suffix.into(),
        })
    }

    pub fn elision(&self) -> u16 {
        self.elision
    }

    pub fn suffix(&self) -> &[u8] {
        &self.suffix
    }

    /// Serialize as `{elisionCount:u16 LE, suffixBytes}`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.elision.to_le_bytes());
        out.extend_from_slice(&self.suffix);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() < Self::OVERHEAD {
            return Err(invalid("anti-value payload shorter than its header"));
        }
        let elision = u16::from_le_bytes([bytes[0], bytes[1]]);
        Self::from_parts(elision, &bytes[Self::OVERHEAD..])
    }

    /// Reconstruct the full upper bound into `dest`:
    /// `dest = base[..elision] ++ suffix`.
    pub fn fix_up(&self, base: &Key, dest: &mut Key) -> Result<(), KeyError> {
        let elision = self.elision as usize;
        if elision > base.len() {
            return Err(invalid("anti-value elides more bytes than the base key has"));
        }
        if elision + self.suffix.len() > MAX_KEY_LENGTH {
            return Err(invalid("anti-value bound exceeds maximum key length"));
        }
        dest.bytes.clear();
        dest.bytes.extend_from_slice(&base.encoded()[..elision]);
        dest.bytes.extend_from_slice(&self.suffix);
        Ok(())
    }
}
