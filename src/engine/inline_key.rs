//! GRIDCORE - Inline Key Encoder
//! Classifies keys and packs eligible ones into fixed inline slots
//! so the entry does not need a separate key allocation.
//!
//! ## Inline String Layout
//! Strings are packed into one or two little-endian `u64` slots.
//! ```text
//! byte-encoded: [len: u8][c0][c1]...      (7 chars per 1 slot, 15 per 2)
//! char-encoded: [len: u16][u0][u1]...     (3 units per 1 slot, 7 per 2)
//! ```
//! Byte encoding is used when every char is ASCII; otherwise UTF-16 units.

use std::fmt;

use crate::config::InlineKeyPolicy;
use crate::types::{hash_int, hash_long, hash_str_bytes, hash_uuid, Key};
use uuid::Uuid;

/// Bytes of string payload that fit one slot when byte-encoded.
const ONE_SLOT_BYTES: usize = 7;
/// UTF-16 units of string payload that fit one slot when char-encoded.
const ONE_SLOT_CHARS: usize = 3;

/// How an inline string stores its characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringEncoding {
    /// One byte per char (all chars ASCII).
    Byte,
    /// One UTF-16 unit per char.
    Char,
}

/// The runtime shape of a key, as it affects the entry representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyShape {
    Int,
    Long,
    Uuid,
    /// Short string in one slot.
    String1,
    /// Short string in two slots.
    String2,
    /// Reference-held key.
    Object,
}

impl KeyShape {
    /// Suffix used in representation names.
    pub fn suffix(&self) -> &'static str {
        match self {
            KeyShape::Int => "IntKey",
            KeyShape::Long => "LongKey",
            KeyShape::Uuid => "UUIDKey",
            KeyShape::String1 => "StringKey1",
            KeyShape::String2 => "StringKey2",
            KeyShape::Object => "ObjectKey",
        }
    }
}

/// Result of classifying a key: which inline layout it will use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingPlan {
    Int,
    Long,
    Uuid,
    String1(StringEncoding),
    String2(StringEncoding),
    /// Not inlinable; the entry holds the key by reference.
    Reference,
}

impl EncodingPlan {
    pub fn shape(&self) -> KeyShape {
        match self {
            EncodingPlan::Int => KeyShape::Int,
            EncodingPlan::Long => KeyShape::Long,
            EncodingPlan::Uuid => KeyShape::Uuid,
            EncodingPlan::String1(_) => KeyShape::String1,
            EncodingPlan::String2(_) => KeyShape::String2,
            EncodingPlan::Reference => KeyShape::Object,
        }
    }

    pub fn is_inline(&self) -> bool {
        !matches!(self, EncodingPlan::Reference)
    }
}

/// Classify a key under the given policy.
///
/// Pure and total: depends only on the key value and the policy.
pub fn classify(key: &Key, policy: &InlineKeyPolicy) -> EncodingPlan {
    if !policy.enabled {
        return EncodingPlan::Reference;
    }
    match key {
        Key::Int(_) => EncodingPlan::Int,
        Key::Long(_) => EncodingPlan::Long,
        Key::Uuid(_) => EncodingPlan::Uuid,
        Key::Str(s) => classify_str(s, policy),
        Key::Object(_) => EncodingPlan::Reference,
    }
}

fn classify_str(s: &str, policy: &InlineKeyPolicy) -> EncodingPlan {
    if s.is_ascii() {
        let len = s.len();
        if len > policy.max_byte_len {
            return EncodingPlan::Reference;
        }
        return if len <= ONE_SLOT_BYTES {
            EncodingPlan::String1(StringEncoding::Byte)
        } else {
            EncodingPlan::String2(StringEncoding::Byte)
        };
    }

    let units = s.encode_utf16().take(policy.max_char_len + 1).count();
    if units > policy.max_char_len {
        EncodingPlan::Reference
    } else if units <= ONE_SLOT_CHARS {
        EncodingPlan::String1(StringEncoding::Char)
    } else {
        EncodingPlan::String2(StringEncoding::Char)
    }
}

/// A key as stored inside a region entry.
#[derive(Clone, PartialEq, Eq)]
pub enum InlineKey {
    Int(i32),
    Long(i64),
    Uuid { msb: u64, lsb: u64 },
    String1 { slot: u64, encoding: StringEncoding },
    String2 { slots: [u64; 2], encoding: StringEncoding },
    Reference(Box<Key>),
}

impl InlineKey {
    /// Encode `key` following `plan`.
    /// A plan that does not fit the key falls back to a reference.
    pub fn encode(key: Key, plan: EncodingPlan) -> Self {
        match (plan, key) {
            (EncodingPlan::Int, Key::Int(v)) => InlineKey::Int(v),
            (EncodingPlan::Long, Key::Long(v)) => InlineKey::Long(v),
            (EncodingPlan::Uuid, Key::Uuid(u)) => {
                let (msb, lsb) = u.as_u64_pair();
                InlineKey::Uuid { msb, lsb }
            }
            (EncodingPlan::String1(encoding), Key::Str(s)) if fits(&s, encoding, 1) => {
                let slots = pack_str(&s, encoding);
                InlineKey::String1 {
                    slot: slots[0],
                    encoding,
                }
            }
            (EncodingPlan::String2(encoding), Key::Str(s)) if fits(&s, encoding, 2) => {
                InlineKey::String2 {
                    slots: pack_str(&s, encoding),
                    encoding,
                }
            }
            (_, key) => InlineKey::Reference(Box::new(key)),
        }
    }

    /// Classify and encode in one step.
    pub fn from_key(key: Key, policy: &InlineKeyPolicy) -> Self {
        let plan = classify(&key, policy);
        Self::encode(key, plan)
    }

    pub fn shape(&self) -> KeyShape {
        match self {
            InlineKey::Int(_) => KeyShape::Int,
            InlineKey::Long(_) => KeyShape::Long,
            InlineKey::Uuid { .. } => KeyShape::Uuid,
            InlineKey::String1 { .. } => KeyShape::String1,
            InlineKey::String2 { .. } => KeyShape::String2,
            InlineKey::Reference(_) => KeyShape::Object,
        }
    }

    pub fn is_inline(&self) -> bool {
        !matches!(self, InlineKey::Reference(_))
    }

    /// Decode back to an owned key.
    pub fn to_key(&self) -> Key {
        match self {
            InlineKey::Int(v) => Key::Int(*v),
            InlineKey::Long(v) => Key::Long(*v),
            InlineKey::Uuid { msb, lsb } => Key::Uuid(Uuid::from_u64_pair(*msb, *lsb)),
            InlineKey::String1 { slot, encoding } => Key::Str(unpack_str(&[*slot, 0], *encoding)),
            InlineKey::String2 { slots, encoding } => Key::Str(unpack_str(slots, *encoding)),
            InlineKey::Reference(key) => (**key).clone(),
        }
    }

    /// Compare against a lookup key without decoding.
    pub fn matches(&self, key: &Key) -> bool {
        match (self, key) {
            (InlineKey::Int(a), Key::Int(b)) => a == b,
            (InlineKey::Long(a), Key::Long(b)) => a == b,
            (InlineKey::Uuid { msb, lsb }, Key::Uuid(u)) => u.as_u64_pair() == (*msb, *lsb),
            (InlineKey::String1 { slot, encoding }, Key::Str(s)) => {
                str_matches(&[*slot, 0], *encoding, s)
            }
            (InlineKey::String2 { slots, encoding }, Key::Str(s)) => {
                str_matches(slots, *encoding, s)
            }
            (InlineKey::Reference(own), other) => own.as_ref() == other,
            _ => false,
        }
    }

    /// Same value as `Key::hash64` on the decoded key. Never allocates.
    pub fn hash64(&self) -> u64 {
        match self {
            InlineKey::Int(v) => hash_int(*v),
            InlineKey::Long(v) => hash_long(*v),
            InlineKey::Uuid { msb, lsb } => hash_uuid(*msb, *lsb),
            InlineKey::String1 { slot, encoding } => {
                with_utf8(&[*slot, 0], *encoding, hash_str_bytes)
            }
            InlineKey::String2 { slots, encoding } => with_utf8(slots, *encoding, hash_str_bytes),
            InlineKey::Reference(key) => key.hash64(),
        }
    }

    /// Bytes held outside the entry for this key.
    pub fn heap_size(&self) -> usize {
        match self {
            InlineKey::Reference(key) => std::mem::size_of::<Key>() + key.heap_size(),
            _ => 0,
        }
    }
}

impl fmt::Debug for InlineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.shape().suffix(), self.to_key())
    }
}

fn fits(s: &str, encoding: StringEncoding, slots: usize) -> bool {
    match encoding {
        StringEncoding::Byte => s.is_ascii() && s.len() < slots * 8,
        StringEncoding::Char => s.encode_utf16().count() < slots * 4,
    }
}

fn pack_str(s: &str, encoding: StringEncoding) -> [u64; 2] {
    let mut buf = [0u8; 16];
    match encoding {
        StringEncoding::Byte => {
            buf[0] = s.len() as u8;
            buf[1..=s.len()].copy_from_slice(s.as_bytes());
        }
        StringEncoding::Char => {
            let mut units = 0usize;
            for (i, unit) in s.encode_utf16().enumerate() {
                let at = (i + 1) * 2;
                buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
                units += 1;
            }
            buf[0..2].copy_from_slice(&(units as u16).to_le_bytes());
        }
    }
    [
        u64::from_le_bytes(buf[0..8].try_into().unwrap_or([0; 8])),
        u64::from_le_bytes(buf[8..16].try_into().unwrap_or([0; 8])),
    ]
}

fn slot_bytes(slots: &[u64; 2]) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&slots[0].to_le_bytes());
    buf[8..16].copy_from_slice(&slots[1].to_le_bytes());
    buf
}

fn slot_units(slots: &[u64; 2]) -> [u16; 8] {
    let buf = slot_bytes(slots);
    let mut units = [0u16; 8];
    for (i, unit) in units.iter_mut().enumerate() {
        *unit = u16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]]);
    }
    units
}

fn unpack_str(slots: &[u64; 2], encoding: StringEncoding) -> String {
    match encoding {
        StringEncoding::Byte => {
            let buf = slot_bytes(slots);
            let len = (buf[0] as usize).min(15);
            buf[1..=len].iter().map(|&b| b as char).collect()
        }
        StringEncoding::Char => {
            let units = slot_units(slots);
            let len = (units[0] as usize).min(7);
            String::from_utf16_lossy(&units[1..=len])
        }
    }
}

/// Hand the UTF-8 form of an inline string to `f`, decoded on the stack.
fn with_utf8<T>(slots: &[u64; 2], encoding: StringEncoding, f: impl FnOnce(&[u8]) -> T) -> T {
    match encoding {
        StringEncoding::Byte => {
            let buf = slot_bytes(slots);
            let len = (buf[0] as usize).min(15);
            f(&buf[1..=len])
        }
        StringEncoding::Char => {
            let units = slot_units(slots);
            let len = (units[0] as usize).min(7);
            // At most 7 units, 3 bytes each.
            let mut out = [0u8; 32];
            let mut n = 0;
            for c in char::decode_utf16(units[1..=len].iter().copied()) {
                let c = c.unwrap_or(char::REPLACEMENT_CHARACTER);
                n += c.encode_utf8(&mut out[n..]).len();
            }
            f(&out[..n])
        }
    }
}

fn str_matches(slots: &[u64; 2], encoding: StringEncoding, s: &str) -> bool {
    match encoding {
        StringEncoding::Byte => {
            let buf = slot_bytes(slots);
            let len = (buf[0] as usize).min(15);
            s.len() == len && s.as_bytes() == &buf[1..=len]
        }
        StringEncoding::Char => {
            let units = slot_units(slots);
            let len = (units[0] as usize).min(7);
            s.encode_utf16().eq(units[1..=len].iter().copied())
        }
    }
}
