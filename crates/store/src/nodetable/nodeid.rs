//! Compact 64-bit node identifiers.
//!
//! The high byte is a tag:
//!
//! | Tag    | Meaning                                   | Low 56 bits                    |
//! |--------|-------------------------------------------|--------------------------------|
//! | `0x00` | Node table reference                      | Sequential table index         |
//! | `0x01` | Inline integer                            | Two's complement, sign-extended|
//! | `0x02` | Inline plain string of at most 6 bytes    | Length byte, then UTF-8 bytes  |
//!
//! Inline ids never touch the node table. Ids are stored big-endian so that
//! table references sort in allocation order inside index keys.

use std::fmt;

use super::Term;
use crate::error::{Error, Result};

const TAG_SHIFT: u32 = 56;
const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;

const TAG_TABLE: u8 = 0x00;
const TAG_INTEGER: u8 = 0x01;
const TAG_STRING: u8 = 0x02;

/// Longest plain literal stored inline.
pub const MAX_INLINE_STRING: usize = 6;

const INLINE_INT_MIN: i64 = -(1 << 55);
const INLINE_INT_MAX: i64 = (1 << 55) - 1;

/// Identifier of a term, either a node table reference or an inline value.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Width in bytes when stored in an index.
    pub const LEN: usize = 8;

    /// Reference to entry `index` of the node table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the index does not fit in 56 bits.
    pub fn table(index: u64) -> Result<Self> {
        if index > PAYLOAD_MASK {
            return Err(Error::Corrupted { reason: format!("node table index {index} overflows") });
        }
        Ok(Self(index))
    }

    /// Inline encoding of `term`, if it has one.
    pub fn inline(term: &Term) -> Option<Self> {
        match term {
            Term::Integer(value) if (INLINE_INT_MIN..=INLINE_INT_MAX).contains(value) => {
                let payload = (*value as u64) & PAYLOAD_MASK;
                Some(Self((u64::from(TAG_INTEGER) << TAG_SHIFT) | payload))
            },
            Term::Literal { lexical, datatype: None, language: None }
                if lexical.len() <= MAX_INLINE_STRING =>
            {
                let mut bytes = [0u8; 8];
                bytes[0] = TAG_STRING;
                bytes[1] = lexical.len() as u8;
                bytes[2..2 + lexical.len()].copy_from_slice(lexical.as_bytes());
                Some(Self(u64::from_be_bytes(bytes)))
            },
            _ => None,
        }
    }

    /// Raw 64-bit value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    fn tag(&self) -> u8 {
        (self.0 >> TAG_SHIFT) as u8
    }

    /// Returns true for inline ids.
    pub fn is_inline(&self) -> bool {
        self.tag() != TAG_TABLE
    }

    /// Node table index, for table references.
    pub fn index(&self) -> Option<u64> {
        (self.tag() == TAG_TABLE).then_some(self.0)
    }

    /// Decodes an inline id back into its term.
    ///
    /// Returns `None` for table references and unknown tags.
    pub fn decode_inline(&self) -> Option<Term> {
        match self.tag() {
            TAG_INTEGER => {
                let value = ((self.0 << 8) as i64) >> 8;
                Some(Term::Integer(value))
            },
            TAG_STRING => {
                let bytes = self.0.to_be_bytes();
                let len = bytes[1] as usize;
                if len > MAX_INLINE_STRING {
                    return None;
                }
                let lexical = std::str::from_utf8(&bytes[2..2 + len]).ok()?;
                Some(Term::plain(lexical))
            },
            _ => None,
        }
    }

    /// Big-endian bytes for use in index keys.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Reads an id from the first eight bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if fewer than eight bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 8] = bytes
            .get(..Self::LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Corrupted {
                reason: format!("node id needs 8 bytes, got {}", bytes.len()),
            })?;
        Ok(Self(u64::from_be_bytes(raw)))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            TAG_TABLE => write!(f, "NodeId({})", self.0),
            _ => write!(f, "NodeId({:#018x})", self.0),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_integers() {
        for value in [0, 1, -1, 42, INLINE_INT_MIN, INLINE_INT_MAX] {
            let id = NodeId::inline(&Term::Integer(value)).unwrap();
            assert!(id.is_inline());
            assert_eq!(id.decode_inline(), Some(Term::Integer(value)));
        }
        assert!(NodeId::inline(&Term::Integer(INLINE_INT_MAX + 1)).is_none());
        assert!(NodeId::inline(&Term::Integer(i64::MIN)).is_none());
    }

    #[test]
    fn test_inline_short_strings() {
        for lexical in ["", "a", "hello", "héllo"] {
            let term = Term::plain(lexical);
            let id = NodeId::inline(&term).unwrap();
            assert_eq!(id.decode_inline(), Some(term));
        }
        assert!(NodeId::inline(&Term::plain("toolong")).is_none());
        assert!(NodeId::inline(&Term::lang("hi", "en")).is_none());
        assert!(NodeId::inline(&Term::iri("x")).is_none());
    }

    #[test]
    fn test_table_references() {
        let id = NodeId::table(7).unwrap();
        assert!(!id.is_inline());
        assert_eq!(id.index(), Some(7));
        assert_eq!(id.decode_inline(), None);
        assert!(NodeId::table(1 << 56).is_err());
    }

    #[test]
    fn test_table_ids_sort_by_index() {
        let a = NodeId::table(1).unwrap().to_bytes();
        let b = NodeId::table(256).unwrap().to_bytes();
        assert!(a < b);
        assert_eq!(NodeId::from_bytes(&b).unwrap(), NodeId::table(256).unwrap());
        assert!(NodeId::from_bytes(&b[..4]).is_err());
    }
}
