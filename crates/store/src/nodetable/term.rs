//! Minimal term model and its byte encoding.
//!
//! The RDF data model proper lives outside the engine; the node table only
//! needs terms to be hashable, comparable and serializable.
//!
//! ```text
//! Iri      0x01 varint(len) utf8
//! Blank    0x02 varint(len) utf8
//! Literal  0x03 flags varint(len) utf8 [varint(len) datatype] [varint(len) language]
//! Integer  0x04 varint(zigzag(value))
//! ```

use std::fmt;

use crate::error::{Error, Result};

const TAG_IRI: u8 = 0x01;
const TAG_BLANK: u8 = 0x02;
const TAG_LITERAL: u8 = 0x03;
const TAG_INTEGER: u8 = 0x04;

const HAS_DATATYPE: u8 = 0x01;
const HAS_LANGUAGE: u8 = 0x02;

/// A value stored in the node table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// An IRI.
    Iri(String),
    /// A blank node label.
    Blank(String),
    /// A literal with optional datatype IRI or language tag.
    Literal {
        /// Lexical form.
        lexical: String,
        /// Datatype IRI.
        datatype: Option<String>,
        /// Language tag.
        language: Option<String>,
    },
    /// An integer value.
    Integer(i64),
}

impl Term {
    /// An IRI term.
    pub fn iri(value: impl Into<String>) -> Self {
        Self::Iri(value.into())
    }

    /// A blank node.
    pub fn blank(label: impl Into<String>) -> Self {
        Self::Blank(label.into())
    }

    /// A plain literal.
    pub fn plain(lexical: impl Into<String>) -> Self {
        Self::Literal { lexical: lexical.into(), datatype: None, language: None }
    }

    /// A typed literal.
    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self::Literal { lexical: lexical.into(), datatype: Some(datatype.into()), language: None }
    }

    /// A language-tagged literal.
    pub fn lang(lexical: impl Into<String>, language: impl Into<String>) -> Self {
        Self::Literal { lexical: lexical.into(), datatype: None, language: Some(language.into()) }
    }

    /// Encodes the term.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Term::Iri(value) => {
                buf.push(TAG_IRI);
                write_str(&mut buf, value);
            },
            Term::Blank(label) => {
                buf.push(TAG_BLANK);
                write_str(&mut buf, label);
            },
            Term::Literal { lexical, datatype, language } => {
                buf.push(TAG_LITERAL);
                let mut flags = 0;
                if datatype.is_some() {
                    flags |= HAS_DATATYPE;
                }
                if language.is_some() {
                    flags |= HAS_LANGUAGE;
                }
                buf.push(flags);
                write_str(&mut buf, lexical);
                if let Some(datatype) = datatype {
                    write_str(&mut buf, datatype);
                }
                if let Some(language) = language {
                    write_str(&mut buf, language);
                }
            },
            Term::Integer(value) => {
                buf.push(TAG_INTEGER);
                write_varint(&mut buf, zigzag(*value));
            },
        }
        buf
    }

    /// Decodes a term produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for truncated or malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let tag = *bytes.first().ok_or_else(|| corrupted("empty term"))?;
        pos += 1;
        let term = match tag {
            TAG_IRI => Term::Iri(read_str(bytes, &mut pos)?),
            TAG_BLANK => Term::Blank(read_str(bytes, &mut pos)?),
            TAG_LITERAL => {
                let flags = *bytes.get(pos).ok_or_else(|| corrupted("literal flags missing"))?;
                pos += 1;
                let lexical = read_str(bytes, &mut pos)?;
                let datatype =
                    if flags & HAS_DATATYPE != 0 { Some(read_str(bytes, &mut pos)?) } else { None };
                let language =
                    if flags & HAS_LANGUAGE != 0 { Some(read_str(bytes, &mut pos)?) } else { None };
                Term::Literal { lexical, datatype, language }
            },
            TAG_INTEGER => Term::Integer(unzigzag(read_varint(bytes, &mut pos)?)),
            other => return Err(corrupted(&format!("unknown term tag {other:#04x}"))),
        };
        if pos != bytes.len() {
            return Err(corrupted("trailing bytes after term"));
        }
        Ok(term)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(value) => write!(f, "<{value}>"),
            Term::Blank(label) => write!(f, "_:{label}"),
            Term::Literal { lexical, datatype: Some(datatype), .. } => {
                write!(f, "{lexical:?}^^<{datatype}>")
            },
            Term::Literal { lexical, language: Some(language), .. } => {
                write!(f, "{lexical:?}@{language}")
            },
            Term::Literal { lexical, .. } => write!(f, "{lexical:?}"),
            Term::Integer(value) => write!(f, "{value}"),
        }
    }
}

fn corrupted(reason: &str) -> Error {
    Error::Corrupted { reason: format!("term encoding: {reason}") }
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

fn read_str(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(bytes, pos)? as usize;
    let end = pos.checked_add(len).filter(|end| *end <= bytes.len());
    let Some(end) = end else {
        return Err(corrupted("string runs past the end"));
    };
    let value = std::str::from_utf8(&bytes[*pos..end]).map_err(|_| corrupted("invalid UTF-8"))?;
    *pos = end;
    Ok(value.to_string())
}

/// Appends an unsigned LEB128 varint.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Reads an unsigned LEB128 varint at `pos`, advancing it.
pub(crate) fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *bytes.get(*pos).ok_or_else(|| corrupted("varint truncated"))?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(corrupted("varint too long"))
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
