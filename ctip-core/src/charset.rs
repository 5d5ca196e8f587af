//! Session character encodings.
//!
//! The charset is negotiated once per session in the connection header and
//! applies to every string field on the wire. Strings are framed as a
//! 2-byte byte-length prefix (byte count, not character count) followed by
//! the encoded bytes.

use crate::error::CtipError;

/// Character encodings a session may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8 (the default for new sessions).
    #[default]
    Utf8,
    /// ISO-8859-1, a.k.a. Latin-1. Every byte is a valid code point.
    Latin1,
}

impl Charset {
    /// Resolve a charset label from the connection header.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "UTF-8" | "UTF8" => Some(Self::Utf8),
            "ISO-8859-1" | "ISO8859-1" | "LATIN-1" | "LATIN1" => Some(Self::Latin1),
            _ => None,
        }
    }

    /// The canonical label sent in the connection header.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Latin1 => "ISO-8859-1",
        }
    }

    /// Encode a string into this charset.
    pub fn encode(&self, s: &str) -> Result<Vec<u8>, CtipError> {
        match self {
            Self::Utf8 => Ok(s.as_bytes().to_vec()),
            Self::Latin1 => s
                .chars()
                .map(|c| {
                    u8::try_from(c as u32).map_err(|_| {
                        CtipError::Encoding(format!("{c:?} is not representable in ISO-8859-1"))
                    })
                })
                .collect(),
        }
    }

    /// Decode bytes from this charset.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, CtipError> {
        match self {
            Self::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| CtipError::Encoding(e.to_string())),
            Self::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}
