//! Advisory messages emitted by the server during a transcode.
//!
//! A message never alters protocol state (except when its fields ride an
//! ABORT packet) and never raises on the client: it is forwarded to the
//! registered handler or silently dropped.

/// Severity of a message, stored in the high nibble of the code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
}

impl Severity {
    /// Extract the severity nibble from a message code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code >> 12 & 0xF {
            1 => Some(Self::Info),
            2 => Some(Self::Warn),
            3 => Some(Self::Error),
            4 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Well-known message codes.
pub mod codes {
    /// The operation was aborted on request.
    pub const INFO_ABORT: u16 = 0x1001;
    /// A resource URI sent by the peer could not be parsed.
    pub const WARN_BAD_RESOURCE_URI: u16 = 0x2001;
    /// A base URI could not be parsed.
    pub const WARN_BAD_BASE_URI: u16 = 0x2002;
    /// The main document URI could not be parsed.
    pub const ERROR_BAD_DOCUMENT_URI: u16 = 0x3001;
    /// An I/O failure while fetching or producing data.
    pub const ERROR_IO: u16 = 0x3002;
    /// An unexpected internal failure.
    pub const FATAL_UNEXPECTED: u16 = 0x4001;
}

/// A single advisory message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Severity in the high nibble, category in the remaining bits.
    pub code: u16,
    /// Human-readable text.
    pub text: String,
    /// Positional arguments the text was formatted from.
    pub args: Vec<String>,
}

impl Message {
    pub fn new(code: u16, text: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            code,
            text: text.into(),
            args,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        Severity::from_code(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_nibble() {
        assert_eq!(Severity::from_code(codes::INFO_ABORT), Some(Severity::Info));
        assert_eq!(
            Severity::from_code(codes::WARN_BAD_RESOURCE_URI),
            Some(Severity::Warn)
        );
        assert_eq!(Severity::from_code(codes::ERROR_IO), Some(Severity::Error));
        assert_eq!(
            Severity::from_code(codes::FATAL_UNEXPECTED),
            Some(Severity::Fatal)
        );
        assert_eq!(Severity::from_code(0x0001), None);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Fatal > Severity::Warn);
    }
}
